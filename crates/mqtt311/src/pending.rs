//! In-flight operation tracking for the session state machine.
//!
//! Every `QoS` > 0 publish and every subscribe/unsubscribe request parks
//! an entry here, keyed by packet identifier, until the matching
//! acknowledgement arrives, the retry budget runs out, or the session is
//! torn down. Each entry owns the oneshot responder of its caller and
//! resolves it exactly once.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use mqtt311_protocol::packet::{PublishPacket, TopicFilter};
use mqtt311_protocol::Result;

use crate::client::SubscribeGrant;

/// Which acknowledgement a pending publish is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishStage {
    /// `QoS` 1: PUBLISH sent, waiting for PUBACK.
    AwaitingAck,
    /// `QoS` 2: PUBLISH sent, waiting for PUBREC.
    AwaitingRec,
    /// `QoS` 2: PUBREL sent, waiting for PUBCOMP.
    AwaitingComp,
}

pub(crate) struct PendingPublish {
    /// Original packet, re-sent with DUP while waiting for PUBACK/PUBREC.
    pub packet: PublishPacket,
    pub stage: PublishStage,
    pub deadline: Instant,
    /// Sends of the current leg, the initial transmission included.
    pub attempts: u32,
    pub ack: oneshot::Sender<Result<()>>,
}

pub(crate) struct PendingSubscribe {
    pub filters: Vec<TopicFilter>,
    pub deadline: Instant,
    pub ack: oneshot::Sender<Result<Vec<SubscribeGrant>>>,
}

pub(crate) struct PendingUnsubscribe {
    pub filters: Vec<String>,
    pub deadline: Instant,
    pub ack: oneshot::Sender<Result<()>>,
}

pub(crate) enum PendingOp {
    Publish(PendingPublish),
    Subscribe(PendingSubscribe),
    Unsubscribe(PendingUnsubscribe),
}

impl PendingOp {
    fn deadline(&self) -> Instant {
        match self {
            PendingOp::Publish(p) => p.deadline,
            PendingOp::Subscribe(s) => s.deadline,
            PendingOp::Unsubscribe(u) => u.deadline,
        }
    }
}

/// Table of pending operations keyed by packet identifier.
#[derive(Default)]
pub(crate) struct PendingOps {
    ops: HashMap<u16, PendingOp>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, packet_id: u16, op: PendingOp) {
        debug_assert!(!self.ops.contains_key(&packet_id));
        self.ops.insert(packet_id, op);
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<PendingOp> {
        self.ops.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Earliest deadline across all entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ops.values().map(PendingOp::deadline).min()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u16, PendingOp)> {
        let expired_ids: Vec<u16> = self
            .ops
            .iter()
            .filter(|(_, op)| op.deadline() <= now)
            .map(|(id, _)| *id)
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.ops.remove(&id).map(|op| (id, op)))
            .collect()
    }

    /// Remove and return everything (session teardown).
    pub fn drain(&mut self) -> Vec<(u16, PendingOp)> {
        self.ops.drain().collect()
    }
}

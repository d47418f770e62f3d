//! The session state machine.
//!
//! One task owns every piece of mutable session state: the connection
//! lifecycle, the packet-identifier pool, the pending-operation table,
//! and the subscription registry. It is fed by two queues — commands from
//! [`crate::client::MqttClient`] handles and decoded packets from the
//! dedicated reader task — and folds its timers (connect timeout,
//! keep-alive, acknowledgement retries) into the same `select!` loop, so
//! nothing mutates session state from another task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use mqtt311_protocol::packet::{
    ConnAckPacket, ConnectPacket, PubAckPacket, PubRecPacket, PubRelPacket, PubCompPacket,
    PublishPacket, SubAckPacket, SubscribePacket, TopicFilter, UnsubscribePacket,
};
use mqtt311_protocol::{
    codec, topic, MqttError, Packet, PacketDecoder, PacketIdAllocator, QoS, Result,
    SubscriptionEntry, SubscriptionRegistry,
};

use crate::client::{ConnectAck, PublishHandle, SubscribeGrant};
use crate::events::{ConnectionState, EventDispatcher, InboundMessage};
use crate::options::{ConnectOptions, RetryPolicy};
use crate::pending::{
    PendingOp, PendingOps, PendingPublish, PendingSubscribe, PendingUnsubscribe, PublishStage,
};
use crate::transport::{self, Stream};

const READ_BUFFER_SIZE: usize = 4096;
const PACKET_QUEUE_DEPTH: usize = 32;

/// Requests serialized from client handles into the session task.
pub(crate) enum Command {
    Connect {
        options: Box<ConnectOptions>,
        resp: oneshot::Sender<Result<ConnectAck>>,
    },
    Disconnect {
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<Result<PublishHandle>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        resp: oneshot::Sender<Result<Vec<SubscribeGrant>>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscriptions {
        resp: oneshot::Sender<Vec<SubscriptionEntry>>,
    },
    State {
        resp: oneshot::Sender<ConnectionState>,
    },
}

struct ConnectWaiter {
    resp: oneshot::Sender<Result<ConnectAck>>,
    deadline: Instant,
}

enum Tick {
    Command(Option<Command>),
    Packet(Option<Result<Packet>>),
    Deadline,
}

pub(crate) struct SessionLoop {
    commands: mpsc::Receiver<Command>,
    dispatcher: Arc<EventDispatcher>,
    state: ConnectionState,
    keep_alive: Duration,
    retry: RetryPolicy,
    writer: Option<WriteHalf<Stream>>,
    reader_task: Option<JoinHandle<()>>,
    packets: Option<mpsc::Receiver<Result<Packet>>>,
    packet_ids: PacketIdAllocator,
    pending: PendingOps,
    subscriptions: SubscriptionRegistry,
    connect_waiter: Option<ConnectWaiter>,
    /// Inbound `QoS` 2 publishes acknowledged with PUBREC, awaiting
    /// PUBREL. Suppresses duplicate delivery of DUP redeliveries.
    inbound_qos2: HashSet<u16>,
    last_write: Instant,
    /// Armed while a PINGREQ is outstanding.
    ping_deadline: Option<Instant>,
}

impl SessionLoop {
    pub(crate) fn new(commands: mpsc::Receiver<Command>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            commands,
            dispatcher,
            state: ConnectionState::Disconnected,
            keep_alive: Duration::ZERO,
            retry: RetryPolicy::default(),
            writer: None,
            reader_task: None,
            packets: None,
            packet_ids: PacketIdAllocator::new(),
            pending: PendingOps::new(),
            subscriptions: SubscriptionRegistry::new(),
            connect_waiter: None,
            inbound_qos2: HashSet::new(),
            last_write: Instant::now(),
            ping_deadline: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("session task started");
        loop {
            let deadline = self.next_deadline();
            let tick = {
                let commands = &mut self.commands;
                let packets = self.packets.as_mut();
                tokio::select! {
                    command = commands.recv() => Tick::Command(command),
                    packet = recv_packet(packets) => Tick::Packet(packet),
                    () = sleep_until_opt(deadline) => Tick::Deadline,
                }
            };

            match tick {
                Tick::Command(Some(command)) => self.handle_command(command).await,
                Tick::Command(None) => {
                    // Every client handle is gone; unwind like a disconnect.
                    self.shutdown(None).await;
                    break;
                }
                Tick::Packet(Some(Ok(packet))) => self.handle_packet(packet).await,
                Tick::Packet(Some(Err(err))) => self.handle_stream_error(err).await,
                Tick::Packet(None) => {
                    self.packets = None;
                    if self.state != ConnectionState::Disconnected {
                        self.handle_stream_error(MqttError::ConnectionClosedByPeer).await;
                    }
                }
                Tick::Deadline => self.handle_deadline(Instant::now()).await,
            }
        }
        debug!("session task finished");
    }

    // ===== commands =====

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { options, resp } => self.start_connect(*options, resp).await,
            Command::Disconnect { resp } => {
                self.disconnect().await;
                let _ = resp.send(Ok(()));
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => self.start_publish(topic, payload, qos, retain, resp).await,
            Command::Subscribe { filters, resp } => self.start_subscribe(filters, resp).await,
            Command::Unsubscribe { filters, resp } => self.start_unsubscribe(filters, resp).await,
            Command::Subscriptions { resp } => {
                let _ = resp.send(self.subscriptions.entries().to_vec());
            }
            Command::State { resp } => {
                let _ = resp.send(self.state);
            }
        }
    }

    async fn start_connect(
        &mut self,
        options: ConnectOptions,
        resp: oneshot::Sender<Result<ConnectAck>>,
    ) {
        if self.state != ConnectionState::Disconnected {
            let _ = resp.send(Err(MqttError::AlreadyConnected));
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.keep_alive = options.keep_alive;
        self.retry = options.retry;

        let stream = match transport::open(&options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.dispatcher.error(&err);
                self.set_state(ConnectionState::Disconnected);
                let _ = resp.send(Err(err));
                return;
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        self.reader_task = Some(tokio::spawn(reader_loop(read_half, packet_tx)));
        self.packets = Some(packet_rx);
        self.writer = Some(write_half);
        self.last_write = Instant::now();

        let connect = ConnectPacket {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_secs(),
            username: options.username.clone(),
            password: options.password.clone(),
        };

        self.connect_waiter = Some(ConnectWaiter {
            resp,
            deadline: Instant::now() + options.connect_timeout,
        });
        if let Err(err) = self.write_packet(&Packet::Connect(connect)).await {
            self.fail_connection(err).await;
            return;
        }
        debug!(client_id = %options.client_id, "CONNECT sent");
    }

    async fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Disconnecting);
                // DISCONNECT has no acknowledgement; best effort.
                let _ = self.write_packet(&Packet::Disconnect).await;
                self.shutdown(None).await;
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                self.shutdown(None).await;
            }
        }
    }

    async fn start_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<Result<PublishHandle>>,
    ) {
        if self.state != ConnectionState::Connected {
            let _ = resp.send(Err(MqttError::NotConnected));
            return;
        }
        if !topic::is_valid_topic_name(&topic) {
            let _ = resp.send(Err(MqttError::InvalidTopicName(topic)));
            return;
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            match self.packet_ids.allocate() {
                Some(id) => Some(id),
                None => {
                    let _ = resp.send(Err(MqttError::PacketIdExhausted));
                    return;
                }
            }
        };

        let packet = PublishPacket {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            packet_id,
        };
        if let Err(err) = self.write_packet(&Packet::Publish(packet.clone())).await {
            if let Some(id) = packet_id {
                self.packet_ids.release(id);
            }
            let _ = resp.send(Err(err.clone()));
            self.fail_connection(err).await;
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        match packet_id {
            None => {
                // QoS 0 is broker-visible as soon as it is written.
                let _ = ack_tx.send(Ok(()));
            }
            Some(id) => {
                trace!(packet_id = id, qos = ?qos, "publish in flight");
                self.dispatcher.publish_sent(id);
                let stage = if qos == QoS::AtLeastOnce {
                    PublishStage::AwaitingAck
                } else {
                    PublishStage::AwaitingRec
                };
                self.pending.insert(
                    id,
                    PendingOp::Publish(PendingPublish {
                        packet,
                        stage,
                        deadline: Instant::now() + self.retry.ack_timeout,
                        attempts: 1,
                        ack: ack_tx,
                    }),
                );
            }
        }
        let _ = resp.send(Ok(PublishHandle::new(packet_id, ack_rx)));
    }

    async fn start_subscribe(
        &mut self,
        filters: Vec<(String, QoS)>,
        resp: oneshot::Sender<Result<Vec<SubscribeGrant>>>,
    ) {
        if self.state != ConnectionState::Connected {
            let _ = resp.send(Err(MqttError::NotConnected));
            return;
        }
        if filters.is_empty() {
            let _ = resp.send(Err(MqttError::ProtocolError(
                "subscribe requires at least one filter".to_string(),
            )));
            return;
        }
        for (filter, _) in &filters {
            if !topic::is_valid_topic_filter(filter) {
                let _ = resp.send(Err(MqttError::InvalidTopicFilter(filter.clone())));
                return;
            }
        }

        let Some(packet_id) = self.packet_ids.allocate() else {
            let _ = resp.send(Err(MqttError::PacketIdExhausted));
            return;
        };
        let filters: Vec<TopicFilter> = filters
            .into_iter()
            .map(|(filter, qos)| TopicFilter { filter, qos })
            .collect();
        let packet = SubscribePacket {
            packet_id,
            filters: filters.clone(),
        };

        if let Err(err) = self.write_packet(&Packet::Subscribe(packet)).await {
            self.packet_ids.release(packet_id);
            let _ = resp.send(Err(err.clone()));
            self.fail_connection(err).await;
            return;
        }
        debug!(packet_id, count = filters.len(), "SUBSCRIBE sent");

        self.pending.insert(
            packet_id,
            PendingOp::Subscribe(PendingSubscribe {
                filters,
                deadline: Instant::now() + self.retry.ack_timeout,
                ack: resp,
            }),
        );
    }

    async fn start_unsubscribe(
        &mut self,
        filters: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    ) {
        if self.state != ConnectionState::Connected {
            let _ = resp.send(Err(MqttError::NotConnected));
            return;
        }
        if filters.is_empty() {
            let _ = resp.send(Err(MqttError::ProtocolError(
                "unsubscribe requires at least one filter".to_string(),
            )));
            return;
        }
        for filter in &filters {
            if !topic::is_valid_topic_filter(filter) {
                let _ = resp.send(Err(MqttError::InvalidTopicFilter(filter.clone())));
                return;
            }
        }

        let Some(packet_id) = self.packet_ids.allocate() else {
            let _ = resp.send(Err(MqttError::PacketIdExhausted));
            return;
        };
        let packet = UnsubscribePacket {
            packet_id,
            filters: filters.clone(),
        };

        if let Err(err) = self.write_packet(&Packet::Unsubscribe(packet)).await {
            self.packet_ids.release(packet_id);
            let _ = resp.send(Err(err.clone()));
            self.fail_connection(err).await;
            return;
        }
        debug!(packet_id, count = filters.len(), "UNSUBSCRIBE sent");

        self.pending.insert(
            packet_id,
            PendingOp::Unsubscribe(PendingUnsubscribe {
                filters,
                deadline: Instant::now() + self.retry.ack_timeout,
                ack: resp,
            }),
        );
    }

    // ===== inbound packets =====

    async fn handle_packet(&mut self, packet: Packet) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        match packet {
            Packet::ConnAck(ack) => self.handle_connack(ack).await,
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::PubAck(ack) => self.handle_puback(ack.packet_id),
            Packet::PubRec(rec) => self.handle_pubrec(rec.packet_id).await,
            Packet::PubRel(rel) => self.handle_pubrel(rel.packet_id).await,
            Packet::PubComp(comp) => self.handle_pubcomp(comp.packet_id),
            Packet::SubAck(suback) => self.handle_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_unsuback(unsuback.packet_id),
            Packet::PingResp => {
                trace!("PINGRESP received");
                self.ping_deadline = None;
            }
            Packet::Disconnect => {
                // Brokers do not send DISCONNECT in 3.1.1; treat it as the
                // peer closing the stream.
                self.handle_stream_error(MqttError::ConnectionClosedByPeer).await;
            }
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PingReq => {
                warn!(packet = ?packet.packet_type(), "ignoring broker-bound packet from broker");
            }
        }
    }

    async fn handle_connack(&mut self, ack: ConnAckPacket) {
        let Some(waiter) = self.connect_waiter.take() else {
            warn!("CONNACK outside of a connect attempt");
            return;
        };
        if ack.return_code.is_accepted() {
            debug!(session_present = ack.session_present, "connection accepted");
            self.set_state(ConnectionState::Connected);
            let _ = waiter.resp.send(Ok(ConnectAck {
                session_present: ack.session_present,
            }));
        } else {
            let err = MqttError::ConnectRefused(ack.return_code);
            self.dispatcher.error(&err);
            self.shutdown(None).await;
            let _ = waiter.resp.send(Err(err));
        }
    }

    async fn handle_inbound_publish(&mut self, publish: PublishPacket) {
        match publish.qos {
            QoS::AtMostOnce => self.deliver(publish),
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return;
                };
                if !self.send_or_fail(Packet::PubAck(PubAckPacket::new(packet_id))).await {
                    return;
                }
                self.deliver(publish);
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return;
                };
                let first_delivery = self.inbound_qos2.insert(packet_id);
                if !self.send_or_fail(Packet::PubRec(PubRecPacket::new(packet_id))).await {
                    return;
                }
                if first_delivery {
                    self.deliver(publish);
                } else {
                    trace!(packet_id, "suppressed duplicate QoS 2 delivery");
                }
            }
        }
    }

    fn deliver(&self, publish: PublishPacket) {
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        trace!(topic = %message.topic, len = message.payload.len(), "delivering message");
        self.dispatcher.message(&message);
    }

    fn handle_puback(&mut self, packet_id: u16) {
        match self.pending.remove(packet_id) {
            Some(PendingOp::Publish(publish)) if publish.stage == PublishStage::AwaitingAck => {
                self.packet_ids.release(packet_id);
                self.dispatcher.publish_acked(packet_id);
                let _ = publish.ack.send(Ok(()));
            }
            Some(other) => {
                warn!(packet_id, "PUBACK does not match the pending operation");
                self.pending.insert(packet_id, other);
            }
            None => warn!(packet_id, "PUBACK for unknown packet identifier"),
        }
    }

    async fn handle_pubrec(&mut self, packet_id: u16) {
        let send_pubrel = match self.pending.remove(packet_id) {
            Some(PendingOp::Publish(mut publish)) if publish.stage == PublishStage::AwaitingRec => {
                publish.stage = PublishStage::AwaitingComp;
                publish.attempts = 1;
                publish.deadline = Instant::now() + self.retry.ack_timeout;
                self.pending.insert(packet_id, PendingOp::Publish(publish));
                true
            }
            Some(PendingOp::Publish(publish)) if publish.stage == PublishStage::AwaitingComp => {
                // Duplicate PUBREC: our PUBREL was lost, answer again.
                self.pending.insert(packet_id, PendingOp::Publish(publish));
                true
            }
            Some(other) => {
                warn!(packet_id, "PUBREC does not match the pending operation");
                self.pending.insert(packet_id, other);
                false
            }
            None => {
                warn!(packet_id, "PUBREC for unknown packet identifier");
                false
            }
        };
        if send_pubrel {
            self.send_or_fail(Packet::PubRel(PubRelPacket::new(packet_id))).await;
        }
    }

    async fn handle_pubrel(&mut self, packet_id: u16) {
        if !self.inbound_qos2.remove(&packet_id) {
            warn!(packet_id, "PUBREL for unknown packet identifier");
        }
        self.send_or_fail(Packet::PubComp(PubCompPacket::new(packet_id))).await;
    }

    fn handle_pubcomp(&mut self, packet_id: u16) {
        match self.pending.remove(packet_id) {
            Some(PendingOp::Publish(publish)) if publish.stage == PublishStage::AwaitingComp => {
                self.packet_ids.release(packet_id);
                self.dispatcher.publish_acked(packet_id);
                let _ = publish.ack.send(Ok(()));
            }
            Some(other) => {
                warn!(packet_id, "PUBCOMP does not match the pending operation");
                self.pending.insert(packet_id, other);
            }
            None => warn!(packet_id, "PUBCOMP for unknown packet identifier"),
        }
    }

    fn handle_suback(&mut self, suback: SubAckPacket) {
        match self.pending.remove(suback.packet_id) {
            Some(PendingOp::Subscribe(subscribe)) => {
                self.packet_ids.release(suback.packet_id);
                if suback.return_codes.len() != subscribe.filters.len() {
                    let err = MqttError::ProtocolError(format!(
                        "SUBACK carries {} return codes for {} filters",
                        suback.return_codes.len(),
                        subscribe.filters.len()
                    ));
                    self.dispatcher.error(&err);
                    let _ = subscribe.ack.send(Err(err));
                    return;
                }

                let mut grants = Vec::with_capacity(subscribe.filters.len());
                for (requested, &code) in subscribe.filters.iter().zip(&suback.return_codes) {
                    let granted = match SubAckPacket::granted_qos(code) {
                        Some(qos) => {
                            self.subscriptions
                                .add_or_update(&requested.filter, requested.qos, qos)
                                .ok();
                            Ok(qos)
                        }
                        None => Err(MqttError::SubscriptionFailed(requested.filter.clone())),
                    };
                    grants.push(SubscribeGrant {
                        filter: requested.filter.clone(),
                        granted,
                    });
                }
                debug!(packet_id = suback.packet_id, "SUBACK applied");
                let _ = subscribe.ack.send(Ok(grants));
            }
            Some(other) => {
                warn!(packet_id = suback.packet_id, "SUBACK does not match the pending operation");
                self.pending.insert(suback.packet_id, other);
            }
            None => warn!(packet_id = suback.packet_id, "SUBACK for unknown packet identifier"),
        }
    }

    fn handle_unsuback(&mut self, packet_id: u16) {
        match self.pending.remove(packet_id) {
            Some(PendingOp::Unsubscribe(unsubscribe)) => {
                self.packet_ids.release(packet_id);
                for filter in &unsubscribe.filters {
                    self.subscriptions.remove(filter);
                }
                debug!(packet_id, "UNSUBACK applied");
                let _ = unsubscribe.ack.send(Ok(()));
            }
            Some(other) => {
                warn!(packet_id, "UNSUBACK does not match the pending operation");
                self.pending.insert(packet_id, other);
            }
            None => warn!(packet_id, "UNSUBACK for unknown packet identifier"),
        }
    }

    // ===== timers =====

    fn next_deadline(&self) -> Option<Instant> {
        let connect = self.connect_waiter.as_ref().map(|w| w.deadline);
        let keepalive = (self.state == ConnectionState::Connected && !self.keep_alive.is_zero())
            .then(|| self.ping_deadline.unwrap_or(self.last_write + self.keep_alive));
        [connect, self.pending.next_deadline(), keepalive]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle_deadline(&mut self, now: Instant) {
        if let Some(waiter) = &self.connect_waiter {
            if waiter.deadline <= now {
                let waiter = self.connect_waiter.take().expect("waiter checked above");
                let err = MqttError::ConnectTimeout;
                warn!("no CONNACK within the connect timeout");
                self.dispatcher.error(&err);
                self.shutdown(None).await;
                let _ = waiter.resp.send(Err(err));
                return;
            }
        }

        if self.state == ConnectionState::Connected && !self.keep_alive.is_zero() {
            if let Some(ping_deadline) = self.ping_deadline {
                if ping_deadline <= now {
                    self.fail_connection(MqttError::KeepAliveTimeout).await;
                    return;
                }
            } else if now >= self.last_write + self.keep_alive {
                trace!("keep-alive interval of outbound silence, sending PINGREQ");
                if !self.send_or_fail(Packet::PingReq).await {
                    return;
                }
                self.ping_deadline = Some(Instant::now() + self.keep_alive);
            }
        }

        for (packet_id, op) in self.pending.take_expired(now) {
            match op {
                PendingOp::Publish(mut publish) => {
                    if publish.attempts > self.retry.max_retries {
                        self.packet_ids.release(packet_id);
                        let err = MqttError::AckTimeout(packet_id);
                        warn!(packet_id, "publish retry budget exhausted");
                        self.dispatcher.error(&err);
                        let _ = publish.ack.send(Err(err));
                        continue;
                    }

                    let retransmit = match publish.stage {
                        PublishStage::AwaitingAck | PublishStage::AwaitingRec => {
                            let mut packet = publish.packet.clone();
                            packet.dup = true;
                            Packet::Publish(packet)
                        }
                        PublishStage::AwaitingComp => Packet::PubRel(PubRelPacket::new(packet_id)),
                    };
                    publish.attempts += 1;
                    publish.deadline = now + self.retry.ack_timeout;
                    trace!(packet_id, attempts = publish.attempts, "retransmitting publish leg");
                    self.pending.insert(packet_id, PendingOp::Publish(publish));
                    if !self.send_or_fail(retransmit).await {
                        return;
                    }
                }
                PendingOp::Subscribe(subscribe) => {
                    // Request/response pairs other than PUBLISH are not
                    // auto-retried; the timeout is the caller's to handle.
                    self.packet_ids.release(packet_id);
                    let err = MqttError::AckTimeout(packet_id);
                    self.dispatcher.error(&err);
                    let _ = subscribe.ack.send(Err(err));
                }
                PendingOp::Unsubscribe(unsubscribe) => {
                    self.packet_ids.release(packet_id);
                    let err = MqttError::AckTimeout(packet_id);
                    self.dispatcher.error(&err);
                    let _ = unsubscribe.ack.send(Err(err));
                }
            }
        }
    }

    // ===== teardown =====

    async fn handle_stream_error(&mut self, err: MqttError) {
        if matches!(err, MqttError::MalformedPacket(_)) {
            // Framing was recoverable; the bad frame has been skipped.
            warn!(error = %err, "discarded malformed packet");
            self.dispatcher.error(&err);
            return;
        }
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.fail_connection(err).await;
    }

    async fn fail_connection(&mut self, err: MqttError) {
        warn!(error = %err, "session failed");
        self.dispatcher.error(&err);
        self.shutdown(Some(err)).await;
    }

    /// Unwind the session: resolve the connect waiter and every pending
    /// operation (each exactly once), reset identifier state, and only
    /// then release the transport.
    async fn shutdown(&mut self, cause: Option<MqttError>) {
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter
                .resp
                .send(Err(cause.clone().unwrap_or(MqttError::Cancelled)));
        }
        for (_, op) in self.pending.drain() {
            match op {
                PendingOp::Publish(publish) => {
                    let _ = publish.ack.send(Err(MqttError::Cancelled));
                }
                PendingOp::Subscribe(subscribe) => {
                    let _ = subscribe.ack.send(Err(MqttError::Cancelled));
                }
                PendingOp::Unsubscribe(unsubscribe) => {
                    let _ = unsubscribe.ack.send(Err(MqttError::Cancelled));
                }
            }
        }
        self.packet_ids.reset();
        self.inbound_qos2.clear();
        self.subscriptions.clear();
        self.ping_deadline = None;

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.packets = None;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // ===== plumbing =====

    fn set_state(&mut self, new: ConnectionState) {
        if self.state == new {
            return;
        }
        let old = std::mem::replace(&mut self.state, new);
        debug!(?old, ?new, "connection state changed");
        self.dispatcher.state_changed(old, new);
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(MqttError::NotConnected)?;
        let mut buf = BytesMut::new();
        codec::encode_packet(packet, &mut buf)?;
        writer.write_all(&buf).await?;
        self.last_write = Instant::now();
        Ok(())
    }

    /// Write a packet, tearing the session down on transport failure.
    /// Returns whether the write succeeded.
    async fn send_or_fail(&mut self, packet: Packet) -> bool {
        match self.write_packet(&packet).await {
            Ok(()) => true,
            Err(err) => {
                self.fail_connection(err).await;
                false
            }
        }
    }
}

async fn recv_packet(
    packets: Option<&mut mpsc::Receiver<Result<Packet>>>,
) -> Option<Result<Packet>> {
    match packets {
        Some(packets) => packets.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Dedicated reader loop: owns the read half and the incremental
/// decoder, hands decoded packets into the session task, and never
/// touches session state itself.
async fn reader_loop(mut reader: ReadHalf<Stream>, packets: mpsc::Sender<Result<Packet>>) {
    let mut decoder = PacketDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = packets.send(Err(MqttError::ConnectionClosedByPeer)).await;
                return;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_packet() {
                        Ok(Some(packet)) => {
                            trace!(packet = ?packet.packet_type(), "decoded inbound packet");
                            if packets.send(Ok(packet)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err @ MqttError::MalformedPacket(_)) => {
                            // The offending frame was skipped; keep going.
                            if packets.send(Err(err)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = packets.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                let _ = packets.send(Err(MqttError::from(err))).await;
                return;
            }
        }
    }
}

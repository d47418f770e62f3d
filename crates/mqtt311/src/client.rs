//! The public client facade.
//!
//! [`MqttClient`] is a cheap, cloneable handle: every operation is
//! serialized over a bounded command queue into the session task, so
//! callers on arbitrary tasks never touch session state directly.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use mqtt311_protocol::{MqttError, QoS, Result, SubscriptionEntry};

use crate::events::{ClientObserver, ConnectionState, EventDispatcher, ObserverHandle};
use crate::options::ConnectOptions;
use crate::session::{Command, SessionLoop};

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Outcome of a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    /// Whether the broker resumed an existing session.
    pub session_present: bool,
}

/// Per-filter outcome of a subscribe batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeGrant {
    pub filter: String,
    /// Granted `QoS`, or the per-filter failure from the SUBACK.
    pub granted: Result<QoS>,
}

/// Completion handle for one publish.
///
/// Resolves when the broker-visible completion occurs: immediately for
/// `QoS` 0, on PUBACK for `QoS` 1, on PUBCOMP for `QoS` 2, or with an
/// error on acknowledgement timeout or disconnect.
#[derive(Debug)]
pub struct PublishHandle {
    packet_id: Option<u16>,
    ack: oneshot::Receiver<Result<()>>,
}

impl PublishHandle {
    pub(crate) fn new(packet_id: Option<u16>, ack: oneshot::Receiver<Result<()>>) -> Self {
        Self { packet_id, ack }
    }

    /// Identifier assigned to the in-flight publish; `None` for `QoS` 0.
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Wait for the publish flow to complete.
    pub async fn acknowledged(self) -> Result<()> {
        self.ack.await.map_err(|_| MqttError::Cancelled)?
    }
}

/// Async MQTT 3.1.1 client.
///
/// Create one with [`MqttClient::new`] (inside a tokio runtime — the
/// session task is spawned immediately), register observers, then drive
/// it with [`connect`](Self::connect), [`publish`](Self::publish),
/// [`subscribe`](Self::subscribe), and friends.
///
/// ```rust,no_run
/// use mqtt311::{ConnectOptions, MqttClient, QoS};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = MqttClient::new();
///     client
///         .connect(ConnectOptions::new("broker.local", 1883))
///         .await?;
///
///     client.subscribe(&[("sensors/+", QoS::AtLeastOnce)]).await?;
///
///     let handle = client
///         .publish("sensors/accel", b"x: 0.1".as_slice(), QoS::AtLeastOnce, false)
///         .await?;
///     handle.acknowledged().await?;
///
///     client.disconnect().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MqttClient {
    commands: mpsc::Sender<Command>,
    dispatcher: Arc<EventDispatcher>,
}

impl MqttClient {
    /// Create a client and spawn its session task.
    #[must_use]
    pub fn new() -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(SessionLoop::new(command_rx, Arc::clone(&dispatcher)).run());
        Self {
            commands,
            dispatcher,
        }
    }

    /// Open a connection with the given configuration.
    ///
    /// Fails fast with [`MqttError::AlreadyConnected`] unless the session
    /// is currently disconnected; resolves once the broker's CONNACK is
    /// processed.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectAck> {
        self.request(|resp| Command::Connect {
            options: Box::new(options),
            resp,
        })
        .await
    }

    /// Send DISCONNECT if connected, then close the transport.
    ///
    /// Safe to call in any state. Every pending operation resolves with
    /// [`MqttError::Cancelled`] before the transport is released.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|resp| Command::Disconnect { resp }).await
    }

    /// Publish `payload` to `topic`.
    ///
    /// Returns a [`PublishHandle`] once the packet has been written;
    /// await the handle for the broker-visible completion.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishHandle> {
        self.request(|resp| Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            resp,
        })
        .await
    }

    /// Subscribe to a batch of topic filters in one protocol request.
    ///
    /// Resolves when the SUBACK is processed, with one
    /// [`SubscribeGrant`] per filter in request order.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Vec<SubscribeGrant>> {
        let filters: Vec<(String, QoS)> = filters
            .iter()
            .map(|(filter, qos)| ((*filter).to_string(), *qos))
            .collect();
        self.request(|resp| Command::Subscribe { filters, resp }).await
    }

    /// Unsubscribe from a batch of topic filters in one protocol request.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<()> {
        let filters: Vec<String> = filters.iter().map(|f| (*f).to_string()).collect();
        self.request(|resp| Command::Unsubscribe { filters, resp }).await
    }

    /// Snapshot of the acknowledged subscriptions, in subscription order.
    pub async fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        let (resp, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Subscriptions { resp })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        let (resp, rx) = oneshot::channel();
        if self.commands.send(Command::State { resp }).await.is_err() {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }

    /// Register an observer for session events.
    pub fn observe(&self, observer: Arc<dyn ClientObserver>) -> ObserverHandle {
        crate::events::observe(&self.dispatcher, observer)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(build(resp))
            .await
            .map_err(|_| MqttError::Cancelled)?;
        rx.await.map_err(|_| MqttError::Cancelled)?
    }
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

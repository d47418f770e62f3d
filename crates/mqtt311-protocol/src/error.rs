use crate::types::ConnectReturnCode;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Error type shared by the protocol layer and the client engine.
///
/// Cloneable because a single failure (a dropped transport, a
/// disconnect) has to be reported to every waiter that was in flight at
/// the time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Connection refused: {0:?}")]
    ConnectRefused(ConnectReturnCode),

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("String too long: {0} bytes exceeds maximum of 65535")]
    StringTooLong(usize),

    #[error("Packet too large: remaining length {0} exceeds maximum of 268435455")]
    PacketTooLarge(usize),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connecting or connected")]
    AlreadyConnected,

    #[error("Acknowledgement timeout for packet {0}")]
    AckTimeout(u16),

    #[error("Packet identifier pool exhausted")]
    PacketIdExhausted,

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Operation cancelled by disconnect")]
    Cancelled,
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

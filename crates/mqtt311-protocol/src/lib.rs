//! Sans-IO MQTT 3.1.1 protocol layer.
//!
//! This crate holds everything that can be expressed without a socket:
//! the typed packet model and wire codec, the variable-byte-integer
//! encoding used by the remaining-length field, topic filter matching and
//! validation, packet-identifier allocation for `QoS` 1/2 flows, and the
//! ordered subscription registry.
//!
//! The async client engine lives in the `mqtt311` crate and drives this
//! one; nothing here performs I/O or spawns tasks, which keeps the whole
//! protocol surface unit-testable with plain byte buffers.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod encoding;
pub mod error;
pub mod packet;
pub mod packet_id;
pub mod subscription;
pub mod topic;
pub mod types;

pub use codec::{decode_packet, encode_packet, PacketDecoder};
pub use error::{MqttError, Result};
pub use packet::{FixedHeader, Packet, PacketType};
pub use packet_id::PacketIdAllocator;
pub use subscription::{SubscriptionEntry, SubscriptionRegistry};
pub use topic::{is_valid_topic_filter, is_valid_topic_name, matches};
pub use types::{ConnectReturnCode, QoS};

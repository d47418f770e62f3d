//! # Async MQTT 3.1.1 client engine
//!
//! A minimal, headless MQTT 3.1.1 client built for exercising brokers:
//! connect with a configurable profile, publish telemetry at any `QoS`,
//! subscribe to wildcard filters, and watch every protocol event through
//! observers. The wire codec and session primitives live in the
//! [`mqtt311_protocol`] crate; this crate adds the tokio transport, the
//! session state machine, and the public facade.
//!
//! ## Architecture
//!
//! One session task owns all mutable state. Client handles serialize
//! operations into it over a command queue, a dedicated reader task
//! feeds it decoded packets, and all timers (connect timeout, keep-alive
//! pings, acknowledgement retries) are deadlines inside the same loop.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mqtt311::{ConnectOptions, MqttClient, QoS};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MqttClient::new();
//!
//!     let options = ConnectOptions::new("test.mosquitto.org", 1883)
//!         .with_client_id("probe-1")
//!         .with_keep_alive(Duration::from_secs(30));
//!     client.connect(options).await?;
//!
//!     for grant in client.subscribe(&[("sensors/+", QoS::AtLeastOnce)]).await? {
//!         println!("{} -> {:?}", grant.filter, grant.granted);
//!     }
//!
//!     let handle = client
//!         .publish("sensors/accel", b"x: 0.1".as_slice(), QoS::AtLeastOnce, false)
//!         .await?;
//!     handle.acknowledged().await?;
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod events;
pub mod options;
mod pending;
mod session;
pub mod telemetry;
pub mod transport;

pub use client::{ConnectAck, MqttClient, PublishHandle, SubscribeGrant};
pub use events::{ClientObserver, ConnectionState, EventDispatcher, InboundMessage, ObserverHandle};
pub use options::{ConnectOptions, RetryPolicy, TlsOptions, TrustPolicy};
pub use telemetry::TelemetryProducer;

pub use mqtt311_protocol::{MqttError, QoS, Result, SubscriptionEntry};

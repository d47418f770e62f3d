//! Publish synthetic accelerometer-style readings to a broker while an
//! observer prints the publish/ack flow.
//!
//! ```sh
//! cargo run --example telemetry_publish -- 127.0.0.1 1883
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqtt311::{
    telemetry, ClientObserver, ConnectOptions, ConnectionState, InboundMessage, MqttClient,
    MqttError, QoS, TelemetryProducer,
};

struct ConsoleObserver;

impl ClientObserver for ConsoleObserver {
    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        println!("state: {old:?} -> {new:?}");
    }

    fn on_message(&self, message: &InboundMessage) {
        println!(
            "message on {}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    }

    fn on_publish_sent(&self, packet_id: u16) {
        println!("publish sent: {packet_id}");
    }

    fn on_publish_acked(&self, packet_id: u16) {
        println!("publish acked: {packet_id}");
    }

    fn on_error(&self, error: &MqttError) {
        eprintln!("error: {error}");
    }
}

/// Deterministic wave standing in for a motion sensor.
struct SyntheticAccelerometer {
    tick: AtomicU64,
}

impl TelemetryProducer for SyntheticAccelerometer {
    fn current_reading(&self) -> String {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64 / 10.0;
        format!(
            "x: {:.3}; y: {:.3}; z: {:.3}",
            t.sin(),
            (t * 0.7).cos(),
            1.0 - t.sin().abs() * 0.1
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().map_or(Ok(1883), |p| p.parse())?;

    let client = MqttClient::new();
    let _observer = client.observe(Arc::new(ConsoleObserver));

    client
        .connect(
            ConnectOptions::new(host, port)
                .with_keep_alive(Duration::from_secs(30))
                .with_connect_timeout(Duration::from_secs(10)),
        )
        .await?;

    client.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;

    let producer = Arc::new(SyntheticAccelerometer {
        tick: AtomicU64::new(0),
    });
    let publisher = telemetry::spawn_publisher(
        client.clone(),
        producer,
        "sensors/accel",
        Duration::from_millis(500),
        QoS::AtLeastOnce,
    );

    tokio::signal::ctrl_c().await?;
    publisher.abort();
    client.disconnect().await?;
    Ok(())
}

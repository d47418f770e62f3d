//! Optional harness-side publish loop over an opaque telemetry source.
//!
//! Not part of the protocol core: this is the piece a headless test
//! harness uses to keep a broker busy with sensor-style readings while
//! observers watch the publish-sent/publish-acked flow.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use mqtt311_protocol::{MqttError, QoS};

use crate::client::MqttClient;

/// An opaque source of readings, sampled once per publish period.
pub trait TelemetryProducer: Send + Sync {
    fn current_reading(&self) -> String;
}

impl<F> TelemetryProducer for F
where
    F: Fn() -> String + Send + Sync,
{
    fn current_reading(&self) -> String {
        self()
    }
}

/// Periodically publish the producer's current reading to `topic`.
///
/// Ticks where the client is not connected are skipped; the loop ends
/// when the client's session is gone. Abort the returned handle to stop
/// it earlier.
pub fn spawn_publisher(
    client: MqttClient,
    producer: Arc<dyn TelemetryProducer>,
    topic: impl Into<String>,
    period: Duration,
    qos: QoS,
) -> JoinHandle<()> {
    let topic = topic.into();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            let reading = producer.current_reading();
            match client.publish(topic.clone(), reading.into_bytes(), qos, false).await {
                Ok(handle) => {
                    // Completion is tracked off the loop so a slow broker
                    // cannot stall the sampling cadence.
                    tokio::spawn(async move {
                        if let Err(err) = handle.acknowledged().await {
                            debug!(error = %err, "telemetry publish did not complete");
                        }
                    });
                }
                Err(MqttError::Cancelled) => {
                    debug!("telemetry publisher stopping, session is gone");
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "telemetry publish skipped");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_producers() {
        let producer: Arc<dyn TelemetryProducer> =
            Arc::new(|| "x: 0.0; y: 0.1; z: 0.9".to_string());
        assert!(producer.current_reading().contains("z:"));
    }
}

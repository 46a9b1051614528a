//! Example: Streaming a Virtual Sensor Through the Pipeline
//!
//! This example pairs with a virtual sensor over the mock transport and
//! prints pipeline events as they arrive. The sensor emits one frame per
//! second, standing in for one reading per minute.
//!
//! Run with: `cargo run --example stream_pipeline -- [FRAMES]`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cgm_core::{
    ConnectionConfig, CoreEvent, MockTransport, Pipeline, ScaledClock, SharedTransport,
    VirtualSensor,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let frames: u32 = env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(10);

    let transport = Arc::new(MockTransport::with_default_name());
    let sensor = VirtualSensor::new(42);
    sensor.install(&transport).await;

    let interval = Duration::from_secs(1);
    let pipeline = Pipeline::builder(transport.clone() as SharedTransport)
        .connection(ConnectionConfig::new().expected_interval(interval))
        .clock(Arc::new(ScaledClock::new(60.0)))
        .start()
        .await?;
    let mut events = pipeline.subscribe();

    let cancel = CancellationToken::new();
    let emitter = sensor.spawn(transport.clone(), interval, cancel.clone());

    println!("Pairing...");
    pipeline.pair()?;

    let mut received = 0;
    while received < frames {
        match events.recv().await? {
            CoreEvent::SensorPaired { sensor } => {
                println!("Paired {} ({}), age {} min", sensor.serial, sensor.sensor_type, sensor.age);
            }
            CoreEvent::ConnectionStateChanged { state } => println!("Connection: {}", state),
            CoreEvent::GlucoseAdded { values } => {
                received += 1;
                if let Some(latest) = values.last() {
                    println!(
                        "{}  {:>3} mg/dL {}  (+{} values)",
                        latest.timestamp.time(),
                        latest
                            .glucose_value
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "---".into()),
                        latest.trend.arrow(),
                        values.len()
                    );
                }
            }
            CoreEvent::MissedReading { count } => println!("Missed reading ({})", count),
            CoreEvent::ConnectionError { message, .. } => println!("Error: {}", message),
            _ => {}
        }
    }

    pipeline.disconnect()?;
    cancel.cancel();
    emitter.await?;
    pipeline.shutdown();

    Ok(())
}

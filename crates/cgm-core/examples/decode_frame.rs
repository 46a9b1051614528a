//! Example: Decoding One Telemetry Frame
//!
//! This example walks a single frame from a virtual sensor through the
//! low-level stages by hand: chunk reassembly, decryption and parsing,
//! then factory calibration with rate limiting and trend.
//!
//! Run with: `cargo run --example decode_frame -- [SEED] [AGE_MINUTES]`

use std::env;

use time::OffsetDateTime;

use cgm_core::{
    CalibrationConfig, CalibrationEngine, FRAME_SIZE, FrameReassembler, ReassemblyResult,
    TelemetryDecoder, VirtualSensor,
};
use cgm_types::CustomCalibration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let seed: u64 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(1);
    let age: u32 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(1440);

    let sensor = VirtualSensor::new(seed).with_age(age);
    println!("Virtual sensor seed {} at age {} min", seed, age);

    // Chunks arrive as separate notifications
    let mut reassembler = FrameReassembler::new(FRAME_SIZE);
    let mut frame = None;
    for chunk in sensor.chunks(age)? {
        println!("  chunk: {} bytes", chunk.len());
        if let ReassemblyResult::Complete(bytes) = reassembler.append(&chunk) {
            frame = Some(bytes);
            reassembler.reset();
        }
    }
    let Some(frame) = frame else {
        return Err("frame never completed".into());
    };

    let decoder = TelemetryDecoder::default();
    let decoded = decoder.decode(sensor.uid(), &frame, OffsetDateTime::now_utc())?;
    println!();
    println!(
        "Decoded frame: age {} min, {} trend samples, {} history samples",
        decoded.age,
        decoded.trend.len(),
        decoded.history.len()
    );

    let engine = CalibrationEngine::new(CalibrationConfig::default());
    let factory = sensor.factory_calibration();
    let custom = CustomCalibration::default();

    println!();
    println!("{:<22} {:>8} {:>8} {:>8}  Trend", "Time", "Raw", "mg/dL", "Δ/min");
    let mut previous = None;
    for reading in decoded.readings() {
        let value = engine.calibrate_next(&reading, &factory, &custom, previous.as_ref());
        println!(
            "{:<22} {:>8} {:>8} {:>8}  {}",
            reading.timestamp.time().to_string(),
            value.raw_value.map(|v| format!("{:.1}", v)).unwrap_or_default(),
            value.glucose_value.map(|v| v.to_string()).unwrap_or_else(|| "---".into()),
            value
                .minute_change
                .map(|v| format!("{:+.1}", v))
                .unwrap_or_default(),
            value.trend
        );
        previous = Some(value);
    }

    Ok(())
}

//! A simulated sensor that produces encrypted telemetry.
//!
//! [`VirtualSensor`] synthesises a smooth glucose curve, packs it into frames
//! with the same layout and cipher a real sensor uses, and splits them into
//! notification-sized chunks. Paired with [`MockTransport`] it exercises the
//! whole pipeline without hardware.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cgm_types::uuids::{FRAM_CHARACTERISTIC, PATCH_INFO_CHARACTERISTIC, UID_CHARACTERISTIC};
use cgm_types::{
    FRAM_LEN, FactoryCalibration, FramInfo, PATCH_INFO_LEN, SENSOR_UID_LEN, SampleQuality,
    SensorState,
};

use crate::decoder::{
    HISTORY_INTERVAL, HISTORY_LEN, KeyedStreamCipher, TREND_OFFSETS, TelemetryCipher, WireSample,
    encode_frame, history_anchor,
};
use crate::error::Result;
use crate::mock::MockTransport;
use crate::reassembler::FRAME_SIZE;

/// Patch info of a European streaming sensor.
pub const DEFAULT_PATCH_INFO: [u8; PATCH_INFO_LEN] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

/// Raw units per mg/dL produced by the virtual sensor.
const RAW_PER_MG_DL: f64 = 10.0;

/// Raw thermistor value reported by the virtual sensor.
const RAW_TEMPERATURE: u16 = 6500;

/// Default notification payload size.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// A deterministic simulated sensor.
#[derive(Debug, Clone)]
pub struct VirtualSensor {
    uid: [u8; SENSOR_UID_LEN],
    patch_info: [u8; PATCH_INFO_LEN],
    factory: FactoryCalibration,
    state: SensorState,
    age: u32,
    baseline: f64,
    amplitude: f64,
    period_minutes: f64,
    phase: f64,
    chunk_size: usize,
    /// Sample ages reported as faulted.
    faults: Vec<(u32, SampleQuality)>,
}

impl VirtualSensor {
    /// Create a sensor whose identity and curve phase derive from `seed`.
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uid = [0u8; SENSOR_UID_LEN];
        rng.fill(&mut uid);
        let period_minutes = 180.0;
        Self {
            uid,
            patch_info: DEFAULT_PATCH_INFO,
            factory: FactoryCalibration {
                i1: 0,
                i2: 0,
                i3: 0,
                i4: (100.0 * RAW_PER_MG_DL) as i32,
                i5: 0,
                i6: 0,
            },
            state: SensorState::Ready,
            age: 24 * 60,
            baseline: 130.0,
            amplitude: 40.0,
            period_minutes,
            phase: rng.random_range(0.0..period_minutes),
            chunk_size: DEFAULT_CHUNK_SIZE,
            faults: Vec::new(),
        }
    }

    /// Start at the given age in minutes.
    #[must_use]
    pub fn with_age(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    /// Lifecycle state written to FRAM.
    #[must_use]
    pub fn with_state(mut self, state: SensorState) -> Self {
        self.state = state;
        self
    }

    /// Centre and swing of the glucose curve, in mg/dL.
    #[must_use]
    pub fn with_curve(mut self, baseline: f64, amplitude: f64) -> Self {
        self.baseline = baseline;
        self.amplitude = amplitude;
        self
    }

    /// Notification payload size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Report the sample at `age` as faulted.
    #[must_use]
    pub fn with_fault(mut self, age: u32, quality: SampleQuality) -> Self {
        self.faults.push((age, quality));
        self
    }

    pub fn uid(&self) -> &[u8; SENSOR_UID_LEN] {
        &self.uid
    }

    pub fn patch_info(&self) -> &[u8; PATCH_INFO_LEN] {
        &self.patch_info
    }

    pub fn factory_calibration(&self) -> FactoryCalibration {
        self.factory
    }

    /// Current age in minutes.
    pub fn age(&self) -> u32 {
        self.age
    }

    /// Glucose in mg/dL at the given age.
    pub fn glucose_at(&self, age: u32) -> f64 {
        let x = (f64::from(age) + self.phase) / self.period_minutes;
        self.baseline + self.amplitude * (TAU * x).sin() + 0.25 * self.amplitude * (3.0 * TAU * x).cos()
    }

    /// FRAM image as read at pairing.
    pub fn fram(&self) -> [u8; FRAM_LEN] {
        FramInfo {
            state: self.state,
            age: self.age,
            factory_calibration: self.factory,
        }
        .to_bytes()
    }

    fn sample_at(&self, age: u32) -> WireSample {
        if let Some((_, quality)) = self.faults.iter().find(|(a, _)| *a == age) {
            return WireSample::faulted(*quality);
        }
        let raw = (self.glucose_at(age) * RAW_PER_MG_DL)
            .round()
            .clamp(0.0, f64::from(0x3FFF_u16));
        WireSample::valid(raw as u16, RAW_TEMPERATURE)
    }

    /// Plaintext frame for the given age.
    pub fn plaintext_frame(&self, age: u32) -> [u8; FRAME_SIZE] {
        let trend: [WireSample; TREND_OFFSETS.len()] =
            core::array::from_fn(|i| self.sample_at(age.saturating_sub(TREND_OFFSETS[i])));
        let anchor = history_anchor(age);
        let history: [WireSample; HISTORY_LEN] = core::array::from_fn(|i| {
            let back = (HISTORY_LEN - 1 - i) as u32 * HISTORY_INTERVAL;
            self.sample_at(anchor.saturating_sub(back))
        });
        encode_frame(age, &trend, &history)
    }

    /// Encrypted frame for the given age.
    pub fn frame(&self, age: u32) -> Result<Vec<u8>> {
        KeyedStreamCipher.encrypt(&self.uid, &self.plaintext_frame(age))
    }

    /// Encrypted frame for the given age, split into notification chunks.
    pub fn chunks(&self, age: u32) -> Result<Vec<Bytes>> {
        let frame = self.frame(age)?;
        Ok(frame
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect())
    }

    /// Advance one minute and return the chunks of the new frame.
    pub fn tick(&mut self) -> Result<Vec<Bytes>> {
        self.age = self.age.saturating_add(1);
        self.chunks(self.age)
    }

    /// Load identity, patch info and FRAM into a mock transport.
    pub async fn install(&self, transport: &MockTransport) {
        transport
            .set_value(UID_CHARACTERISTIC, Bytes::copy_from_slice(&self.uid))
            .await;
        transport
            .set_value(
                PATCH_INFO_CHARACTERISTIC,
                Bytes::copy_from_slice(&self.patch_info),
            )
            .await;
        transport
            .set_value(FRAM_CHARACTERISTIC, Bytes::copy_from_slice(&self.fram()))
            .await;
    }

    /// Emit one frame per `interval` into `transport` until cancelled.
    ///
    /// The sensor keeps ageing while notifications are disabled; frames are
    /// only delivered while subscribed.
    pub fn spawn(
        mut self,
        transport: Arc<MockTransport>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Virtual sensor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let chunks = match self.tick() {
                            Ok(chunks) => chunks,
                            Err(e) => {
                                warn!("Virtual sensor failed to build frame: {}", e);
                                continue;
                            }
                        };
                        if transport.is_subscribed() {
                            for chunk in chunks {
                                transport.push_chunk(chunk);
                            }
                        }
                    }
                }
            }
        })
    }
}

//! Conversion of raw sensor samples into calibrated glucose values.
//!
//! Each valid sample goes through, in order:
//!
//! 1. the factory curve ([`FactoryCurve`]), driven by the six FRAM integers;
//! 2. the user's custom calibration, when it has at least two points;
//! 3. rate-of-change limiting against the previous accepted value;
//! 4. clamping to the readable range and rounding.
//!
//! Faulted or non-finite samples never produce a number: they come out as a
//! [`CalibratedGlucose`] with no value and the fault quality.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, trace};

use cgm_types::{
    CalibratedGlucose, CustomCalibration, FactoryCalibration, GlucoseType, RawReading,
    SampleQuality, Sensor, Trend, TrendThresholds,
};

use crate::error::{Error, Result};

/// Lowest value the sensor can report, in mg/dL.
pub const MIN_READABLE_GLUCOSE: f64 = 40.0;

/// Highest value the sensor can report, in mg/dL.
pub const MAX_READABLE_GLUCOSE: f64 = 500.0;

/// Default limit on change per minute, in mg/dL.
pub const DEFAULT_ALLOWED_CHANGE_PER_MINUTE: f64 = 15.0;

/// Options for the calibration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Lower clamp for calibrated values.
    pub min_glucose: f64,
    /// Upper clamp for calibrated values.
    pub max_glucose: f64,
    /// Maximum accepted change per elapsed minute. `None` disables limiting.
    pub allowed_change_per_minute: Option<f64>,
    /// Slope thresholds for trend classification.
    pub trend_thresholds: TrendThresholds,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_glucose: MIN_READABLE_GLUCOSE,
            max_glucose: MAX_READABLE_GLUCOSE,
            allowed_change_per_minute: Some(DEFAULT_ALLOWED_CHANGE_PER_MINUTE),
            trend_thresholds: TrendThresholds::default(),
        }
    }
}

impl CalibrationConfig {
    /// Create a new builder.
    pub fn builder() -> CalibrationConfigBuilder {
        CalibrationConfigBuilder::default()
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_glucose.is_finite() && self.min_glucose > 0.0) {
            return Err(Error::invalid_config("min_glucose must be > 0"));
        }
        if !(self.max_glucose.is_finite() && self.max_glucose > self.min_glucose) {
            return Err(Error::invalid_config(
                "max_glucose must be greater than min_glucose",
            ));
        }
        if let Some(allowed) = self.allowed_change_per_minute
            && !(allowed.is_finite() && allowed > 0.0)
        {
            return Err(Error::invalid_config(
                "allowed_change_per_minute must be > 0",
            ));
        }
        let t = &self.trend_thresholds;
        if !(t.moderate > 0.0 && t.fast > t.moderate && t.rapid > t.fast) {
            return Err(Error::invalid_config(
                "trend thresholds must satisfy 0 < moderate < fast < rapid",
            ));
        }
        Ok(())
    }
}

/// Builder for [`CalibrationConfig`].
#[derive(Debug, Clone, Default)]
pub struct CalibrationConfigBuilder {
    config: CalibrationConfig,
}

impl CalibrationConfigBuilder {
    #[must_use]
    pub fn min_glucose(mut self, value: f64) -> Self {
        self.config.min_glucose = value;
        self
    }

    #[must_use]
    pub fn max_glucose(mut self, value: f64) -> Self {
        self.config.max_glucose = value;
        self
    }

    /// Set the maximum change per minute.
    #[must_use]
    pub fn allowed_change_per_minute(mut self, value: f64) -> Self {
        self.config.allowed_change_per_minute = Some(value);
        self
    }

    /// Disable rate-of-change limiting.
    #[must_use]
    pub fn no_rate_limit(mut self) -> Self {
        self.config.allowed_change_per_minute = None;
        self
    }

    #[must_use]
    pub fn trend_thresholds(mut self, thresholds: TrendThresholds) -> Self {
        self.config.trend_thresholds = thresholds;
        self
    }

    pub fn build(self) -> CalibrationConfig {
        self.config
    }
}

/// Sensor-specific transform from raw units to mg/dL.
pub trait FactoryCurve: Send + Sync + fmt::Debug {
    /// Apply the curve. May return a non-finite value for unusable inputs.
    fn apply(&self, factory: &FactoryCalibration, raw: f64, raw_temperature: Option<f64>) -> f64;
}

/// Linear factory curve with optional thermistor compensation.
///
/// `g = 100 * (raw - i3) / (i4 - i3)`, scaled by `1.045^(32.5 - temp)` when
/// `i2 != 0` and a temperature is available (`temp = (t - i1) / i2`), then
/// adjusted to `g * (1 + i5 / 10000) + i6 / 100`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCurve;

impl FactoryCurve for StandardCurve {
    fn apply(&self, f: &FactoryCalibration, raw: f64, raw_temperature: Option<f64>) -> f64 {
        let span = f64::from(f.i4) - f64::from(f.i3);
        let mut glucose = 100.0 * (raw - f64::from(f.i3)) / span;

        if let Some(t) = raw_temperature
            && f.i2 != 0
        {
            let temperature = (t - f64::from(f.i1)) / f64::from(f.i2);
            glucose *= 1.045f64.powf(32.5 - temperature);
        }

        glucose * (1.0 + f64::from(f.i5) / 10_000.0) + f64::from(f.i6) / 100.0
    }
}

/// Elapsed minutes from `previous` to `current`.
#[must_use]
pub fn minutes_between(current: OffsetDateTime, previous: OffsetDateTime) -> f64 {
    (current - previous).as_seconds_f64() / 60.0
}

/// Change per minute between two values; `0.0` when the timestamps match.
#[must_use]
pub fn minute_change(
    current_value: f64,
    current_at: OffsetDateTime,
    previous_value: f64,
    previous_at: OffsetDateTime,
) -> f64 {
    let minutes = minutes_between(current_at, previous_at);
    if minutes == 0.0 {
        0.0
    } else {
        (current_value - previous_value) / minutes
    }
}

/// Bounds each value by the previous accepted value plus or minus
/// `round(allowed * elapsed_minutes)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiter {
    allowed_change_per_minute: f64,
}

impl RateLimiter {
    pub fn new(allowed_change_per_minute: f64) -> Self {
        Self {
            allowed_change_per_minute,
        }
    }

    /// Maximum deviation after `minutes`.
    #[must_use]
    pub fn bound(&self, minutes: f64) -> f64 {
        (self.allowed_change_per_minute * minutes.abs()).round()
    }

    /// Clamp `value` observed at `at` against the previous accepted value.
    #[must_use]
    pub fn limit(&self, value: f64, at: OffsetDateTime, previous: (f64, OffsetDateTime)) -> f64 {
        let (previous_value, previous_at) = previous;
        let bound = self.bound(minutes_between(at, previous_at));
        let limited = value.clamp(previous_value - bound, previous_value + bound);
        if limited != value {
            debug!(
                value,
                limited, previous_value, bound, "Rate of change limited"
            );
        }
        limited
    }
}

/// Converts raw readings into calibrated glucose values.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
    curve: Arc<dyn FactoryCurve>,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self::with_curve(config, Arc::new(StandardCurve))
    }

    /// Use a custom factory curve.
    pub fn with_curve(config: CalibrationConfig, curve: Arc<dyn FactoryCurve>) -> Self {
        Self { config, curve }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Factory-calibrated value of a reading, or `None` when it is faulted
    /// or the curve yields a non-finite number.
    pub fn factory_value(&self, reading: &RawReading, factory: &FactoryCalibration) -> Option<f64> {
        if !reading.quality.is_ok() {
            return None;
        }
        let raw = reading.value.filter(|v| v.is_finite())?;
        let value = self.curve.apply(factory, raw, reading.raw_temperature);
        value.is_finite().then_some(value)
    }

    /// Calibrate one reading without a predecessor.
    pub fn calibrate(
        &self,
        reading: &RawReading,
        factory: &FactoryCalibration,
        custom: &CustomCalibration,
    ) -> CalibratedGlucose {
        self.calibrate_next(reading, factory, custom, None)
    }

    /// Calibrate one reading following `previous`.
    ///
    /// `previous` drives rate limiting, `minute_change` and trend; it is
    /// ignored unless it is a valid sensor value.
    pub fn calibrate_next(
        &self,
        reading: &RawReading,
        factory: &FactoryCalibration,
        custom: &CustomCalibration,
        previous: Option<&CalibratedGlucose>,
    ) -> CalibratedGlucose {
        let Some(factory_value) = self.factory_value(reading, factory) else {
            let quality = if reading.quality.is_ok() {
                SampleQuality::InvalidValue
            } else {
                reading.quality
            };
            trace!(timestamp = %reading.timestamp, %quality, "Faulted sample");
            return CalibratedGlucose::faulted(reading.timestamp, quality);
        };

        let mut value = custom.apply(factory_value);

        let previous = previous
            .filter(|p| p.glucose_type == GlucoseType::Cgm)
            .and_then(|p| p.glucose_value.map(|v| (f64::from(v), p.timestamp)));

        if let (Some(allowed), Some(previous)) = (self.config.allowed_change_per_minute, previous) {
            value = RateLimiter::new(allowed).limit(value, reading.timestamp, previous);
        }

        let value = value
            .clamp(self.config.min_glucose, self.config.max_glucose)
            .round();

        let change = previous.map(|(previous_value, previous_at)| {
            minute_change(value, reading.timestamp, previous_value, previous_at)
        });
        let trend = Trend::classify(change, &self.config.trend_thresholds);

        CalibratedGlucose::sensor(
            reading.timestamp,
            value as i32,
            factory_value,
            change,
            trend,
        )
    }

    /// Calibrate an ascending batch, chaining each valid result into the next.
    pub fn calibrate_batch(
        &self,
        readings: &[RawReading],
        sensor: &Sensor,
        previous: Option<&CalibratedGlucose>,
    ) -> Vec<CalibratedGlucose> {
        let mut last = previous.cloned();
        let mut out = Vec::with_capacity(readings.len());
        for reading in readings {
            let glucose = self.calibrate_next(
                reading,
                &sensor.factory_calibration,
                &sensor.custom_calibration,
                last.as_ref(),
            );
            if glucose.is_valid() {
                last = Some(glucose.clone());
            }
            out.push(glucose);
        }
        out
    }
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

//! Raw and calibrated glucose samples.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{GlucoseType, SampleQuality, Trend};

/// Round a timestamp down to the start of its minute.
///
/// Every sample timestamp is minute-aligned so that trend and history
/// samples for the same minute compare equal.
#[must_use]
pub fn round_to_minute(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_second(0)
        .and_then(|t| t.replace_nanosecond(0))
        .unwrap_or(at)
}

/// One uncalibrated sample decoded from a telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawReading {
    /// Sample time, minute-aligned.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Raw sensor value. `None` when the sample is faulted.
    pub value: Option<f64>,
    /// Raw thermistor value, when reported.
    pub raw_temperature: Option<f64>,
    pub quality: SampleQuality,
}

impl RawReading {
    /// A usable sample.
    #[must_use]
    pub fn valid(timestamp: OffsetDateTime, value: f64, raw_temperature: Option<f64>) -> Self {
        Self {
            timestamp: round_to_minute(timestamp),
            value: Some(value),
            raw_temperature,
            quality: SampleQuality::Ok,
        }
    }

    /// A faulted sample; it carries no value.
    #[must_use]
    pub fn faulted(timestamp: OffsetDateTime, quality: SampleQuality) -> Self {
        Self {
            timestamp: round_to_minute(timestamp),
            value: None,
            raw_temperature: None,
            quality,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.quality.is_ok() && self.value.is_some()
    }
}

/// A calibrated glucose value as stored and surfaced to consumers.
///
/// Sensor-derived values are produced only by the calibration engine; blood
/// glucose entries come from the user.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibratedGlucose {
    pub id: Uuid,
    /// Sample time, minute-aligned.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Calibrated value in mg/dL, `None` when the sample was faulted.
    pub glucose_value: Option<i32>,
    /// Factory-calibrated value before custom calibration and limiting.
    /// Used as the x-coordinate for new custom calibration points.
    pub raw_value: Option<f64>,
    /// Change per minute relative to the previous value.
    pub minute_change: Option<f64>,
    pub trend: Trend,
    pub glucose_type: GlucoseType,
    pub quality: SampleQuality,
}

impl CalibratedGlucose {
    /// A calibrated sensor value.
    #[must_use]
    pub fn sensor(
        timestamp: OffsetDateTime,
        glucose_value: i32,
        raw_value: f64,
        minute_change: Option<f64>,
        trend: Trend,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: round_to_minute(timestamp),
            glucose_value: Some(glucose_value),
            raw_value: Some(raw_value),
            minute_change,
            trend,
            glucose_type: GlucoseType::Cgm,
            quality: SampleQuality::Ok,
        }
    }

    /// A sensor sample without a value.
    #[must_use]
    pub fn faulted(timestamp: OffsetDateTime, quality: SampleQuality) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: round_to_minute(timestamp),
            glucose_value: None,
            raw_value: None,
            minute_change: None,
            trend: Trend::Unknown,
            glucose_type: GlucoseType::Cgm,
            quality,
        }
    }

    /// A manual blood glucose entry.
    #[must_use]
    pub fn blood_glucose(timestamp: OffsetDateTime, glucose_value: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: round_to_minute(timestamp),
            glucose_value: Some(glucose_value),
            raw_value: None,
            minute_change: None,
            trend: Trend::Unknown,
            glucose_type: GlucoseType::Bgm,
            quality: SampleQuality::Ok,
        }
    }

    /// Whether this value carries a usable number.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.quality.is_ok() && self.glucose_value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_round_to_minute() {
        let at = datetime!(2024-03-01 12:34:56.789 UTC);
        assert_eq!(round_to_minute(at), datetime!(2024-03-01 12:34 UTC));
        let aligned = datetime!(2024-03-01 12:34 UTC);
        assert_eq!(round_to_minute(aligned), aligned);
    }

    #[test]
    fn test_raw_reading_constructors_round() {
        let at = datetime!(2024-03-01 12:34:56 UTC);
        let valid = RawReading::valid(at, 1234.0, Some(7000.0));
        assert_eq!(valid.timestamp, datetime!(2024-03-01 12:34 UTC));
        assert!(valid.is_valid());

        let faulted = RawReading::faulted(at, SampleQuality::SignalLoss);
        assert_eq!(faulted.value, None);
        assert!(!faulted.is_valid());
    }

    #[test]
    fn test_calibrated_glucose_kinds() {
        let at = datetime!(2024-03-01 12:00 UTC);
        let cgm = CalibratedGlucose::sensor(at, 120, 118.4, Some(0.5), Trend::Constant);
        assert_eq!(cgm.glucose_type, GlucoseType::Cgm);
        assert!(cgm.is_valid());

        let bgm = CalibratedGlucose::blood_glucose(at, 95);
        assert_eq!(bgm.glucose_type, GlucoseType::Bgm);
        assert_eq!(bgm.raw_value, None);
        assert_ne!(cgm.id, bgm.id);

        let faulted = CalibratedGlucose::faulted(at, SampleQuality::Noisy);
        assert!(!faulted.is_valid());
        assert_eq!(faulted.trend, Trend::Unknown);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_calibrated_glucose_json() {
        let at = datetime!(2024-03-01 12:00 UTC);
        let value = CalibratedGlucose::sensor(at, 120, 118.4, Some(0.5), Trend::Rising);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"2024-03-01T12:00:00Z\""));
        assert!(json.contains("\"rising\""));
        let back: CalibratedGlucose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}

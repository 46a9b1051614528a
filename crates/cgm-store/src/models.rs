//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cgm_types::Sensor;

/// The paired sensor as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSensor {
    pub sensor: Sensor,
    /// Last unlock counter value used with this sensor.
    pub unlock_count: u32,
    /// When the row was last written.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Summary of sensor glucose values over a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlucoseStats {
    /// Number of values with a number.
    pub count: u64,
    /// Number of faulted samples.
    pub faulted: u64,
    pub min: Option<i32>,
    pub max: Option<i32>,
    pub mean: Option<f64>,
    /// Share of values within the target range, as a percentage.
    pub time_in_range: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last: Option<OffsetDateTime>,
}

//! Platform-agnostic types for continuous glucose monitor sensors.
//!
//! This crate holds the data model shared by the acquisition pipeline
//! (`cgm-core`), the persistence layer (`cgm-store`) and the CLI.
//!
//! # Features
//!
//! - Sensor identity and lifecycle decoded from UID, patch info and FRAM
//! - Raw and calibrated glucose samples
//! - Factory and custom calibration data
//! - UUID constants for the sensor's GATT service
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use cgm_types::{FactoryCalibration, Sensor, SensorState};
//! use time::OffsetDateTime;
//!
//! let uid = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
//! let patch = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];
//! let sensor = Sensor::new(&uid, &patch, FactoryCalibration::identity(), 600, OffsetDateTime::now_utc())
//!     .unwrap();
//! assert_eq!(sensor.state, SensorState::Ready);
//! ```

pub mod calibration;
pub mod error;
pub mod glucose;
pub mod sensor;
pub mod types;
pub mod uuid;

pub use calibration::{CustomCalibration, CustomCalibrationPoint, FactoryCalibration};
pub use error::{ParseError, ParseResult};
pub use glucose::{CalibratedGlucose, RawReading, round_to_minute};
pub use sensor::{
    FRAM_LEN, FramInfo, PATCH_INFO_LEN, SENSOR_UID_LEN, Sensor, SensorFamily, SensorRegion,
    SensorType, serial_number,
};
pub use types::{ConnectionState, GlucoseType, SampleQuality, SensorState, Trend, TrendThresholds};
pub use uuid as uuids;

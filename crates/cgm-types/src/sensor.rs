//! Sensor identity, lifecycle, and FRAM decoding.
//!
//! A [`Sensor`] is built once at pairing time from three reads: the 8-byte
//! UID, the 6-byte patch info, and the FRAM image. Family, type, region and
//! serial are derived from those bytes and never change afterwards; only
//! `age`, `state` and the custom calibration are updated while the sensor is
//! in use.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::calibration::{CustomCalibration, FactoryCalibration};
use crate::error::{ParseError, ParseResult};
use crate::types::SensorState;

/// Length of the sensor UID in bytes.
pub const SENSOR_UID_LEN: usize = 8;

/// Length of the patch info block in bytes.
pub const PATCH_INFO_LEN: usize = 6;

/// Length of the FRAM image read at pairing time.
///
/// Layout (little-endian):
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0 | 1 | lifecycle code |
/// | 1 | 1 | reserved |
/// | 2 | 2 | age in minutes |
/// | 4 | 24 | `i1..i6` as `i32` |
pub const FRAM_LEN: usize = 28;

/// Minutes a sensor spends warming up before readings are valid.
pub const DEFAULT_WARMUP_MINUTES: u32 = 60;

/// Standard sensor lifetime: 14 days.
pub const DEFAULT_LIFETIME_MINUTES: u32 = 14 * 24 * 60;

/// Grace period granted to streaming sensors after the standard lifetime.
const STREAMING_GRACE_MINUTES: u32 = 12 * 60;

/// Alphabet used for printed serial numbers (no ambiguous letters).
const SERIAL_ALPHABET: &[u8; 32] = b"0123456789ACDEFGHJKLMNPQRTUVWXYZ";

/// Sensor hardware family, from the high nibble of patch info byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorFamily {
    Libre1,
    LibrePro,
    Libre2,
    LibreSense,
    Unknown(u8),
}

impl SensorFamily {
    /// Decode the family from patch info.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8; PATCH_INFO_LEN]) -> Self {
        match patch_info[2] >> 4 {
            0 => SensorFamily::Libre1,
            1 => SensorFamily::LibrePro,
            3 => SensorFamily::Libre2,
            7 => SensorFamily::LibreSense,
            other => SensorFamily::Unknown(other),
        }
    }

    /// Leading character of the printed serial number.
    fn serial_prefix(&self) -> char {
        match self {
            SensorFamily::Libre1 | SensorFamily::Unknown(_) => '0',
            SensorFamily::LibrePro => '1',
            SensorFamily::Libre2 => '3',
            SensorFamily::LibreSense => '7',
        }
    }

    /// Nominal lifetime in minutes.
    #[must_use]
    pub fn lifetime_minutes(&self) -> u32 {
        match self {
            SensorFamily::Libre2 => DEFAULT_LIFETIME_MINUTES + STREAMING_GRACE_MINUTES,
            _ => DEFAULT_LIFETIME_MINUTES,
        }
    }

    /// Warm-up period in minutes.
    #[must_use]
    pub fn warmup_minutes(&self) -> u32 {
        DEFAULT_WARMUP_MINUTES
    }
}

/// Market region, from patch info byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorRegion {
    Europe,
    Usa,
    AustraliaCanada,
    Eastern,
    Unknown(u8),
}

impl SensorRegion {
    /// Decode the region from patch info.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8; PATCH_INFO_LEN]) -> Self {
        match patch_info[3] {
            0x01 => SensorRegion::Europe,
            0x02 => SensorRegion::Usa,
            0x04 => SensorRegion::AustraliaCanada,
            0x08 => SensorRegion::Eastern,
            other => SensorRegion::Unknown(other),
        }
    }
}

/// Sensor model, from patch info byte 0 (and region for shared codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorType {
    Libre1,
    LibreUs14Day,
    LibreProH,
    Libre2Eu,
    Libre2Us,
    Libre2Ca,
    LibreSense,
    Unknown(u8),
}

impl SensorType {
    /// Decode the model from patch info.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8; PATCH_INFO_LEN]) -> Self {
        match patch_info[0] {
            0xDF | 0xA2 => SensorType::Libre1,
            0xE5 | 0xE6 => SensorType::LibreUs14Day,
            0x70 => SensorType::LibreProH,
            0x9D | 0xC5 => SensorType::Libre2Eu,
            0x76 => match SensorFamily::from_patch_info(patch_info) {
                SensorFamily::LibreSense => SensorType::LibreSense,
                _ => match SensorRegion::from_patch_info(patch_info) {
                    SensorRegion::AustraliaCanada => SensorType::Libre2Ca,
                    _ => SensorType::Libre2Us,
                },
            },
            other => SensorType::Unknown(other),
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Libre1 => write!(f, "Libre 1"),
            SensorType::LibreUs14Day => write!(f, "Libre US 14 day"),
            SensorType::LibreProH => write!(f, "Libre Pro/H"),
            SensorType::Libre2Eu => write!(f, "Libre 2 EU"),
            SensorType::Libre2Us => write!(f, "Libre 2 US"),
            SensorType::Libre2Ca => write!(f, "Libre 2 CA"),
            SensorType::LibreSense => write!(f, "Libre Sense"),
            SensorType::Unknown(code) => write!(f, "Unknown (0x{:02X})", code),
        }
    }
}

/// Derive the printed serial number from the UID and family.
///
/// The first six UID bytes (stored least-significant first) form a 48-bit
/// number which is padded to 50 bits and printed as ten base-32 digits,
/// prefixed by the family digit.
#[must_use]
pub fn serial_number(uid: &[u8; SENSOR_UID_LEN], family: SensorFamily) -> String {
    let value = uid[..6]
        .iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
        << 2;

    let mut serial = String::with_capacity(11);
    serial.push(family.serial_prefix());
    for group in (0..10).rev() {
        let index = ((value >> (group * 5)) & 0x1F) as usize;
        serial.push(SERIAL_ALPHABET[index] as char);
    }
    serial
}

/// Lifecycle and calibration data decoded from FRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramInfo {
    pub state: SensorState,
    pub age: u32,
    pub factory_calibration: FactoryCalibration,
}

impl FramInfo {
    /// Decode a FRAM image.
    pub fn from_bytes(fram: &[u8]) -> ParseResult<Self> {
        if fram.len() < FRAM_LEN {
            return Err(ParseError::InsufficientBytes {
                expected: FRAM_LEN,
                actual: fram.len(),
            });
        }

        let read_i32 = |offset: usize| {
            i32::from_le_bytes([
                fram[offset],
                fram[offset + 1],
                fram[offset + 2],
                fram[offset + 3],
            ])
        };

        Ok(Self {
            state: SensorState::from_fram_code(fram[0]),
            age: u32::from(u16::from_le_bytes([fram[2], fram[3]])),
            factory_calibration: FactoryCalibration {
                i1: read_i32(4),
                i2: read_i32(8),
                i3: read_i32(12),
                i4: read_i32(16),
                i5: read_i32(20),
                i6: read_i32(24),
            },
        })
    }

    /// Encode into a FRAM image. Ages above `u16::MAX` saturate.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAM_LEN] {
        let mut fram = [0u8; FRAM_LEN];
        fram[0] = match self.state {
            SensorState::NotYetStarted => 0x01,
            SensorState::Starting => 0x02,
            SensorState::Ready => 0x03,
            SensorState::Expired => 0x04,
            SensorState::Shutdown => 0x05,
            SensorState::Failure => 0x06,
            SensorState::Unknown => 0x00,
        };
        let age = u16::try_from(self.age).unwrap_or(u16::MAX);
        fram[2..4].copy_from_slice(&age.to_le_bytes());

        let fc = &self.factory_calibration;
        for (i, value) in [fc.i1, fc.i2, fc.i3, fc.i4, fc.i5, fc.i6].iter().enumerate() {
            let offset = 4 + i * 4;
            fram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        fram
    }
}

/// A paired sensor.
///
/// Owned exclusively by the store: replaced wholesale on pairing and mutated
/// only through reducer actions (age, state, custom calibration).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sensor {
    /// 8-byte device identifier.
    pub uuid: [u8; SENSOR_UID_LEN],
    /// Vendor/type/region discriminator bytes.
    pub patch_info: [u8; PATCH_INFO_LEN],
    pub family: SensorFamily,
    pub sensor_type: SensorType,
    pub region: SensorRegion,
    /// Printed serial number derived from `uuid` and `family`.
    pub serial: String,
    /// Transport address recorded at pairing, used to reconnect.
    pub address: Option<String>,
    pub factory_calibration: FactoryCalibration,
    pub custom_calibration: CustomCalibration,
    /// Lifetime in minutes.
    pub lifetime: u32,
    /// Warm-up time in minutes.
    pub warmup_time: u32,
    /// Minutes since sensor start.
    pub age: u32,
    pub state: SensorState,
    /// Sensor start, rounded to the minute. Sample timestamps are derived
    /// from this and the sample's age.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub start_timestamp: OffsetDateTime,
}

impl Sensor {
    /// Build a sensor from its identity bytes.
    ///
    /// `now` anchors the start timestamp: `start = now - age`.
    pub fn new(
        uid: &[u8],
        patch_info: &[u8],
        factory_calibration: FactoryCalibration,
        age: u32,
        now: OffsetDateTime,
    ) -> ParseResult<Self> {
        let uuid: [u8; SENSOR_UID_LEN] =
            uid.try_into().map_err(|_| ParseError::InsufficientBytes {
                expected: SENSOR_UID_LEN,
                actual: uid.len(),
            })?;
        let patch_info: [u8; PATCH_INFO_LEN] =
            patch_info
                .try_into()
                .map_err(|_| ParseError::InsufficientBytes {
                    expected: PATCH_INFO_LEN,
                    actual: patch_info.len(),
                })?;

        let family = SensorFamily::from_patch_info(&patch_info);
        let lifetime = family.lifetime_minutes();
        let warmup_time = family.warmup_minutes();
        let start_timestamp =
            crate::glucose::round_to_minute(now - Duration::minutes(i64::from(age)));

        let mut sensor = Self {
            uuid,
            patch_info,
            family,
            sensor_type: SensorType::from_patch_info(&patch_info),
            region: SensorRegion::from_patch_info(&patch_info),
            serial: serial_number(&uuid, family),
            address: None,
            factory_calibration,
            custom_calibration: CustomCalibration::default(),
            lifetime,
            warmup_time,
            age,
            state: SensorState::Unknown,
            start_timestamp,
        };
        sensor.state = sensor.state_for_age(age);
        Ok(sensor)
    }

    /// Build a sensor from the three pairing-time reads.
    ///
    /// The lifecycle byte in FRAM wins over the age-derived state when it
    /// reports a terminal condition (shutdown, failure, not started).
    pub fn from_fram(
        uid: &[u8],
        patch_info: &[u8],
        fram: &[u8],
        now: OffsetDateTime,
    ) -> ParseResult<Self> {
        let info = FramInfo::from_bytes(fram)?;
        let mut sensor = Self::new(uid, patch_info, info.factory_calibration, info.age, now)?;
        if matches!(
            info.state,
            SensorState::NotYetStarted | SensorState::Shutdown | SensorState::Failure
        ) {
            sensor.state = info.state;
        }
        Ok(sensor)
    }

    /// Attach the transport address used to reach this sensor.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Lifecycle state implied by an age in minutes.
    ///
    /// - `age >= lifetime` → [`SensorState::Expired`]
    /// - `warmup < age < lifetime` → [`SensorState::Ready`]
    /// - `age <= warmup` → [`SensorState::Starting`]
    #[must_use]
    pub fn state_for_age(&self, age: u32) -> SensorState {
        if age >= self.lifetime {
            SensorState::Expired
        } else if age > self.warmup_time {
            SensorState::Ready
        } else {
            SensorState::Starting
        }
    }

    /// Minutes left before expiry.
    #[must_use]
    pub fn remaining_minutes(&self) -> u32 {
        self.lifetime.saturating_sub(self.age)
    }

    /// Timestamp of a sample taken at the given sensor age.
    #[must_use]
    pub fn sample_timestamp(&self, sample_age: u32) -> OffsetDateTime {
        self.start_timestamp + Duration::minutes(i64::from(sample_age))
    }

    /// Key material for the telemetry cipher and unlock codec.
    #[must_use]
    pub fn uid(&self) -> &[u8] {
        &self.uuid
    }

    /// Identifier the transport should connect to.
    #[must_use]
    pub fn transport_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.serial)
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial, self.sensor_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
    const PATCH_LIBRE2: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    fn now() -> OffsetDateTime {
        datetime!(2024-03-01 12:00:30 UTC)
    }

    #[test]
    fn test_family_type_region_from_patch_info() {
        assert_eq!(SensorFamily::from_patch_info(&PATCH_LIBRE2), SensorFamily::Libre2);
        assert_eq!(SensorType::from_patch_info(&PATCH_LIBRE2), SensorType::Libre2Eu);
        assert_eq!(SensorRegion::from_patch_info(&PATCH_LIBRE2), SensorRegion::Europe);

        let us = [0x76, 0x00, 0x30, 0x02, 0x00, 0x00];
        assert_eq!(SensorType::from_patch_info(&us), SensorType::Libre2Us);
        let ca = [0x76, 0x00, 0x30, 0x04, 0x00, 0x00];
        assert_eq!(SensorType::from_patch_info(&ca), SensorType::Libre2Ca);
        let sense = [0x76, 0x00, 0x70, 0x02, 0x00, 0x00];
        assert_eq!(SensorType::from_patch_info(&sense), SensorType::LibreSense);
        let unknown = [0x42, 0x00, 0xF0, 0x10, 0x00, 0x00];
        assert_eq!(SensorType::from_patch_info(&unknown), SensorType::Unknown(0x42));
        assert_eq!(SensorFamily::from_patch_info(&unknown), SensorFamily::Unknown(0x0F));
        assert_eq!(SensorRegion::from_patch_info(&unknown), SensorRegion::Unknown(0x10));
    }

    #[test]
    fn test_serial_number_zero_uid() {
        let serial = serial_number(&[0; 8], SensorFamily::Libre1);
        assert_eq!(serial, "00000000000");
    }

    #[test]
    fn test_serial_number_shape() {
        let serial = serial_number(&UID, SensorFamily::Libre2);
        assert_eq!(serial.len(), 11);
        assert!(serial.starts_with('3'));
        assert!(serial.bytes().all(|b| SERIAL_ALPHABET.contains(&b)));
        // Bytes 6 and 7 do not participate.
        let mut other = UID;
        other[6] = 0;
        other[7] = 0;
        assert_eq!(serial_number(&other, SensorFamily::Libre2), serial);
    }

    #[test]
    fn test_serial_number_last_digit() {
        // Only the lowest 3 bits of uid[0] land in the last digit (after the 2-bit pad).
        let mut uid = [0u8; 8];
        uid[0] = 0x01;
        assert_eq!(serial_number(&uid, SensorFamily::Libre1), "00000000004");
    }

    #[test]
    fn test_sensor_new_rejects_bad_lengths() {
        let err = Sensor::new(&UID[..7], &PATCH_LIBRE2, FactoryCalibration::identity(), 0, now())
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                expected: 8,
                actual: 7
            }
        );
        assert!(
            Sensor::new(&UID, &PATCH_LIBRE2[..5], FactoryCalibration::identity(), 0, now())
                .is_err()
        );
    }

    #[test]
    fn test_state_for_age_boundaries() {
        let sensor =
            Sensor::new(&UID, &PATCH_LIBRE2, FactoryCalibration::identity(), 0, now()).unwrap();
        assert_eq!(sensor.state_for_age(0), SensorState::Starting);
        assert_eq!(sensor.state_for_age(60), SensorState::Starting);
        assert_eq!(sensor.state_for_age(61), SensorState::Ready);
        assert_eq!(sensor.state_for_age(sensor.lifetime - 1), SensorState::Ready);
        assert_eq!(sensor.state_for_age(sensor.lifetime), SensorState::Expired);
        assert_eq!(sensor.state_for_age(sensor.lifetime + 100), SensorState::Expired);
    }

    #[test]
    fn test_start_timestamp_rounded() {
        let sensor =
            Sensor::new(&UID, &PATCH_LIBRE2, FactoryCalibration::identity(), 120, now()).unwrap();
        assert_eq!(sensor.start_timestamp, datetime!(2024-03-01 10:00 UTC));
        assert_eq!(sensor.sample_timestamp(120), datetime!(2024-03-01 12:00 UTC));
        assert_eq!(sensor.state, SensorState::Ready);
        assert_eq!(sensor.lifetime, 20880);
    }

    #[test]
    fn test_fram_roundtrip_and_terminal_state() {
        let info = FramInfo {
            state: SensorState::Shutdown,
            age: 500,
            factory_calibration: FactoryCalibration {
                i1: 1,
                i2: -2,
                i3: 300,
                i4: 4000,
                i5: -50,
                i6: 6000,
            },
        };
        let bytes = info.to_bytes();
        assert_eq!(FramInfo::from_bytes(&bytes).unwrap(), info);

        let sensor = Sensor::from_fram(&UID, &PATCH_LIBRE2, &bytes, now()).unwrap();
        assert_eq!(sensor.state, SensorState::Shutdown);
        assert_eq!(sensor.age, 500);
        assert_eq!(sensor.factory_calibration.i2, -2);
    }

    #[test]
    fn test_fram_too_short() {
        let err = FramInfo::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("requires 28 bytes"));
    }

    #[test]
    fn test_transport_address_falls_back_to_serial() {
        let sensor =
            Sensor::new(&UID, &PATCH_LIBRE2, FactoryCalibration::identity(), 0, now()).unwrap();
        assert_eq!(sensor.transport_address(), sensor.serial);
        let sensor = sensor.with_address("AA:BB:CC:DD:EE:FF");
        assert_eq!(sensor.transport_address(), "AA:BB:CC:DD:EE:FF");
    }
}

//! Bluetooth UUIDs for the sensor's streaming service.
//!
//! The sensor exposes one custom service carrying every characteristic the
//! acquisition pipeline needs: identity reads at pairing time, the unlock
//! write, and the telemetry notification stream.

use uuid::{Uuid, uuid};

/// Custom sensor service advertised by streaming-capable sensors.
pub const SENSOR_SERVICE: Uuid = uuid!("0000fde3-0000-1000-8000-00805f9b34fb");

/// Telemetry notifications; each notification carries one chunk of a frame.
pub const DATA_CHARACTERISTIC: Uuid = uuid!("0000f001-0000-1000-8000-00805f9b34fb");

/// Unlock payload write.
pub const UNLOCK_CHARACTERISTIC: Uuid = uuid!("0000f002-0000-1000-8000-00805f9b34fb");

/// Sensor UID (8 bytes), read at pairing time.
pub const UID_CHARACTERISTIC: Uuid = uuid!("0000f003-0000-1000-8000-00805f9b34fb");

/// Patch info (6 bytes), read at pairing time.
pub const PATCH_INFO_CHARACTERISTIC: Uuid = uuid!("0000f004-0000-1000-8000-00805f9b34fb");

/// FRAM image holding factory calibration and lifecycle data.
pub const FRAM_CHARACTERISTIC: Uuid = uuid!("0000f005-0000-1000-8000-00805f9b34fb");

/// Characteristics that must be present for a session to proceed.
pub const REQUIRED_CHARACTERISTICS: [Uuid; 2] = [DATA_CHARACTERISTIC, UNLOCK_CHARACTERISTIC];

/// Characteristics read during pairing in addition to the required ones.
pub const PAIRING_CHARACTERISTICS: [Uuid; 3] = [
    UID_CHARACTERISTIC,
    PATCH_INFO_CHARACTERISTIC,
    FRAM_CHARACTERISTIC,
];

/// Advertised local-name prefix of compatible sensors.
pub const ADVERTISED_NAME_PREFIX: &str = "CGM";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristics_are_distinct() {
        let all = [
            DATA_CHARACTERISTIC,
            UNLOCK_CHARACTERISTIC,
            UID_CHARACTERISTIC,
            PATCH_INFO_CHARACTERISTIC,
            FRAM_CHARACTERISTIC,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(!all.contains(&SENSOR_SERVICE));
    }
}

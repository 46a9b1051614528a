//! Unlock payload generation and the unlock counter.
//!
//! Every streaming session starts with a write of a 12-byte payload to the
//! unlock characteristic: the counter followed by an 8-byte tag derived from
//! the sensor identity and that counter. The counter increases on every
//! attempt so a captured payload cannot be replayed.

use aes::cipher::{BlockEncrypt, generic_array::GenericArray};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use cgm_types::SENSOR_UID_LEN;

use crate::decoder::sensor_cipher;
use crate::error::{Error, Result};

/// Length of the unlock payload.
pub const UNLOCK_PAYLOAD_LEN: usize = 12;

/// Patch info bytes that participate in the tag.
const PATCH_INFO_TAG_LEN: usize = 4;

/// Builds unlock payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlockCodec;

impl UnlockCodec {
    /// Build the payload for `counter`.
    ///
    /// Pure in its inputs. Fails with [`Error::Auth`] when the UID is not
    /// exactly 8 bytes or the patch info is too short.
    pub fn unlock_payload(&self, uid: &[u8], patch_info: &[u8], counter: u32) -> Result<Bytes> {
        let uid: &[u8; SENSOR_UID_LEN] = uid.try_into().map_err(|_| {
            Error::Auth(format!(
                "sensor UID must be {} bytes, got {}",
                SENSOR_UID_LEN,
                uid.len()
            ))
        })?;
        if patch_info.len() < PATCH_INFO_TAG_LEN {
            return Err(Error::Auth(format!(
                "patch info must be at least {} bytes, got {}",
                PATCH_INFO_TAG_LEN,
                patch_info.len()
            )));
        }

        let mut input = [0u8; 16];
        input[..SENSOR_UID_LEN].copy_from_slice(uid);
        input[SENSOR_UID_LEN..SENSOR_UID_LEN + PATCH_INFO_TAG_LEN]
            .copy_from_slice(&patch_info[..PATCH_INFO_TAG_LEN]);
        input[12..].copy_from_slice(&counter.to_le_bytes());

        let mut block = GenericArray::clone_from_slice(&input);
        sensor_cipher(uid).encrypt_block(&mut block);

        let mut payload = BytesMut::with_capacity(UNLOCK_PAYLOAD_LEN);
        payload.put_u32_le(counter);
        payload.put_slice(&block[..UNLOCK_PAYLOAD_LEN - 4]);
        Ok(payload.freeze())
    }
}

/// Monotonic unlock counter, persisted across sessions.
///
/// Only a fresh pairing resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnlockCounter {
    value: u32,
}

impl UnlockCounter {
    /// Resume from a persisted value.
    pub fn new(value: u32) -> Self {
        Self { value }
    }

    /// Advance and return the value to use for the next unlock.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        self.value = self.value.saturating_add(1);
        self.value
    }

    /// Last value handed out.
    pub fn current(&self) -> u32 {
        self.value
    }

    /// Back to zero, for a new sensor identity.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
    const PATCH: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    #[test]
    fn test_payload_layout() {
        let payload = UnlockCodec.unlock_payload(&UID, &PATCH, 7).unwrap();
        assert_eq!(payload.len(), UNLOCK_PAYLOAD_LEN);
        assert_eq!(&payload[..4], &7u32.to_le_bytes());
    }

    #[test]
    fn test_payload_is_pure() {
        let a = UnlockCodec.unlock_payload(&UID, &PATCH, 3).unwrap();
        let b = UnlockCodec.unlock_payload(&UID, &PATCH, 3).unwrap();
        assert_eq!(a, b);
        let c = UnlockCodec.unlock_payload(&UID, &PATCH, 4).unwrap();
        assert_ne!(a[4..], c[4..]);
    }

    #[test]
    fn test_payload_depends_on_identity() {
        let mut other = UID;
        other[7] ^= 0x01;
        let a = UnlockCodec.unlock_payload(&UID, &PATCH, 1).unwrap();
        let b = UnlockCodec.unlock_payload(&other, &PATCH, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bad_uid_length_is_auth_error() {
        let err = UnlockCodec.unlock_payload(&UID[..6], &PATCH, 1).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.is_critical());
        assert!(matches!(
            UnlockCodec.unlock_payload(&UID, &PATCH[..2], 1),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_counter_strictly_increases_until_reset() {
        let mut counter = UnlockCounter::default();
        let mut last = counter.current();
        for _ in 0..20 {
            let next = counter.next();
            assert!(next > last);
            last = next;
        }
        counter.reset();
        assert_eq!(counter.current(), 0);
        assert_eq!(UnlockCounter::new(41).next(), 42);
    }
}

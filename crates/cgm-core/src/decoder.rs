//! Telemetry frame decryption and parsing.
//!
//! A complete frame from the [`FrameReassembler`](crate::FrameReassembler)
//! is decrypted with a key derived from the sensor UID, checked against its
//! embedded CRC, and parsed into trend and history samples.
//!
//! # Decrypted layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 28 | 7 trend samples, most-recent-first |
//! | 28 | 12 | 3 history samples, oldest-first |
//! | 40 | 2 | sensor age in minutes (u16 LE) |
//! | 42 | 2 | reserved |
//! | 44 | 2 | CRC-16/IBM-3740 of bytes 0..44 (LE) |
//!
//! Each sample is two little-endian words: `word0 & 0x3FFF` is the raw
//! glucose value and bit 15 flags a fault; `word1 & 0x3FFF` is the raw
//! temperature, or the fault code when the sample is flagged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use crc::{CRC_16_IBM_3740, Crc};
use time::{Duration, OffsetDateTime};

use cgm_types::{
    ParseError, RawReading, SENSOR_UID_LEN, SampleQuality, Sensor, SensorState, round_to_minute,
};

use crate::error::{Error, Result};
use crate::reassembler::FRAME_SIZE;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Salt mixed into the UID to form the AES key.
const KEY_SALT: [u8; 16] = [
    0x4C, 0x1B, 0x9E, 0x03, 0xA7, 0x52, 0xD8, 0x6F, 0x31, 0xC4, 0x0A, 0xE9, 0x76, 0x2D, 0xB5, 0x88,
];

/// Minutes before the frame age at which each trend sample was taken.
pub const TREND_OFFSETS: [u32; 7] = [0, 2, 4, 6, 7, 12, 15];

/// Number of history samples per frame.
pub const HISTORY_LEN: usize = 3;

/// Spacing of history samples in minutes.
pub const HISTORY_INTERVAL: u32 = 15;

const SAMPLE_LEN: usize = 4;
const HISTORY_OFFSET: usize = TREND_OFFSETS.len() * SAMPLE_LEN;
const AGE_OFFSET: usize = HISTORY_OFFSET + HISTORY_LEN * SAMPLE_LEN;
const CRC_OFFSET: usize = AGE_OFFSET + 4;

const FAULT_FLAG: u16 = 0x8000;
const VALUE_MASK: u16 = 0x3FFF;

/// Build the AES key for a sensor.
pub(crate) fn sensor_cipher(uid: &[u8; SENSOR_UID_LEN]) -> Aes128 {
    let mut key = KEY_SALT;
    for (i, byte) in key.iter_mut().enumerate() {
        *byte ^= uid[i % SENSOR_UID_LEN];
    }
    Aes128::new(GenericArray::from_slice(&key))
}

/// Decrypt/encrypt capability for telemetry frames.
///
/// Keyed by sensor identity: a wrong UID or a corrupted frame must yield
/// [`Error::Decrypt`].
pub trait TelemetryCipher: Send + Sync + fmt::Debug {
    /// Decrypt and verify a frame.
    fn decrypt(&self, uid: &[u8], frame: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt a plaintext frame (already carrying its CRC).
    fn encrypt(&self, uid: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// AES-128 counter-mode cipher keyed by the sensor UID, with CRC check.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedStreamCipher;

impl KeyedStreamCipher {
    fn apply_keystream(uid: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let uid: &[u8; SENSOR_UID_LEN] = uid.try_into().map_err(|_| {
            Error::decrypt(format!(
                "sensor UID must be {} bytes, got {}",
                SENSOR_UID_LEN,
                uid.len()
            ))
        })?;
        if data.len() != FRAME_SIZE {
            return Err(Error::decrypt(format!(
                "frame must be {} bytes, got {}",
                FRAME_SIZE,
                data.len()
            )));
        }

        let cipher = sensor_cipher(uid);
        let mut out = data.to_vec();
        for (block_index, chunk) in out.chunks_mut(16).enumerate() {
            let mut counter = [0u8; 16];
            counter[..SENSOR_UID_LEN].copy_from_slice(uid);
            counter[SENSOR_UID_LEN..SENSOR_UID_LEN + 4]
                .copy_from_slice(&(block_index as u32).to_le_bytes());
            let mut block = GenericArray::clone_from_slice(&counter);
            cipher.encrypt_block(&mut block);
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
        Ok(out)
    }
}

impl TelemetryCipher for KeyedStreamCipher {
    fn decrypt(&self, uid: &[u8], frame: &[u8]) -> Result<Vec<u8>> {
        let plain = Self::apply_keystream(uid, frame)?;
        let stored = u16::from_le_bytes([plain[CRC_OFFSET], plain[CRC_OFFSET + 1]]);
        let computed = CRC16.checksum(&plain[..CRC_OFFSET]);
        if stored != computed {
            return Err(Error::decrypt(format!(
                "CRC mismatch: frame {:#06X}, computed {:#06X}",
                stored, computed
            )));
        }
        Ok(plain)
    }

    fn encrypt(&self, uid: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        Self::apply_keystream(uid, plaintext)
    }
}

/// One sample as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireSample {
    pub raw_glucose: u16,
    pub raw_temperature: u16,
    /// Fault reported by the sensor; the raw values are ignored when set.
    pub fault: Option<SampleQuality>,
}

impl WireSample {
    #[must_use]
    pub fn valid(raw_glucose: u16, raw_temperature: u16) -> Self {
        Self {
            raw_glucose: raw_glucose & VALUE_MASK,
            raw_temperature: raw_temperature & VALUE_MASK,
            fault: None,
        }
    }

    #[must_use]
    pub fn faulted(quality: SampleQuality) -> Self {
        Self {
            fault: Some(quality),
            ..Self::default()
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let word0 = u16::from_le_bytes([bytes[0], bytes[1]]);
        let word1 = u16::from_le_bytes([bytes[2], bytes[3]]);
        if word0 & FAULT_FLAG != 0 {
            Self {
                raw_glucose: 0,
                raw_temperature: 0,
                fault: Some(SampleQuality::from_code(word1)),
            }
        } else {
            Self::valid(word0, word1)
        }
    }

    fn to_bytes(self) -> [u8; SAMPLE_LEN] {
        let (word0, word1) = match self.fault {
            Some(quality) => (FAULT_FLAG, quality.code()),
            None => (self.raw_glucose & VALUE_MASK, self.raw_temperature & VALUE_MASK),
        };
        let mut out = [0u8; SAMPLE_LEN];
        out[..2].copy_from_slice(&word0.to_le_bytes());
        out[2..].copy_from_slice(&word1.to_le_bytes());
        out
    }

    fn into_reading(self, timestamp: OffsetDateTime) -> RawReading {
        match self.fault {
            Some(quality) => RawReading::faulted(timestamp, quality),
            None => RawReading::valid(
                timestamp,
                f64::from(self.raw_glucose),
                Some(f64::from(self.raw_temperature)),
            ),
        }
    }
}

/// Build a plaintext frame with a valid CRC.
///
/// Ages above `u16::MAX` saturate.
#[must_use]
pub fn encode_frame(
    age: u32,
    trend: &[WireSample; TREND_OFFSETS.len()],
    history: &[WireSample; HISTORY_LEN],
) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    for (i, sample) in trend.iter().chain(history.iter()).enumerate() {
        frame[i * SAMPLE_LEN..(i + 1) * SAMPLE_LEN].copy_from_slice(&sample.to_bytes());
    }
    let age = u16::try_from(age).unwrap_or(u16::MAX);
    frame[AGE_OFFSET..AGE_OFFSET + 2].copy_from_slice(&age.to_le_bytes());
    let crc = CRC16.checksum(&frame[..CRC_OFFSET]);
    frame[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Age of the newest history sample in a frame of the given age.
#[must_use]
pub fn history_anchor(age: u32) -> u32 {
    (age.saturating_sub(3) / HISTORY_INTERVAL) * HISTORY_INTERVAL
}

/// Parsed content of one telemetry frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Sensor age in minutes.
    pub age: u32,
    /// Most-recent-first trend samples.
    pub trend: Vec<RawReading>,
    /// Oldest-first history samples.
    pub history: Vec<RawReading>,
}

impl DecodedFrame {
    /// Trend and history merged into one ascending sequence.
    ///
    /// Samples falling on the same minute are coalesced; the trend sample
    /// wins.
    #[must_use]
    pub fn readings(&self) -> Vec<RawReading> {
        let mut by_minute = BTreeMap::new();
        for reading in self.history.iter().chain(self.trend.iter()) {
            by_minute.insert(reading.timestamp, *reading);
        }
        by_minute.into_values().collect()
    }
}

/// Decrypts and parses frames for one sensor.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    cipher: Arc<dyn TelemetryCipher>,
}

impl TelemetryDecoder {
    pub fn new(cipher: Arc<dyn TelemetryCipher>) -> Self {
        Self { cipher }
    }

    /// Decrypt a complete frame.
    pub fn decrypt(&self, uid: &[u8], frame: &[u8]) -> Result<Vec<u8>> {
        self.cipher.decrypt(uid, frame)
    }

    /// Parse a decrypted frame received at `now`.
    ///
    /// Samples whose age would precede sensor start are skipped.
    pub fn parse(&self, decrypted: &[u8], now: OffsetDateTime) -> Result<DecodedFrame> {
        if decrypted.len() < CRC_OFFSET {
            return Err(ParseError::InsufficientBytes {
                expected: CRC_OFFSET,
                actual: decrypted.len(),
            }
            .into());
        }

        let age = u32::from(u16::from_le_bytes([
            decrypted[AGE_OFFSET],
            decrypted[AGE_OFFSET + 1],
        ]));
        let now = round_to_minute(now);
        let at_age = |sample_age: u32| now - Duration::minutes(i64::from(age - sample_age));

        let trend = TREND_OFFSETS
            .iter()
            .enumerate()
            .filter(|(_, offset)| **offset <= age)
            .map(|(i, offset)| {
                let bytes = &decrypted[i * SAMPLE_LEN..(i + 1) * SAMPLE_LEN];
                WireSample::from_bytes(bytes).into_reading(at_age(age - offset))
            })
            .collect();

        let anchor = history_anchor(age);
        let history = (0..HISTORY_LEN)
            .filter_map(|i| {
                let back = (HISTORY_LEN - 1 - i) as u32 * HISTORY_INTERVAL;
                let sample_age = anchor.checked_sub(back)?;
                let start = HISTORY_OFFSET + i * SAMPLE_LEN;
                let bytes = &decrypted[start..start + SAMPLE_LEN];
                Some(WireSample::from_bytes(bytes).into_reading(at_age(sample_age)))
            })
            .collect();

        Ok(DecodedFrame {
            age,
            trend,
            history,
        })
    }

    /// Decrypt then parse.
    pub fn decode(&self, uid: &[u8], frame: &[u8], now: OffsetDateTime) -> Result<DecodedFrame> {
        let decrypted = self.decrypt(uid, frame)?;
        self.parse(&decrypted, now)
    }

    /// Lifecycle state for a sensor reporting `age`.
    #[must_use]
    pub fn derive_state(sensor: &Sensor, age: u32) -> SensorState {
        sensor.state_for_age(age)
    }
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new(Arc::new(KeyedStreamCipher))
    }
}

//! Core enums shared by the acquisition pipeline and its collaborators.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Link state between the host and the sensor.
///
/// Transitions are driven only by the connection state machine; every other
/// component observes this value through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No link, nothing in flight.
    #[default]
    Disconnected,
    /// Discovering advertising sensors.
    Scanning,
    /// Link requested, waiting for the transport's connect callback.
    Connecting,
    /// Link up and streaming telemetry.
    Connected,
    /// The radio adapter is powered off.
    PoweredOff,
    /// State could not be determined.
    Unknown,
}

impl ConnectionState {
    /// Whether a link is established or being established.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning | ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::PoweredOff => write!(f, "Powered off"),
            ConnectionState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Sensor lifecycle state.
///
/// Decoded from FRAM at pairing time and afterwards derived from the sensor
/// age reported in every telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum SensorState {
    /// Sensor has not been activated.
    NotYetStarted,
    /// Warming up; readings are not yet reliable.
    Starting,
    /// Producing readings.
    Ready,
    /// Past its lifetime; still reports age, no readings.
    Expired,
    /// Shut down by the sensor firmware.
    Shutdown,
    /// Sensor reported a hardware failure.
    Failure,
    /// Unknown lifecycle code.
    #[default]
    Unknown,
}

impl SensorState {
    /// Decode the lifecycle byte stored in FRAM.
    #[must_use]
    pub fn from_fram_code(code: u8) -> Self {
        match code {
            0x01 => SensorState::NotYetStarted,
            0x02 => SensorState::Starting,
            0x03 => SensorState::Ready,
            0x04 => SensorState::Expired,
            0x05 => SensorState::Shutdown,
            0x06 => SensorState::Failure,
            _ => SensorState::Unknown,
        }
    }

    /// Whether readings produced in this state may be calibrated and stored.
    #[must_use]
    pub fn produces_readings(&self) -> bool {
        matches!(self, SensorState::Ready)
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorState::NotYetStarted => write!(f, "Not yet started"),
            SensorState::Starting => write!(f, "Warming up"),
            SensorState::Ready => write!(f, "Ready"),
            SensorState::Expired => write!(f, "Expired"),
            SensorState::Shutdown => write!(f, "Shut down"),
            SensorState::Failure => write!(f, "Failure"),
            SensorState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Per-sample quality as flagged by the sensor.
///
/// A faulted sample never carries a numeric value; downstream consumers use
/// this to tell "no signal" apart from a normal reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum SampleQuality {
    /// Sample is usable.
    #[default]
    Ok,
    /// Measured value outside the sensor's measurable range.
    OutOfRange,
    /// Signal too noisy to produce a value.
    Noisy,
    /// Sensor lost contact with interstitial fluid.
    SignalLoss,
    /// Value was not finite or calibration could not be applied.
    InvalidValue,
    /// Fault code not known to this library.
    Other(u16),
}

impl SampleQuality {
    /// Decode the fault code carried by a flagged sample.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => SampleQuality::Ok,
            1 => SampleQuality::OutOfRange,
            2 => SampleQuality::Noisy,
            3 => SampleQuality::SignalLoss,
            other => SampleQuality::Other(other),
        }
    }

    /// Wire code for this quality; `InvalidValue` is host-side only.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            SampleQuality::Ok => 0,
            SampleQuality::OutOfRange => 1,
            SampleQuality::Noisy => 2,
            SampleQuality::SignalLoss => 3,
            SampleQuality::InvalidValue => 0xFF,
            SampleQuality::Other(code) => *code,
        }
    }

    /// Whether the sample is usable.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, SampleQuality::Ok)
    }
}

impl fmt::Display for SampleQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleQuality::Ok => write!(f, "OK"),
            SampleQuality::OutOfRange => write!(f, "Out of range"),
            SampleQuality::Noisy => write!(f, "Noisy"),
            SampleQuality::SignalLoss => write!(f, "Signal loss"),
            SampleQuality::InvalidValue => write!(f, "Invalid value"),
            SampleQuality::Other(code) => write!(f, "Fault 0x{:04X}", code),
        }
    }
}

/// Origin of a glucose value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GlucoseType {
    /// Derived from sensor telemetry.
    #[default]
    Cgm,
    /// Manual blood glucose meter entry.
    Bgm,
}

/// Slope thresholds (per minute, in glucose units) separating trend classes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrendThresholds {
    /// Magnitude above which the change is rapid.
    pub rapid: f64,
    /// Magnitude above which the change is fast.
    pub fast: f64,
    /// Magnitude above which the change is moderate.
    pub moderate: f64,
}

impl Default for TrendThresholds {
    fn default() -> Self {
        Self {
            rapid: 3.5,
            fast: 2.0,
            moderate: 1.0,
        }
    }
}

/// Direction and speed of glucose change.
///
/// # Ordering
///
/// Variants are ordered from fastest falling to fastest rising, with
/// `Unknown` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Trend {
    RapidlyFalling,
    FastFalling,
    Falling,
    Constant,
    Rising,
    FastRising,
    RapidlyRising,
    #[default]
    Unknown,
}

impl Trend {
    /// Classify a per-minute change against the given thresholds.
    ///
    /// Symmetric for rising and falling; `None` yields [`Trend::Unknown`].
    ///
    /// # Examples
    ///
    /// ```
    /// use cgm_types::{Trend, TrendThresholds};
    ///
    /// let t = TrendThresholds::default();
    /// assert_eq!(Trend::classify(Some(2.5), &t), Trend::FastRising);
    /// assert_eq!(Trend::classify(Some(-1.5), &t), Trend::Falling);
    /// assert_eq!(Trend::classify(Some(0.4), &t), Trend::Constant);
    /// assert_eq!(Trend::classify(None, &t), Trend::Unknown);
    /// ```
    #[must_use]
    pub fn classify(minute_change: Option<f64>, thresholds: &TrendThresholds) -> Self {
        let Some(change) = minute_change.filter(|c| c.is_finite()) else {
            return Trend::Unknown;
        };
        let magnitude = change.abs();
        let rising = change > 0.0;

        if magnitude > thresholds.rapid {
            if rising { Trend::RapidlyRising } else { Trend::RapidlyFalling }
        } else if magnitude > thresholds.fast {
            if rising { Trend::FastRising } else { Trend::FastFalling }
        } else if magnitude > thresholds.moderate {
            if rising { Trend::Rising } else { Trend::Falling }
        } else {
            Trend::Constant
        }
    }

    /// Arrow glyph for compact display.
    #[must_use]
    pub fn arrow(&self) -> &'static str {
        match self {
            Trend::RapidlyFalling => "↓↓",
            Trend::FastFalling => "↓",
            Trend::Falling => "↘",
            Trend::Constant => "→",
            Trend::Rising => "↗",
            Trend::FastRising => "↑",
            Trend::RapidlyRising => "↑↑",
            Trend::Unknown => "?",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::RapidlyFalling => write!(f, "Rapidly falling"),
            Trend::FastFalling => write!(f, "Fast falling"),
            Trend::Falling => write!(f, "Falling"),
            Trend::Constant => write!(f, "Constant"),
            Trend::Rising => write!(f, "Rising"),
            Trend::FastRising => write!(f, "Fast rising"),
            Trend::RapidlyRising => write!(f, "Rapidly rising"),
            Trend::Unknown => write!(f, "Unknown"),
        }
    }
}

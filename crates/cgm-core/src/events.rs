//! Event surface for collaborators outside the core.
//!
//! Notification, export and display layers subscribe to [`CoreEvent`]s
//! through an [`EventDispatcher`] handle instead of reading store state.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use cgm_types::{CalibratedGlucose, ConnectionState, Sensor, SensorState};

/// Events emitted by the core after a committed state change.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CoreEvent {
    /// A new sensor was paired.
    SensorPaired { sensor: Box<Sensor> },
    /// The link state changed.
    ConnectionStateChanged { state: ConnectionState },
    /// A frame reported a new sensor age.
    SensorAgeChanged { age: u32, state: SensorState },
    /// Values were appended to the glucose history.
    GlucoseAdded { values: Vec<CalibratedGlucose> },
    /// No reading arrived within the expected window.
    MissedReading { count: u32 },
    /// An error was surfaced by the acquisition pipeline.
    ConnectionError {
        message: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        is_critical: bool,
    },
}

impl CoreEvent {
    /// Short name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::SensorPaired { .. } => "sensor_paired",
            CoreEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            CoreEvent::SensorAgeChanged { .. } => "sensor_age_changed",
            CoreEvent::GlucoseAdded { .. } => "glucose_added",
            CoreEvent::MissedReading { .. } => "missed_reading",
            CoreEvent::ConnectionError { .. } => "connection_error",
        }
    }
}

/// Sender for core events.
pub type EventSender = broadcast::Sender<CoreEvent>;

/// Receiver for core events.
pub type EventReceiver = broadcast::Receiver<CoreEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: CoreEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

//! Single-writer state container.
//!
//! All producers (transport sessions, timers, user commands) send [`Action`]s
//! to one queue. A single consumer task takes each action, runs the pure
//! [`reduce`] function, publishes the new [`AppState`], and only then hands
//! the post-reduce state and the action to every [`Middleware`]. Actions a
//! middleware emits go back through the same queue.
//!
//! # Sessions
//!
//! `Pair`, `Connect`, `Disconnect` and `ResetSensor` start a new session.
//! Actions produced by a session are wrapped in [`Action::FromSession`]; the
//! consumer drops any whose session is no longer current, so a frame decoded
//! after a disconnect never reaches the state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{BoxStream, StreamExt};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use cgm_types::{
    CalibratedGlucose, ConnectionState, CustomCalibrationPoint, GlucoseType, RawReading, Sensor,
    SensorState,
};

use crate::error::{Error, Result};
use crate::persistence::PersistedState;

/// Generation number of a connection or pairing attempt.
pub type SessionId = u64;

/// Default retention for glucose history.
pub const DEFAULT_GLUCOSE_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// Options for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// How much glucose history to keep in memory.
    pub glucose_horizon: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            glucose_horizon: DEFAULT_GLUCOSE_HORIZON,
            event_capacity: 100,
        }
    }
}

impl StoreConfig {
    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.glucose_horizon < Duration::from_secs(60) {
            return Err(Error::invalid_config(
                "glucose_horizon must be at least one minute",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        Ok(())
    }

    /// Set the glucose horizon.
    #[must_use]
    pub fn glucose_horizon(mut self, horizon: Duration) -> Self {
        self.glucose_horizon = horizon;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Everything the store can be told.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    // --- Commands ---
    /// Pair a new sensor. Ignored while one is paired.
    Pair,
    /// Connect to the paired sensor.
    Connect,
    /// Tear down the current session.
    Disconnect,
    /// User reference value for the latest sensor reading.
    AddCustomCalibration {
        id: Uuid,
        value: f64,
        at: OffsetDateTime,
    },
    RemoveCustomCalibration {
        id: Uuid,
    },
    /// Forget the paired sensor.
    ResetSensor,
    /// Manual blood glucose meter entry.
    AddBloodGlucose {
        value: i32,
        at: OffsetDateTime,
    },

    // --- Pipeline ---
    /// Load previously persisted state.
    Restore(Box<PersistedState>),
    SetSensor(Box<Sensor>),
    SetConnectionState {
        state: ConnectionState,
        at: OffsetDateTime,
    },
    SetConnectionError {
        message: String,
        at: OffsetDateTime,
        is_critical: bool,
    },
    SetSensorAge {
        age: u32,
        state: SensorState,
    },
    SetUnlockCount(u32),
    /// Uncalibrated samples from one frame, ascending.
    AddSensorReadings(Vec<RawReading>),
    AddGlucose(Vec<CalibratedGlucose>),
    MissedReading {
        at: OffsetDateTime,
    },
    /// An action produced by a session; dropped if the session is stale.
    FromSession {
        session: SessionId,
        action: Box<Action>,
    },
}

impl Action {
    /// Calibration command for the latest reading.
    pub fn add_custom_calibration(value: f64) -> Self {
        Action::AddCustomCalibration {
            id: Uuid::new_v4(),
            value,
            at: OffsetDateTime::now_utc(),
        }
    }

    /// Blood glucose entry taken now.
    pub fn add_blood_glucose(value: i32) -> Self {
        Action::AddBloodGlucose {
            value,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn connection_state(state: ConnectionState) -> Self {
        Action::SetConnectionState {
            state,
            at: OffsetDateTime::now_utc(),
        }
    }

    /// Surface an error as state.
    pub fn connection_error(error: &Error) -> Self {
        Action::SetConnectionError {
            message: error.to_string(),
            at: OffsetDateTime::now_utc(),
            is_critical: error.is_critical(),
        }
    }

    /// Tag this action with the session that produced it.
    pub fn in_session(self, session: SessionId) -> Self {
        Action::FromSession {
            session,
            action: Box::new(self),
        }
    }

    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Pair => "pair",
            Action::Connect => "connect",
            Action::Disconnect => "disconnect",
            Action::AddCustomCalibration { .. } => "add_custom_calibration",
            Action::RemoveCustomCalibration { .. } => "remove_custom_calibration",
            Action::ResetSensor => "reset_sensor",
            Action::AddBloodGlucose { .. } => "add_blood_glucose",
            Action::Restore(_) => "restore",
            Action::SetSensor(_) => "set_sensor",
            Action::SetConnectionState { .. } => "set_connection_state",
            Action::SetConnectionError { .. } => "set_connection_error",
            Action::SetSensorAge { .. } => "set_sensor_age",
            Action::SetUnlockCount(_) => "set_unlock_count",
            Action::AddSensorReadings(_) => "add_sensor_readings",
            Action::AddGlucose(_) => "add_glucose",
            Action::MissedReading { .. } => "missed_reading",
            Action::FromSession { .. } => "from_session",
        }
    }
}

/// The single authoritative state.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub sensor: Option<Sensor>,
    pub connection_state: ConnectionState,
    pub connection_error: Option<String>,
    pub connection_error_at: Option<OffsetDateTime>,
    pub connection_error_is_critical: bool,
    /// Last unlock counter value used with the paired sensor.
    pub unlock_count: u32,
    /// Sensor values, strictly ascending by timestamp.
    pub glucose_values: Vec<CalibratedGlucose>,
    /// Manual entries, ascending by timestamp.
    pub blood_glucose_values: Vec<CalibratedGlucose>,
    /// Consecutive missed readings since the last reading.
    pub missed_readings: u32,
    pub last_reading_at: Option<OffsetDateTime>,
    pub connected_at: Option<OffsetDateTime>,
    /// Current session generation.
    pub session: SessionId,
    pub glucose_horizon: time::Duration,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

impl AppState {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            sensor: None,
            connection_state: ConnectionState::Disconnected,
            connection_error: None,
            connection_error_at: None,
            connection_error_is_critical: false,
            unlock_count: 0,
            glucose_values: Vec::new(),
            blood_glucose_values: Vec::new(),
            missed_readings: 0,
            last_reading_at: None,
            connected_at: None,
            session: 0,
            glucose_horizon: time::Duration::seconds(
                i64::try_from(config.glucose_horizon.as_secs()).unwrap_or(i64::MAX),
            ),
        }
    }

    /// No sensor is paired.
    pub fn is_pairable(&self) -> bool {
        self.sensor.is_none()
    }

    /// Newest sensor value that carries a number.
    pub fn latest_sensor_glucose(&self) -> Option<&CalibratedGlucose> {
        self.glucose_values.iter().rev().find(|g| g.is_valid())
    }

    /// Timestamp of the newest sensor value, valid or not.
    pub fn latest_glucose_timestamp(&self) -> Option<OffsetDateTime> {
        self.glucose_values.last().map(|g| g.timestamp)
    }

    /// The persisted subset of this state.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            sensor: self.sensor.clone(),
            unlock_count: self.unlock_count,
            glucose_values: self.glucose_values.clone(),
            blood_glucose_values: self.blood_glucose_values.clone(),
        }
    }

    fn clear_connection_error(&mut self) {
        self.connection_error = None;
        self.connection_error_at = None;
        self.connection_error_is_critical = false;
    }

    fn next_session(&mut self) {
        self.session = self.session.wrapping_add(1);
    }

    fn prune(&mut self) {
        let newest = [
            self.glucose_values.last().map(|g| g.timestamp),
            self.blood_glucose_values.last().map(|g| g.timestamp),
        ]
        .into_iter()
        .flatten()
        .max();
        if let Some(newest) = newest {
            let cutoff = newest - self.glucose_horizon;
            self.glucose_values.retain(|g| g.timestamp >= cutoff);
            self.blood_glucose_values.retain(|g| g.timestamp >= cutoff);
        }
    }
}

/// Apply one action to the state.
///
/// Pure: no I/O, no clocks. `FromSession` wrappers are expected to be
/// resolved by the caller; an unresolved one is unwrapped here.
pub fn reduce(mut state: AppState, action: &Action) -> AppState {
    match action {
        Action::Pair => {
            if state.is_pairable() {
                state.next_session();
                state.clear_connection_error();
            }
        }
        Action::Connect => {
            if state.sensor.is_some() {
                state.next_session();
            }
        }
        Action::Disconnect => {
            state.next_session();
            state.connection_state = ConnectionState::Disconnected;
            state.connected_at = None;
        }
        Action::ResetSensor => {
            state.next_session();
            state.sensor = None;
            state.unlock_count = 0;
            state.connection_state = ConnectionState::Disconnected;
            state.connected_at = None;
            state.missed_readings = 0;
            state.clear_connection_error();
        }
        Action::AddCustomCalibration { id, value, at } => {
            let x = state.latest_sensor_glucose().and_then(|g| g.raw_value);
            match (state.sensor.as_mut(), x) {
                (Some(sensor), Some(x)) => {
                    sensor.custom_calibration.push(CustomCalibrationPoint {
                        id: *id,
                        timestamp: *at,
                        x,
                        y: *value,
                    });
                }
                _ => debug!("Ignoring custom calibration without a sensor reading"),
            }
        }
        Action::RemoveCustomCalibration { id } => {
            if let Some(sensor) = state.sensor.as_mut() {
                sensor.custom_calibration.remove(*id);
            }
        }
        Action::AddBloodGlucose { value, at } => {
            let entry = CalibratedGlucose::blood_glucose(*at, *value);
            let index = state
                .blood_glucose_values
                .partition_point(|g| g.timestamp <= entry.timestamp);
            state.blood_glucose_values.insert(index, entry);
            state.prune();
        }
        Action::Restore(persisted) => {
            let persisted = persisted.as_ref().clone();
            state.sensor = persisted.sensor;
            state.unlock_count = persisted.unlock_count;
            state.glucose_values = persisted.glucose_values;
            state.glucose_values.sort_by_key(|g| g.timestamp);
            state.glucose_values.dedup_by_key(|g| g.timestamp);
            state.blood_glucose_values = persisted.blood_glucose_values;
            state.blood_glucose_values.sort_by_key(|g| g.timestamp);
            state.last_reading_at = state.latest_glucose_timestamp();
            state.prune();
        }
        Action::SetSensor(sensor) => {
            state.sensor = Some(sensor.as_ref().clone());
            state.unlock_count = 0;
            state.clear_connection_error();
        }
        Action::SetConnectionState { state: connection, at } => {
            state.connection_state = *connection;
            match connection {
                ConnectionState::Connected => {
                    state.clear_connection_error();
                    state.connected_at = Some(*at);
                }
                ConnectionState::Disconnected | ConnectionState::PoweredOff => {
                    state.connected_at = None;
                }
                _ => {}
            }
        }
        Action::SetConnectionError {
            message,
            at,
            is_critical,
        } => {
            state.connection_error = Some(message.clone());
            state.connection_error_at = Some(*at);
            state.connection_error_is_critical = *is_critical;
        }
        Action::SetSensorAge { age, state: lifecycle } => {
            if let Some(sensor) = state.sensor.as_mut() {
                sensor.age = *age;
                sensor.state = *lifecycle;
            }
        }
        Action::SetUnlockCount(count) => {
            if *count > state.unlock_count {
                state.unlock_count = *count;
            }
        }
        Action::AddSensorReadings(_) => {}
        Action::AddGlucose(values) => {
            let mut newest = state.latest_glucose_timestamp();
            let mut appended = false;
            for value in values.iter().filter(|g| g.glucose_type == GlucoseType::Cgm) {
                if newest.is_some_and(|n| value.timestamp <= n) {
                    trace!(timestamp = %value.timestamp, "Skipping non-monotonic glucose value");
                    continue;
                }
                newest = Some(value.timestamp);
                state.glucose_values.push(value.clone());
                appended = true;
            }
            if appended {
                state.missed_readings = 0;
                state.last_reading_at = newest;
                state.prune();
            }
        }
        Action::MissedReading { .. } => {
            state.missed_readings = state.missed_readings.saturating_add(1);
        }
        Action::FromSession { action, .. } => return reduce(state, action),
    }
    state
}

/// Side-effect hook run after every reduce.
///
/// Middleware reads the post-reduce state and may return a stream of
/// follow-up actions. It must not block: I/O happens inside the returned
/// stream or in tasks it owns.
pub trait Middleware: Send + Sync {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>>;
}

impl<F> Middleware for F
where
    F: Fn(&AppState, &Action) -> Option<BoxStream<'static, Action>> + Send + Sync,
{
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        self(state, action)
    }
}

/// Store under construction; call [`spawn`](Store::spawn) to start it.
pub struct Store {
    state: AppState,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.state)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl Store {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            state: AppState::new(config),
            middleware: Vec::new(),
        }
    }

    /// Start from an existing state.
    #[must_use]
    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = state;
        self
    }

    /// Append a middleware. Middleware run in registration order.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware.
    #[must_use]
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Start the consumer task. Must be called within a tokio runtime.
    pub fn spawn(self) -> StoreHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Arc::new(self.state.clone()));
        let cancel = CancellationToken::new();

        tokio::spawn(self.run(receiver, sender.clone(), state_tx, cancel.clone()));

        StoreHandle {
            sender,
            state: state_rx,
            cancel,
        }
    }

    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<Action>,
        sender: mpsc::UnboundedSender<Action>,
        state_tx: watch::Sender<Arc<AppState>>,
        cancel: CancellationToken,
    ) {
        let mut state = Arc::new(self.state);
        let mut pending = VecDeque::new();

        loop {
            let action = match pending.pop_front() {
                Some(action) => action,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(action) => action,
                        None => break,
                    },
                },
            };

            let Some(action) = admit(&state, action) else {
                continue;
            };

            trace!(action = action.name(), session = state.session, "Dispatch");
            state = Arc::new(reduce(state.as_ref().clone(), &action));
            state_tx.send_replace(state.clone());

            for middleware in &self.middleware {
                if let Some(stream) = middleware.handle(&state, &action) {
                    drain(stream, &mut pending, &sender);
                }
            }
        }
        debug!("Store stopped");
    }
}

/// Resolve session wrappers, dropping actions from stale sessions.
fn admit(state: &AppState, action: Action) -> Option<Action> {
    match action {
        Action::FromSession { session, action } if session != state.session => {
            debug!(
                action = action.name(),
                session,
                current = state.session,
                "Dropping action from stale session"
            );
            None
        }
        Action::FromSession { action, .. } => admit(state, *action),
        other => Some(other),
    }
}

/// Queue whatever the stream has ready now; forward the rest from a task.
fn drain(
    mut stream: BoxStream<'static, Action>,
    pending: &mut VecDeque<Action>,
    sender: &mpsc::UnboundedSender<Action>,
) {
    loop {
        match stream.next().now_or_never() {
            Some(Some(action)) => pending.push_back(action),
            Some(None) => return,
            None => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    while let Some(action) = stream.next().await {
                        if sender.send(action).is_err() {
                            warn!("Store closed; dropping follow-up actions");
                            break;
                        }
                    }
                });
                return;
            }
        }
    }
}

/// Cloneable handle to a running store.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    sender: mpsc::UnboundedSender<Action>,
    state: watch::Receiver<Arc<AppState>>,
    cancel: CancellationToken,
}

impl StoreHandle {
    /// Queue an action. Never blocks.
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.sender.send(action).map_err(|_| Error::Cancelled)
    }

    /// Latest committed state.
    pub fn state(&self) -> Arc<AppState> {
        self.state.borrow().clone()
    }

    /// Watch committed states.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.state.clone()
    }

    /// Wait until a committed state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&AppState) -> bool,
    ) -> Result<Arc<AppState>> {
        let mut receiver = self.state.clone();
        let state = receiver
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| Error::Cancelled)?;
        Ok(state.clone())
    }

    /// Stop the consumer task. Queued actions are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

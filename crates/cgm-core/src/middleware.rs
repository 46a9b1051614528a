//! Side effects of the pipeline.
//!
//! Each middleware observes the committed state and the action that produced
//! it. None of them block the dispatch queue: long-running work is spawned
//! and its results come back as a stream of follow-up actions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::mpsc::unbounded;
use futures::stream::{self, BoxStream, StreamExt};
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cgm_types::ConnectionState;

use crate::calibration::CalibrationEngine;
use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionConfig, SensorConnection};
use crate::decoder::TelemetryDecoder;
use crate::error::Error;
use crate::events::{CoreEvent, EventDispatcher};
use crate::persistence::{PersistedState, Persistence};
use crate::store::{Action, AppState, Middleware};
use crate::transport::FrameTransport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn once(action: Action) -> Option<BoxStream<'static, Action>> {
    Some(stream::iter([action]).boxed())
}

/// Runs pairing and streaming sessions.
///
/// One session is live at a time. A new command cancels the previous
/// session's token before its replacement starts.
pub struct SensorMiddleware {
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    decoder: TelemetryDecoder,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for SensorMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorMiddleware")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SensorMiddleware {
    pub fn new(transport: Arc<dyn FrameTransport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            decoder: TelemetryDecoder::default(),
            clock: Arc::new(SystemClock),
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: TelemetryDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cancel_current(&self) {
        if let Some(token) = lock(&self.current).take() {
            token.cancel();
        }
    }

    fn session(
        &self,
        state: &AppState,
    ) -> (SensorConnection, futures::channel::mpsc::UnboundedReceiver<Action>) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.current).replace(token.clone()) {
            previous.cancel();
        }
        let (tx, rx) = unbounded();
        let connection = SensorConnection::new(
            self.transport.clone(),
            self.config.clone(),
            state.session,
            tx,
            token,
        )
        .with_decoder(self.decoder.clone())
        .with_clock(self.clock.clone());
        (connection, rx)
    }
}

impl Drop for SensorMiddleware {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

impl Middleware for SensorMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        match action {
            Action::Pair => {
                if !state.is_pairable() {
                    debug!("Pair ignored: a sensor is already paired");
                    return None;
                }
                let (mut connection, rx) = self.session(state);
                tokio::spawn(async move {
                    if let Err(e) = connection.pair().await {
                        debug!(error = %e, "Pairing ended");
                    }
                });
                Some(rx.boxed())
            }
            Action::Connect => {
                let Some(sensor) = state.sensor.clone() else {
                    return once(Action::connection_error(&Error::NotPaired));
                };
                let unlock_count = state.unlock_count;
                let (mut connection, rx) = self.session(state);
                tokio::spawn(async move {
                    if let Err(e) = connection.connect(sensor, unlock_count).await {
                        debug!(error = %e, "Session ended");
                    }
                });
                Some(rx.boxed())
            }
            Action::Disconnect | Action::ResetSensor => {
                self.cancel_current();
                None
            }
            _ => None,
        }
    }
}

/// Turns raw readings into calibrated glucose values.
#[derive(Debug, Default)]
pub struct CalibrationMiddleware {
    engine: CalibrationEngine,
}

impl CalibrationMiddleware {
    pub fn new(engine: CalibrationEngine) -> Self {
        Self { engine }
    }
}

impl Middleware for CalibrationMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        let Action::AddSensorReadings(readings) = action else {
            return None;
        };
        let sensor = state.sensor.as_ref()?;

        // frames overlap; only samples newer than the history are new
        let newest = state.latest_glucose_timestamp();
        let fresh: Vec<_> = readings
            .iter()
            .filter(|r| newest.is_none_or(|n| r.timestamp > n))
            .copied()
            .collect();
        if fresh.is_empty() {
            trace!("No new samples in frame");
            return None;
        }

        let values = self
            .engine
            .calibrate_batch(&fresh, sensor, state.latest_sensor_glucose());
        once(Action::AddGlucose(values).in_session(state.session))
    }
}

struct Watchdog {
    cancel: CancellationToken,
    reading: Arc<Notify>,
}

/// Counts readings that failed to arrive while connected.
///
/// Armed when the connection reaches `Connected`; fires after twice the
/// expected interval without a new value and re-arms after every reading.
pub struct MissedReadingMiddleware {
    expected_interval: Duration,
    watchdog: Mutex<Option<Watchdog>>,
}

impl std::fmt::Debug for MissedReadingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissedReadingMiddleware")
            .field("expected_interval", &self.expected_interval)
            .finish_non_exhaustive()
    }
}

impl MissedReadingMiddleware {
    pub fn new(expected_interval: Duration) -> Self {
        Self {
            expected_interval,
            watchdog: Mutex::new(None),
        }
    }

    fn disarm(&self) {
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.cancel.cancel();
        }
    }

    fn arm(&self, state: &AppState) -> BoxStream<'static, Action> {
        let cancel = CancellationToken::new();
        let reading = Arc::new(Notify::new());
        if let Some(previous) = lock(&self.watchdog).replace(Watchdog {
            cancel: cancel.clone(),
            reading: reading.clone(),
        }) {
            previous.cancel.cancel();
        }

        let window = self.expected_interval * 2;
        let session = state.session;
        let (tx, rx) = unbounded();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = reading.notified() => continue,
                    _ = tokio::time::sleep(window) => {
                        debug!(window = ?window, "Reading missed");
                        let missed = Action::MissedReading { at: OffsetDateTime::now_utc() };
                        if tx.unbounded_send(missed.in_session(session)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx.boxed()
    }
}

impl Drop for MissedReadingMiddleware {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl Middleware for MissedReadingMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        match action {
            Action::SetConnectionState {
                state: ConnectionState::Connected,
                ..
            } => Some(self.arm(state)),
            Action::SetConnectionState {
                state: ConnectionState::Disconnected | ConnectionState::PoweredOff,
                ..
            }
            | Action::Disconnect
            | Action::ResetSensor
            | Action::Pair => {
                self.disarm();
                None
            }
            Action::AddGlucose(values) if values.iter().any(|g| g.is_valid()) => {
                if let Some(watchdog) = lock(&self.watchdog).as_ref() {
                    watchdog.reading.notify_one();
                }
                None
            }
            _ => None,
        }
    }
}

/// Publishes [`CoreEvent`]s for committed changes.
#[derive(Debug)]
pub struct EventMiddleware {
    dispatcher: EventDispatcher,
    last_state: Mutex<Option<ConnectionState>>,
}

impl EventMiddleware {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            dispatcher,
            last_state: Mutex::new(None),
        }
    }

    fn event_for(&self, state: &AppState, action: &Action) -> Option<CoreEvent> {
        match action {
            Action::SetSensor(_) => state.sensor.clone().map(|sensor| CoreEvent::SensorPaired {
                sensor: Box::new(sensor),
            }),
            Action::SetConnectionState { .. } | Action::Disconnect | Action::ResetSensor => {
                let mut last = lock(&self.last_state);
                if *last == Some(state.connection_state) {
                    return None;
                }
                *last = Some(state.connection_state);
                Some(CoreEvent::ConnectionStateChanged {
                    state: state.connection_state,
                })
            }
            Action::SetSensorAge { age, state: lifecycle } => Some(CoreEvent::SensorAgeChanged {
                age: *age,
                state: *lifecycle,
            }),
            Action::AddGlucose(values) => {
                let tail = state
                    .glucose_values
                    .len()
                    .saturating_sub(values.len());
                let committed: HashSet<_> =
                    state.glucose_values[tail..].iter().map(|g| g.id).collect();
                let added: Vec<_> = values
                    .iter()
                    .filter(|g| committed.contains(&g.id))
                    .cloned()
                    .collect();
                (!added.is_empty()).then_some(CoreEvent::GlucoseAdded { values: added })
            }
            Action::MissedReading { .. } => Some(CoreEvent::MissedReading {
                count: state.missed_readings,
            }),
            Action::SetConnectionError {
                message,
                at,
                is_critical,
            } => Some(CoreEvent::ConnectionError {
                message: message.clone(),
                at: *at,
                is_critical: *is_critical,
            }),
            _ => None,
        }
    }
}

impl Middleware for EventMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        if let Some(event) = self.event_for(state, action) {
            trace!(kind = event.kind(), "Event");
            self.dispatcher.send(event);
        }
        None
    }
}

/// Writes the persisted subset after each committed change to it.
///
/// Saves run on a dedicated task in commit order; when writes fall behind
/// only the newest pending snapshot is written. The snapshot taken after a
/// sensor reset is always written, so a backend never merges the old
/// sensor's counter into a re-pairing.
pub struct PersistenceMiddleware {
    writer: mpsc::UnboundedSender<Snapshot>,
    last: Mutex<Option<PersistedState>>,
}

impl std::fmt::Debug for PersistenceMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMiddleware").finish_non_exhaustive()
    }
}

struct Snapshot {
    state: PersistedState,
    reset: bool,
}

impl PersistenceMiddleware {
    /// Must be called within a tokio runtime.
    pub fn new(backend: Arc<dyn Persistence>) -> Self {
        let (writer, mut rx) = mpsc::unbounded_channel::<Snapshot>();
        tokio::spawn(async move {
            while let Some(mut snapshot) = rx.recv().await {
                while !snapshot.reset {
                    match rx.try_recv() {
                        Ok(newer) => snapshot = newer,
                        Err(_) => break,
                    }
                }
                if let Err(e) = backend.save(&snapshot.state).await {
                    warn!("Failed to persist state: {}", e);
                }
            }
            debug!("Persistence writer stopped");
        });
        Self {
            writer,
            last: Mutex::new(None),
        }
    }

    /// Record `state` as already persisted.
    #[must_use]
    pub fn with_baseline(self, state: PersistedState) -> Self {
        *lock(&self.last) = Some(state);
        self
    }
}

impl Middleware for PersistenceMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        let relevant = matches!(
            action,
            Action::SetSensor(_)
                | Action::SetSensorAge { .. }
                | Action::SetUnlockCount(_)
                | Action::AddGlucose(_)
                | Action::AddBloodGlucose { .. }
                | Action::AddCustomCalibration { .. }
                | Action::RemoveCustomCalibration { .. }
                | Action::ResetSensor
                | Action::Restore(_)
        );
        if !relevant {
            return None;
        }

        let snapshot = state.persisted();
        let mut last = lock(&self.last);
        if last.as_ref() == Some(&snapshot) {
            return None;
        }
        *last = Some(snapshot.clone());
        drop(last);

        if matches!(action, Action::Restore(_)) {
            return None;
        }
        let snapshot = Snapshot {
            state: snapshot,
            reset: matches!(action, Action::ResetSensor),
        };
        if self.writer.send(snapshot).is_err() {
            warn!("Persistence writer closed");
        }
        None
    }
}

/// Logs every committed action.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMiddleware;

impl Middleware for LogMiddleware {
    fn handle(&self, state: &AppState, action: &Action) -> Option<BoxStream<'static, Action>> {
        match action {
            Action::SetConnectionState { state: connection, .. } => {
                info!(state = %connection, session = state.session, "Connection state");
            }
            Action::SetSensor(sensor) => {
                info!(serial = %sensor.serial, age = sensor.age, "Sensor set");
            }
            Action::AddGlucose(values) => {
                if let Some(latest) = state.latest_sensor_glucose() {
                    debug!(
                        count = values.len(),
                        glucose = latest.glucose_value,
                        trend = %latest.trend,
                        "Glucose"
                    );
                }
            }
            Action::MissedReading { .. } => {
                debug!(missed = state.missed_readings, "Missed reading");
            }
            other => trace!(action = other.name(), session = state.session, "Committed"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::store::{Store, StoreConfig, reduce};
    use cgm_types::{FactoryCalibration, RawReading, SampleQuality, Sensor, SensorState};
    use time::macros::datetime;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
    const PATCH: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    fn t(minute: i64) -> OffsetDateTime {
        datetime!(2024-03-01 12:00 UTC) + time::Duration::minutes(minute)
    }

    fn paired() -> AppState {
        let factory = FactoryCalibration {
            i4: 1000,
            ..FactoryCalibration::identity()
        };
        let sensor = Sensor::new(&UID, &PATCH, factory, 1440, t(0)).unwrap();
        reduce(AppState::default(), &Action::SetSensor(Box::new(sensor)))
    }

    fn collect(stream: Option<BoxStream<'static, Action>>) -> Vec<Action> {
        use futures::FutureExt;
        stream
            .map(|s| s.collect::<Vec<_>>().now_or_never().unwrap_or_default())
            .unwrap_or_default()
    }

    #[test]
    fn test_calibration_skips_known_minutes() {
        let middleware = CalibrationMiddleware::default();
        let readings = vec![
            RawReading::valid(t(1), 1000.0, None),
            RawReading::valid(t(2), 1050.0, None),
        ];
        let state = paired();
        let out = collect(middleware.handle(&state, &Action::AddSensorReadings(readings.clone())));
        let [Action::FromSession { action, .. }] = out.as_slice() else {
            panic!("expected one action, got {:?}", out);
        };
        let Action::AddGlucose(values) = action.as_ref() else {
            panic!("expected glucose");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].glucose_value, Some(100));
        assert_eq!(values[1].glucose_value, Some(105));

        let state = reduce(state, action);
        let out = collect(middleware.handle(&state, &Action::AddSensorReadings(readings)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_calibration_passes_faults_through() {
        let middleware = CalibrationMiddleware::default();
        let out = collect(middleware.handle(
            &paired(),
            &Action::AddSensorReadings(vec![RawReading::faulted(t(1), SampleQuality::SignalLoss)]),
        ));
        let Some(Action::FromSession { action, .. }) = out.first() else {
            panic!("expected action");
        };
        let Action::AddGlucose(values) = action.as_ref() else {
            panic!("expected glucose");
        };
        assert_eq!(values[0].glucose_value, None);
        assert_eq!(values[0].quality, SampleQuality::SignalLoss);
    }

    #[test]
    fn test_calibration_without_sensor() {
        let middleware = CalibrationMiddleware::default();
        let out = middleware.handle(
            &AppState::default(),
            &Action::AddSensorReadings(vec![RawReading::valid(t(1), 1000.0, None)]),
        );
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_connect_without_sensor_reports_not_paired() {
        let transport = Arc::new(crate::mock::MockTransport::with_default_name());
        let middleware = SensorMiddleware::new(transport, ConnectionConfig::default());
        let out = collect(middleware.handle(&AppState::default(), &Action::Connect));
        assert!(matches!(
            out.as_slice(),
            [Action::SetConnectionError {
                is_critical: true,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_events_only_for_committed_glucose() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();
        let middleware = EventMiddleware::new(dispatcher);

        let g1 = cgm_types::CalibratedGlucose::sensor(t(1), 100, 1000.0, None, cgm_types::Trend::Unknown);
        let g0 = cgm_types::CalibratedGlucose::sensor(t(0), 90, 900.0, None, cgm_types::Trend::Unknown);
        let action = Action::AddGlucose(vec![g1.clone(), g0]);
        let state = reduce(paired(), &action);
        middleware.handle(&state, &action);

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::GlucoseAdded { values: vec![g1] }
        );
    }

    #[tokio::test]
    async fn test_connection_events_deduplicated() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();
        let middleware = EventMiddleware::new(dispatcher);

        let action = Action::SetConnectionState {
            state: ConnectionState::Connecting,
            at: t(0),
        };
        let state = reduce(paired(), &action);
        middleware.handle(&state, &action);
        middleware.handle(&state, &action);
        let action = Action::SetSensorAge {
            age: 1441,
            state: SensorState::Ready,
        };
        middleware.handle(&reduce(state, &action), &action);

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::ConnectionStateChanged {
                state: ConnectionState::Connecting
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::SensorAgeChanged {
                age: 1441,
                state: SensorState::Ready
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_reading_fires_and_resets() {
        let handle = Store::new(&StoreConfig::default())
            .with_state(paired())
            .middleware(MissedReadingMiddleware::new(Duration::from_secs(60)))
            .spawn();

        handle
            .dispatch(Action::connection_state(ConnectionState::Connected))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;
        let state = handle.wait_for(|s| s.missed_readings == 1).await.unwrap();
        assert_eq!(state.missed_readings, 1);

        handle
            .dispatch(Action::AddGlucose(vec![cgm_types::CalibratedGlucose::sensor(
                t(5),
                100,
                1000.0,
                None,
                cgm_types::Trend::Unknown,
            )]))
            .unwrap();
        let state = handle.wait_for(|s| s.missed_readings == 0).await.unwrap();
        assert_eq!(state.glucose_values.len(), 1);

        handle
            .dispatch(Action::connection_state(ConnectionState::Disconnected))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(handle.state().missed_readings, 0);
    }

    #[tokio::test]
    async fn test_persistence_writes_changes_only() {
        let backend = Arc::new(MemoryPersistence::new());
        let middleware = PersistenceMiddleware::new(backend.clone());

        let state = paired();
        let action = Action::SetUnlockCount(3);
        let state = reduce(state, &action);
        middleware.handle(&state, &action);
        middleware.handle(&state, &action);
        middleware.handle(&state, &Action::MissedReading { at: t(0) });

        for _ in 0..100 {
            if backend.save_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.save_count(), 1);
        assert_eq!(backend.snapshot().await.unwrap().unlock_count, 3);
    }

    #[derive(Default)]
    struct RecordingPersistence {
        saved: tokio::sync::Mutex<Vec<PersistedState>>,
    }

    #[async_trait::async_trait]
    impl Persistence for RecordingPersistence {
        async fn load(&self) -> crate::error::Result<Option<PersistedState>> {
            Ok(self.saved.lock().await.last().cloned())
        }

        async fn save(&self, state: &PersistedState) -> crate::error::Result<()> {
            self.saved.lock().await.push(state.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_keeps_reset_snapshot() {
        let backend = Arc::new(RecordingPersistence::default());
        let middleware = PersistenceMiddleware::new(backend.clone());

        // All four commit before the writer task runs.
        let mut state = paired();
        for action in [
            Action::SetUnlockCount(7),
            Action::ResetSensor,
            Action::SetSensor(Box::new(paired().sensor.unwrap())),
            Action::SetUnlockCount(1),
        ] {
            state = reduce(state, &action);
            middleware.handle(&state, &action);
        }

        for _ in 0..100 {
            if backend.saved.lock().await.len() >= 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let saved = backend.saved.lock().await;
        assert_eq!(saved.len(), 2);
        assert!(saved[0].sensor.is_none());
        assert_eq!(saved[0].unlock_count, 0);
        assert!(saved[1].sensor.is_some());
        assert_eq!(saved[1].unlock_count, 1);
    }
}

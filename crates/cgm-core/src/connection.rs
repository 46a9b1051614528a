//! Connection state machine for one sensor session.
//!
//! A [`SensorConnection`] drives a [`FrameTransport`] through pairing and
//! streaming. It never touches application state: every observation becomes
//! an [`Action`] tagged with the session it belongs to and is sent to the
//! store through an unbounded channel.
//!
//! ```text
//!            ┌─────────┐
//!            │ Pairing │ (no sensor paired)
//!            └────┬────┘
//!                 ▼
//! Disconnected ─► Scanning ─► Connecting ─► Connected ─► Disconnected
//!       ▲                         │             │
//!       └──────── PoweredOff ◄────┴─────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::UnboundedSender;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use cgm_types::uuids::{
    ADVERTISED_NAME_PREFIX, DATA_CHARACTERISTIC, FRAM_CHARACTERISTIC, PAIRING_CHARACTERISTICS,
    PATCH_INFO_CHARACTERISTIC, REQUIRED_CHARACTERISTICS, SENSOR_SERVICE, UID_CHARACTERISTIC,
    UNLOCK_CHARACTERISTIC,
};
use cgm_types::{ConnectionState, Sensor, SensorState};

use crate::clock::{Clock, SystemClock};
use crate::decoder::TelemetryDecoder;
use crate::error::{Error, Result};
use crate::reassembler::{FRAME_SIZE, FrameReassembler, ReassemblyResult};
use crate::store::{Action, SessionId};
use crate::transport::{FrameTransport, TransportEvent};
use crate::unlock::{UnlockCodec, UnlockCounter};

/// Where actions produced by a session go.
pub type ActionSink = UnboundedSender<Action>;

/// Phase of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    /// Pairing sub-flow; entered only without a paired sensor.
    Pairing,
    Scanning,
    Connecting,
    /// Link up, unlocked and streaming.
    Connected,
    PoweredOff,
}

impl Phase {
    /// State published to the store for this phase, if any.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            Phase::Disconnected => Some(ConnectionState::Disconnected),
            Phase::Pairing => None,
            Phase::Scanning => Some(ConnectionState::Scanning),
            Phase::Connecting => Some(ConnectionState::Connecting),
            Phase::Connected => Some(ConnectionState::Connected),
            Phase::PoweredOff => Some(ConnectionState::PoweredOff),
        }
    }
}

/// The closed transition table.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    matches!(
        (from, to),
        (Disconnected, Pairing | Scanning | Connecting | PoweredOff)
            | (Pairing, Scanning | Disconnected)
            | (Scanning, Connecting | Disconnected | PoweredOff)
            | (Connecting, Connected | Disconnected | PoweredOff)
            | (Connected, Disconnected | PoweredOff)
            | (PoweredOff, Disconnected | Scanning | Connecting)
    )
}

/// Options for sensor sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Interval at which the sensor sends a frame.
    pub expected_interval: Duration,
    /// How long a pairing scan runs.
    pub scan_timeout: Duration,
    /// Timeout for the link to come up.
    pub connect_timeout: Duration,
    /// Timeout for one read, write or discovery operation.
    pub operation_timeout: Duration,
    /// Size of one telemetry frame.
    pub frame_size: usize,
    /// Advertised name prefix matched while pairing.
    pub name_prefix: String,
    /// Reconnect attempts after a link fails to come up (0 = none).
    pub link_retries: u32,
    /// Pause before each reconnect attempt.
    pub retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            expected_interval: Duration::from_secs(60),
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            frame_size: FRAME_SIZE,
            name_prefix: ADVERTISED_NAME_PREFIX.to_string(),
            link_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.expected_interval.is_zero() {
            return Err(Error::invalid_config("expected_interval must be > 0"));
        }
        if self.scan_timeout.is_zero()
            || self.connect_timeout.is_zero()
            || self.operation_timeout.is_zero()
        {
            return Err(Error::invalid_config("timeouts must be > 0"));
        }
        if self.frame_size == 0 {
            return Err(Error::invalid_config("frame_size must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn expected_interval(mut self, interval: Duration) -> Self {
        self.expected_interval = interval;
        self
    }

    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn link_retries(mut self, retries: u32) -> Self {
        self.link_retries = retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Whether a session keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One pairing or streaming session against a transport.
pub struct SensorConnection {
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    decoder: TelemetryDecoder,
    clock: Arc<dyn Clock>,
    codec: UnlockCodec,
    session: SessionId,
    sink: ActionSink,
    cancel: CancellationToken,
    phase: Phase,
    reassembler: FrameReassembler,
    counter: UnlockCounter,
    sensor: Option<Sensor>,
    address: Option<String>,
}

impl std::fmt::Debug for SensorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorConnection")
            .field("session", &self.session)
            .field("phase", &self.phase)
            .field("address", &self.address)
            .field("counter", &self.counter)
            .finish()
    }
}

impl SensorConnection {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        config: ConnectionConfig,
        session: SessionId,
        sink: ActionSink,
        cancel: CancellationToken,
    ) -> Self {
        let reassembler = FrameReassembler::new(config.frame_size);
        Self {
            transport,
            config,
            decoder: TelemetryDecoder::default(),
            clock: Arc::new(SystemClock),
            codec: UnlockCodec,
            session,
            sink,
            cancel,
            phase: Phase::Disconnected,
            reassembler,
            counter: UnlockCounter::default(),
            sensor: None,
            address: None,
        }
    }

    /// Use a different telemetry decoder.
    #[must_use]
    pub fn with_decoder(mut self, decoder: TelemetryDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Timestamp frames with `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Last unlock counter value used by this session.
    pub fn unlock_count(&self) -> u32 {
        self.counter.current()
    }

    /// Discover, handshake with and identify a new sensor.
    ///
    /// On success the store receives the sensor, the unlock count used, and
    /// a `Connect` command for the streaming session. On failure the session
    /// ends `Disconnected` with a critical error and no sensor; pairing is
    /// not retried.
    #[tracing::instrument(level = "info", skip_all, fields(session = self.session))]
    pub async fn pair(&mut self) -> Result<Sensor> {
        match self.try_pair().await {
            Ok(sensor) => {
                info!(serial = %sensor.serial, sensor_type = %sensor.sensor_type, "Sensor paired");
                self.emit(Action::SetSensor(Box::new(sensor.clone())));
                self.emit(Action::SetUnlockCount(self.counter.current()));
                self.teardown().await;
                self.emit(Action::Connect);
                Ok(sensor)
            }
            Err(Error::Cancelled) => {
                self.teardown().await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.surface(&e, true);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn try_pair(&mut self) -> Result<Sensor> {
        self.transition(Phase::Pairing);
        self.transition(Phase::Scanning);

        let prefix = self.config.name_prefix.clone();
        let found = self
            .guarded(
                "scan",
                self.config.scan_timeout + self.config.operation_timeout,
                self.transport.scan(&prefix, self.config.scan_timeout),
            )
            .await?;
        let Some(found) = found.into_iter().next() else {
            return Err(Error::transport(format!(
                "no sensor advertising '{}' found",
                prefix
            )));
        };
        debug!(address = %found.address, name = ?found.name, rssi = ?found.rssi, "Found sensor");

        self.transition(Phase::Connecting);
        let mut events = self
            .guarded(
                "connect",
                self.config.connect_timeout,
                self.transport.connect(&found.address),
            )
            .await?;
        self.address = Some(found.address.clone());
        self.await_link(&mut events).await?;

        self.verify_services(&found.address, &PAIRING_CHARACTERISTICS)
            .await?;

        let uid = self.read(&found.address, UID_CHARACTERISTIC).await?;
        let patch_info = self.read(&found.address, PATCH_INFO_CHARACTERISTIC).await?;
        let fram = self.read(&found.address, FRAM_CHARACTERISTIC).await?;

        let sensor = Sensor::from_fram(&uid, &patch_info, &fram, self.clock.now())
            .map_err(|e| Error::Auth(format!("invalid sensor identity: {}", e)))?
            .with_address(found.address.clone());

        self.counter.reset();
        let count = self.counter.next();
        let payload = self
            .codec
            .unlock_payload(&sensor.uuid, &sensor.patch_info, count)?;
        self.write(&found.address, UNLOCK_CHARACTERISTIC, &payload)
            .await?;
        self.subscribe(&found.address).await?;

        Ok(sensor)
    }

    /// Stream from a paired sensor until the link drops or the session is
    /// cancelled.
    ///
    /// `unlock_count` is the last counter value used with this sensor; the
    /// next unlock uses the value after it. A link that fails to come up
    /// (connect, discovery, unlock write or subscribe) is torn down and
    /// retried up to [`ConnectionConfig::link_retries`] times, each attempt
    /// with a fresh counter value. A missing service or characteristic ends
    /// the session at once.
    #[tracing::instrument(level = "info", skip_all, fields(session = self.session, serial = %sensor.serial))]
    pub async fn connect(&mut self, sensor: Sensor, unlock_count: u32) -> Result<()> {
        let address = sensor.transport_address().to_string();
        self.sensor = Some(sensor);
        self.counter = UnlockCounter::new(unlock_count);

        let mut failures = 0;
        loop {
            match self.stream(&address).await {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => {
                    debug!("Session cancelled");
                    self.disconnect().await;
                    return Ok(());
                }
                Err(e) if e.is_link_failure() && failures < self.config.link_retries => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "Link setup failed, reconnecting");
                    self.surface(&e, false);
                    self.teardown().await;
                    if self.pause(self.config.retry_delay).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.surface(&e, true);
                    self.teardown().await;
                    return Err(e);
                }
            }
        }
    }

    /// One link: connect, then handle transport events until the link ends.
    async fn stream(&mut self, address: &str) -> Result<()> {
        self.reassembler.reset();
        self.transition(Phase::Connecting);
        let mut events = self
            .guarded(
                "connect",
                self.config.connect_timeout,
                self.transport.connect(address),
            )
            .await?;
        self.address = Some(address.to_string());

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => event.unwrap_or(TransportEvent::Disconnected {
                    reason: "event channel closed".to_string(),
                }),
            };

            if self.handle_transport_event(event).await? == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// Tear down the link and reset reassembly.
    #[tracing::instrument(level = "info", skip_all, fields(session = self.session))]
    pub async fn disconnect(&mut self) {
        self.teardown().await;
    }

    /// Advance the state machine by one transport event.
    ///
    /// Returns an error when the link cannot be brought up (discovery,
    /// unlock write or subscribe failed) or the sensor lacks the expected
    /// service or characteristic. Faults on a streaming link are surfaced as
    /// non-critical errors and the session continues.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<Flow> {
        match event {
            TransportEvent::Connected => {
                if self.phase == Phase::Connected {
                    trace!("Duplicate connect event");
                    return Ok(Flow::Continue);
                }
                self.on_link_up().await?;
                Ok(Flow::Continue)
            }
            TransportEvent::Data(chunk) => {
                self.on_chunk(chunk);
                Ok(Flow::Continue)
            }
            TransportEvent::Error { message } => {
                self.surface(&Error::transport(message), false);
                Ok(Flow::Continue)
            }
            TransportEvent::Disconnected { reason } => {
                self.surface(&Error::transport(reason), true);
                self.transition(Phase::Disconnected);
                self.reassembler.reset();
                self.address = None;
                Ok(Flow::Stop)
            }
            TransportEvent::PoweredOff => {
                warn!("Adapter powered off");
                self.transition(Phase::PoweredOff);
                self.reassembler.reset();
                self.address = None;
                Ok(Flow::Stop)
            }
        }
    }

    async fn on_link_up(&mut self) -> Result<()> {
        let Some(address) = self.address.clone() else {
            return Err(Error::NotConnected);
        };
        let Some(sensor) = self.sensor.as_ref() else {
            return Err(Error::NotPaired);
        };
        let (uid, patch_info) = (sensor.uuid, sensor.patch_info);

        self.verify_services(&address, &[]).await?;

        let count = self.counter.next();
        // persisted before use so a crash never replays a counter
        self.emit(Action::SetUnlockCount(count));
        let payload = self.codec.unlock_payload(&uid, &patch_info, count)?;

        self.write(&address, UNLOCK_CHARACTERISTIC, &payload).await?;
        self.subscribe(&address).await?;

        self.transition(Phase::Connected);
        info!(unlock_count = count, "Streaming");
        Ok(())
    }

    fn on_chunk(&mut self, chunk: Bytes) {
        if self.phase != Phase::Connected {
            trace!(len = chunk.len(), "Dropping chunk before unlock");
            return;
        }
        match self.reassembler.append(&chunk) {
            ReassemblyResult::Incomplete => {}
            ReassemblyResult::Overflow => {
                self.reassembler.reset();
                self.surface(
                    &Error::InvalidData("frame buffer overflow".to_string()),
                    false,
                );
            }
            ReassemblyResult::Complete(frame) => {
                self.reassembler.reset();
                self.on_frame(&frame);
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8]) {
        let Some(sensor) = self.sensor.as_mut() else {
            return;
        };
        let decoded = match self
            .decoder
            .decode(&sensor.uuid, frame, self.clock.now())
        {
            Ok(decoded) => decoded,
            Err(e) => {
                self.surface(&e, false);
                return;
            }
        };

        let state = match sensor.state {
            SensorState::NotYetStarted | SensorState::Shutdown | SensorState::Failure => {
                sensor.state
            }
            _ => TelemetryDecoder::derive_state(sensor, decoded.age),
        };
        sensor.age = decoded.age;
        sensor.state = state;
        trace!(age = decoded.age, %state, "Frame decoded");

        self.emit(Action::SetSensorAge {
            age: decoded.age,
            state,
        });
        if state.produces_readings() {
            self.emit(Action::AddSensorReadings(decoded.readings()));
        }
    }

    async fn await_link(&mut self, events: &mut mpsc::Receiver<TransportEvent>) -> Result<()> {
        let timeout = self.config.connect_timeout;
        let wait = async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Connected) => return Ok(()),
                    Some(TransportEvent::Disconnected { reason }) => {
                        return Err(Error::transport(reason));
                    }
                    Some(TransportEvent::PoweredOff) => {
                        return Err(Error::transport("adapter powered off"));
                    }
                    Some(other) => trace!(?other, "Ignoring event before link is up"),
                    None => return Err(Error::transport("event channel closed")),
                }
            }
        };
        self.guarded("await link", timeout, wait).await
    }

    /// Check the sensor service and the required characteristics.
    async fn verify_services(&self, address: &str, extra: &[uuid::Uuid]) -> Result<()> {
        let services = self
            .guarded(
                "discover services",
                self.config.operation_timeout,
                self.transport.discover_services(address),
            )
            .await?;
        if !services.contains(&SENSOR_SERVICE) {
            return Err(Error::service_not_found(SENSOR_SERVICE));
        }

        let characteristics = self
            .guarded(
                "discover characteristics",
                self.config.operation_timeout,
                self.transport
                    .discover_characteristics(address, SENSOR_SERVICE),
            )
            .await?;
        for uuid in REQUIRED_CHARACTERISTICS.iter().chain(extra) {
            if !characteristics.contains(uuid) {
                return Err(Error::characteristic_not_found(
                    uuid,
                    characteristics.len(),
                ));
            }
        }
        Ok(())
    }

    async fn read(&self, address: &str, characteristic: uuid::Uuid) -> Result<Bytes> {
        self.guarded(
            "read",
            self.config.operation_timeout,
            self.transport.read(address, characteristic),
        )
        .await
    }

    async fn write(&self, address: &str, characteristic: uuid::Uuid, data: &[u8]) -> Result<()> {
        self.guarded(
            "write",
            self.config.operation_timeout,
            self.transport.write(address, characteristic, data),
        )
        .await
    }

    async fn subscribe(&self, address: &str) -> Result<()> {
        self.guarded(
            "subscribe",
            self.config.operation_timeout,
            self.transport.subscribe(address, DATA_CHARACTERISTIC),
        )
        .await
    }

    /// Run a transport operation under the session's cancel token and a
    /// timeout.
    async fn guarded<T>(
        &self,
        operation: &str,
        timeout: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(operation, timeout)),
            },
        }
    }

    /// Sleep for `delay` unless the session is cancelled first.
    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn teardown(&mut self) {
        self.reassembler.reset();
        if let Some(address) = self.address.take()
            && let Err(e) = self.transport.disconnect(&address).await
        {
            debug!(error = %e, "Transport disconnect failed");
        }
        self.transition(Phase::Disconnected);
    }

    fn transition(&mut self, to: Phase) -> bool {
        if self.phase == to {
            return true;
        }
        if !can_transition(self.phase, to) {
            warn!(from = ?self.phase, to = ?to, "Rejected connection transition");
            return false;
        }
        debug!(from = ?self.phase, to = ?to, "Connection transition");
        self.phase = to;
        if let Some(state) = to.connection_state() {
            self.emit(Action::connection_state(state));
        }
        true
    }

    fn surface(&self, error: &Error, is_critical: bool) {
        let at = OffsetDateTime::now_utc();
        if is_critical {
            error!(%at, "Connection error: {}", error);
        } else {
            warn!(%at, "Connection error: {}", error);
        }
        self.emit(Action::SetConnectionError {
            message: error.to_string(),
            at,
            is_critical,
        });
    }

    fn emit(&self, action: Action) {
        if self.sink.unbounded_send(action.in_session(self.session)).is_err() {
            trace!("Action sink closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOperation, MockTransport};
    use crate::virtual_sensor::VirtualSensor;
    use futures::channel::mpsc::{UnboundedReceiver, unbounded};

    fn drain(rx: &mut UnboundedReceiver<Action>) -> Vec<Action> {
        let mut out = Vec::new();
        while let Ok(Some(action)) = rx.try_next() {
            match action {
                Action::FromSession { action, .. } => out.push(*action),
                other => out.push(other),
            }
        }
        out
    }

    fn states(actions: &[Action]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SetConnectionState { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn setup() -> (Arc<MockTransport>, VirtualSensor) {
        let transport = Arc::new(MockTransport::with_default_name());
        let sensor = VirtualSensor::new(42).with_age(1440);
        sensor.install(&transport).await;
        (transport, sensor)
    }

    fn connection(
        transport: Arc<MockTransport>,
    ) -> (SensorConnection, UnboundedReceiver<Action>, CancellationToken) {
        connection_with(transport, ConnectionConfig::default())
    }

    fn connection_with(
        transport: Arc<MockTransport>,
        config: ConnectionConfig,
    ) -> (SensorConnection, UnboundedReceiver<Action>, CancellationToken) {
        let (tx, rx) = unbounded();
        let cancel = CancellationToken::new();
        let conn = SensorConnection::new(transport, config, 1, tx, cancel.clone());
        (conn, rx, cancel)
    }

    fn connection_errors(actions: &[Action]) -> Vec<bool> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SetConnectionError { is_critical, .. } => Some(*is_critical),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transition_table() {
        use Phase::*;
        assert!(can_transition(Disconnected, Pairing));
        assert!(can_transition(Connecting, Connected));
        assert!(can_transition(Connected, Disconnected));
        assert!(!can_transition(Connected, Pairing));
        assert!(!can_transition(Scanning, Connected));
        assert!(!can_transition(Disconnected, Connected));
        assert!(!can_transition(Pairing, Connected));
    }

    #[test]
    fn test_config_validation() {
        assert!(ConnectionConfig::default().validate().is_ok());
        assert!(ConnectionConfig::new().frame_size(0).validate().is_err());
        assert!(
            ConnectionConfig::new()
                .expected_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_pair_reads_identity_and_unlocks_with_one() {
        let (transport, virt) = setup().await;
        let (mut conn, mut rx, _) = connection(transport.clone());

        let sensor = conn.pair().await.unwrap();
        assert_eq!(&sensor.uuid, virt.uid());
        assert_eq!(sensor.age, 1440);
        assert_eq!(sensor.address.as_deref(), Some(transport.address()));
        assert_eq!(transport.unlock_counters(), vec![1]);
        assert!(!transport.is_connected());
        assert_eq!(conn.phase(), Phase::Disconnected);

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions),
            vec![
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Disconnected
            ]
        );
        assert!(actions.contains(&Action::SetUnlockCount(1)));
        assert_eq!(actions.last(), Some(&Action::Connect));
    }

    #[tokio::test]
    async fn test_pair_without_advertiser_fails() {
        let transport = Arc::new(MockTransport::new("OTHER-1"));
        let (mut conn, mut rx, _) = connection(transport);
        let err = conn.pair().await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));

        let actions = drain(&mut rx);
        assert!(!actions.iter().any(|a| matches!(a, Action::SetSensor(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetConnectionError {
                is_critical: true,
                ..
            }
        )));
        assert_eq!(conn.phase(), Phase::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_fatal() {
        let (transport, _) = setup().await;
        transport
            .set_characteristics(vec![DATA_CHARACTERISTIC])
            .await;
        let (mut conn, _rx, _) = connection(transport.clone());
        let err = conn.pair().await.unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_streaming_session() {
        let (transport, virt) = setup().await;
        let (mut conn, mut rx, cancel) = connection(transport.clone());
        let sensor = conn.pair().await.unwrap();
        drain(&mut rx);

        let t = transport.clone();
        let handle = tokio::spawn(async move {
            let result = conn.connect(sensor, 1).await;
            (conn, result)
        });

        while !transport.is_subscribed() {
            tokio::task::yield_now().await;
        }
        for chunk in virt.chunks(1441).unwrap() {
            t.push_chunk(chunk);
        }
        t.drop_connection("out of range");

        let (conn, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert!(!cancel.is_cancelled());
        assert_eq!(conn.unlock_count(), 2);
        assert_eq!(transport.unlock_counters(), vec![1, 2]);

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert!(actions.contains(&Action::SetSensorAge {
            age: 1441,
            state: SensorState::Ready
        }));
        let readings = actions
            .iter()
            .find_map(|a| match a {
                Action::AddSensorReadings(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert!(readings.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_decrypt_error_keeps_session() {
        let (transport, virt) = setup().await;
        let sensor = cgm_types::Sensor::from_fram(
            virt.uid(),
            virt.patch_info(),
            &virt.fram(),
            OffsetDateTime::now_utc(),
        )
        .unwrap()
        .with_address(transport.address());
        let (mut conn, mut rx, _) = connection(transport.clone());
        conn.address = Some(transport.address().to_string());
        conn.sensor = Some(sensor);
        transport
            .connect(transport.address())
            .await
            .unwrap();

        conn.phase = Phase::Connecting;
        conn.handle_transport_event(TransportEvent::Connected)
            .await
            .unwrap();
        assert_eq!(conn.phase(), Phase::Connected);

        let mut bad = virt.frame(1441).unwrap();
        bad[10] ^= 0xFF;
        let flow = conn
            .handle_transport_event(TransportEvent::Data(Bytes::from(bad)))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(conn.phase(), Phase::Connected);

        let good = virt.frame(1442).unwrap();
        conn.handle_transport_event(TransportEvent::Data(Bytes::from(good)))
            .await
            .unwrap();

        let actions = drain(&mut rx);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetConnectionError {
                is_critical: false,
                ..
            }
        )));
        assert!(actions.contains(&Action::SetSensorAge {
            age: 1442,
            state: SensorState::Ready
        }));
        assert_eq!(
            states(&actions),
            vec![ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_cancel_tears_down() {
        let (transport, _) = setup().await;
        let (mut conn, mut rx, cancel) = connection(transport.clone());
        let sensor = conn.pair().await.unwrap();
        drain(&mut rx);

        let handle = tokio::spawn(async move { conn.connect(sensor, 1).await });
        while !transport.is_subscribed() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!transport.is_connected());

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions).last(),
            Some(&ConnectionState::Disconnected)
        );
        assert!(!actions.iter().any(|a| matches!(a, Action::SetConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_unlock_write_failure_ends_session() {
        let (transport, _) = setup().await;
        let config = ConnectionConfig::new()
            .link_retries(2)
            .retry_delay(Duration::from_millis(1));
        let (mut conn, mut rx, _) = connection_with(transport.clone(), config);
        let sensor = conn.pair().await.unwrap();
        drain(&mut rx);
        let connects = transport.connect_count();

        transport.fail_next(MockOperation::Write, u32::MAX);
        let err = conn.connect(sensor, 1).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(transport.connect_count(), connects + 3);
        assert!(!transport.is_connected());
        assert!(!transport.is_subscribed());
        assert_eq!(transport.unlock_counters(), vec![1]);
        assert_eq!(conn.phase(), Phase::Disconnected);

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(connection_errors(&actions), vec![false, false, true]);
        let counters: Vec<u32> = actions
            .iter()
            .filter_map(|a| match a {
                Action::SetUnlockCount(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(counters, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_discovery_reconnects() {
        let (transport, _) = setup().await;
        let config = ConnectionConfig::new().retry_delay(Duration::from_millis(1));
        let (mut conn, mut rx, _) = connection_with(transport.clone(), config);
        let sensor = conn.pair().await.unwrap();
        drain(&mut rx);

        transport.fail_next(MockOperation::Discover, 1);
        let handle = tokio::spawn(async move {
            let result = conn.connect(sensor, 1).await;
            (conn, result)
        });
        while !transport.is_subscribed() {
            tokio::task::yield_now().await;
        }
        transport.drop_connection("out of range");

        let (conn, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(conn.unlock_count(), 2);
        assert_eq!(transport.unlock_counters(), vec![1, 2]);

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(connection_errors(&actions), vec![false, true]);
    }

    #[tokio::test]
    async fn test_subscribe_failure_without_retries_is_critical() {
        let (transport, _) = setup().await;
        let config = ConnectionConfig::new().link_retries(0);
        let (mut conn, mut rx, _) = connection_with(transport.clone(), config);
        let sensor = conn.pair().await.unwrap();
        drain(&mut rx);

        transport.fail_next(MockOperation::Subscribe, 1);
        assert!(conn.connect(sensor, 1).await.is_err());
        assert!(!transport.is_connected());

        let actions = drain(&mut rx);
        assert_eq!(
            states(&actions),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
        assert_eq!(connection_errors(&actions), vec![true]);
        assert!(!actions.iter().any(|a| matches!(a, Action::AddSensorReadings(_))));
    }
}

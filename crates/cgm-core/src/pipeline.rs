//! Assembled acquisition pipeline.
//!
//! [`Pipeline`] wires a transport, the store and the standard middleware
//! together and exposes the command surface: pair, connect, disconnect,
//! custom calibration and sensor reset.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::calibration::{CalibrationConfig, CalibrationEngine};
use crate::clock::{Clock, SystemClock};
use crate::connection::ConnectionConfig;
use crate::decoder::TelemetryDecoder;
use crate::error::Result;
use crate::events::{EventDispatcher, EventReceiver};
use crate::middleware::{
    CalibrationMiddleware, EventMiddleware, LogMiddleware, MissedReadingMiddleware,
    PersistenceMiddleware, SensorMiddleware,
};
use crate::persistence::Persistence;
use crate::store::{Action, AppState, Store, StoreConfig, StoreHandle, reduce};
use crate::transport::FrameTransport;

/// Configuration for a [`Pipeline`].
pub struct PipelineBuilder {
    transport: Arc<dyn FrameTransport>,
    connection: ConnectionConfig,
    calibration: CalibrationConfig,
    store: StoreConfig,
    decoder: TelemetryDecoder,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("connection", &self.connection)
            .field("calibration", &self.calibration)
            .field("store", &self.store)
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    #[must_use]
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    #[must_use]
    pub fn calibration(mut self, config: CalibrationConfig) -> Self {
        self.calibration = config;
        self
    }

    #[must_use]
    pub fn store(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }

    #[must_use]
    pub fn decoder(mut self, decoder: TelemetryDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Timestamp frames with `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load from and save to `backend`.
    #[must_use]
    pub fn persistence(mut self, backend: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Validate the configuration, restore persisted state and start the
    /// store. Must be called within a tokio runtime.
    pub async fn start(self) -> Result<Pipeline> {
        self.connection.validate()?;
        self.calibration.validate()?;
        self.store.validate()?;

        let mut state = AppState::new(&self.store);
        let events = EventDispatcher::new(self.store.event_capacity);
        let mut store = Store::new(&self.store).middleware(LogMiddleware);

        if let Some(backend) = self.persistence {
            let restored = backend.load().await?;
            if let Some(persisted) = restored {
                info!(
                    paired = persisted.sensor.is_some(),
                    values = persisted.glucose_values.len(),
                    "Restored state"
                );
                state = reduce(state, &Action::Restore(Box::new(persisted)));
            }
            store = store.middleware(
                PersistenceMiddleware::new(backend).with_baseline(state.persisted()),
            );
        }

        let handle = store
            .with_state(state)
            .middleware(
                SensorMiddleware::new(self.transport, self.connection.clone())
                    .with_decoder(self.decoder)
                    .with_clock(self.clock),
            )
            .middleware(CalibrationMiddleware::new(CalibrationEngine::new(
                self.calibration,
            )))
            .middleware(MissedReadingMiddleware::new(
                self.connection.expected_interval,
            ))
            .middleware(EventMiddleware::new(events.clone()))
            .spawn();
        debug!("Pipeline started");

        Ok(Pipeline { handle, events })
    }
}

/// A running pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    handle: StoreHandle,
    events: EventDispatcher,
}

impl Pipeline {
    pub fn builder(transport: Arc<dyn FrameTransport>) -> PipelineBuilder {
        PipelineBuilder {
            transport,
            connection: ConnectionConfig::default(),
            calibration: CalibrationConfig::default(),
            store: StoreConfig::default(),
            decoder: TelemetryDecoder::default(),
            clock: Arc::new(SystemClock),
            persistence: None,
        }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &StoreHandle {
        &self.handle
    }

    pub fn state(&self) -> Arc<AppState> {
        self.handle.state()
    }

    /// Subscribe to core events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.handle.dispatch(action)
    }

    pub fn pair(&self) -> Result<()> {
        self.dispatch(Action::Pair)
    }

    pub fn connect(&self) -> Result<()> {
        self.dispatch(Action::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.dispatch(Action::Disconnect)
    }

    /// Calibrate the latest reading against a reference value.
    pub fn add_custom_calibration(&self, value: f64) -> Result<()> {
        self.dispatch(Action::add_custom_calibration(value))
    }

    pub fn remove_custom_calibration(&self, id: Uuid) -> Result<()> {
        self.dispatch(Action::RemoveCustomCalibration { id })
    }

    pub fn add_blood_glucose(&self, value: i32) -> Result<()> {
        self.dispatch(Action::add_blood_glucose(value))
    }

    pub fn reset_sensor(&self) -> Result<()> {
        self.dispatch(Action::ResetSensor)
    }

    /// Stop the store. Running sessions are cancelled when their
    /// middleware is dropped.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

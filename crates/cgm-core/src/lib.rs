//! Acquisition, calibration and state pipeline for continuous glucose
//! monitoring sensors.
//!
//! Data flows one way:
//!
//! ```text
//! transport chunks → FrameReassembler → TelemetryDecoder → CalibrationEngine
//!                  → Action → reduce → middleware → further actions
//! ```
//!
//! # Features
//!
//! - **Frame reassembly**: notification chunks buffered into fixed-size frames
//! - **Decryption**: per-sensor keyed cipher with CRC verification
//! - **Unlock handshake**: monotonic counter with replay-proof payloads
//! - **Calibration**: factory curve, custom linear correction, rate limiting,
//!   trend classification
//! - **Connection state machine**: pairing, streaming and teardown over any
//!   [`FrameTransport`]
//! - **Single-writer store**: one queue, one pure reducer, ordered middleware
//! - **Virtual sensor**: deterministic encrypted telemetry for tests and demos
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cgm_core::{MockTransport, Pipeline, VirtualSensor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MockTransport::with_default_name());
//!     VirtualSensor::new(1).install(&transport).await;
//!
//!     let pipeline = Pipeline::builder(transport).start().await?;
//!     let mut events = pipeline.subscribe();
//!     pipeline.pair()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod clock;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod events;
pub mod middleware;
pub mod mock;
pub mod persistence;
pub mod pipeline;
pub mod reassembler;
pub mod store;
pub mod transport;
pub mod unlock;
pub mod virtual_sensor;

// Re-export types and uuid modules from cgm-types
pub use cgm_types::types;
pub use cgm_types::uuids;

// Core exports
pub use calibration::{
    CalibrationConfig, CalibrationEngine, FactoryCurve, RateLimiter, StandardCurve, minute_change,
};
pub use clock::{Clock, ScaledClock, SystemClock};
pub use connection::{ConnectionConfig, Flow, Phase, SensorConnection, can_transition};
pub use decoder::{DecodedFrame, KeyedStreamCipher, TelemetryCipher, TelemetryDecoder};
pub use error::{Error, Result, Severity};
pub use events::{CoreEvent, EventDispatcher, EventReceiver, EventSender};
pub use middleware::{
    CalibrationMiddleware, EventMiddleware, LogMiddleware, MissedReadingMiddleware,
    PersistenceMiddleware, SensorMiddleware,
};
pub use mock::{MockOperation, MockTransport};
pub use persistence::{MemoryPersistence, PersistedState, Persistence};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use reassembler::{FRAME_SIZE, FrameReassembler, ReassemblyResult};
pub use store::{
    Action, AppState, Middleware, SessionId, Store, StoreConfig, StoreHandle, reduce,
};
pub use transport::{DiscoveredSensor, FrameTransport, TransportEvent};
pub use unlock::{UNLOCK_PAYLOAD_LEN, UnlockCodec, UnlockCounter};
pub use virtual_sensor::VirtualSensor;

/// Shared transport reference.
pub type SharedTransport = std::sync::Arc<dyn FrameTransport>;

//! Durable state across restarts.
//!
//! The store itself never touches disk. A [`Persistence`] backend is driven
//! by [`PersistenceMiddleware`](crate::middleware::PersistenceMiddleware)
//! after commits and read once at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use cgm_types::{CalibratedGlucose, Sensor};

use crate::error::Result;

/// The subset of state that survives a restart.
///
/// The unlock counter is persisted with the sensor: reusing a counter value
/// would be rejected by the sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub sensor: Option<Sensor>,
    pub unlock_count: u32,
    pub glucose_values: Vec<CalibratedGlucose>,
    pub blood_glucose_values: Vec<CalibratedGlucose>,
}

/// Storage backend for [`PersistedState`].
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the last saved state, if any.
    async fn load(&self) -> Result<Option<PersistedState>>;

    /// Replace the saved state.
    async fn save(&self, state: &PersistedState) -> Result<()>;
}

/// In-memory backend, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<Option<PersistedState>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a previously saved state.
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Default::default(),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

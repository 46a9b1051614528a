//! Pipeline persistence backed by SQLite.

use std::path::Path;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::debug;

use cgm_core::{PersistedState, Persistence};

use crate::error::Result;
use crate::store::Store;

/// Default window of history restored into the pipeline.
pub const DEFAULT_RESTORE_WINDOW: Duration = Duration::hours(24);

/// Default retention for stored history.
pub const DEFAULT_RETENTION: Duration = Duration::days(90);

/// [`Persistence`] backend over a [`Store`].
///
/// Snapshots append to the history; only the last
/// [`restore_window`](Self::restore_window) is loaded back.
#[derive(Debug)]
pub struct SqlitePersistence {
    store: Mutex<Store>,
    restore_window: Duration,
    retention: Option<Duration>,
}

impl SqlitePersistence {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
            restore_window: DEFAULT_RESTORE_WINDOW,
            retention: Some(DEFAULT_RETENTION),
        }
    }

    /// Open a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Store::open(path)?))
    }

    /// Window of history handed back by [`Persistence::load`].
    #[must_use]
    pub fn restore_window(mut self, window: Duration) -> Self {
        self.restore_window = window;
        self
    }

    /// Prune values older than `retention` on each save. `None` keeps everything.
    #[must_use]
    pub fn retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Mutex<Store> {
        &self.store
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn load(&self) -> cgm_core::Result<Option<PersistedState>> {
        let since = OffsetDateTime::now_utc() - self.restore_window;
        let store = self.store.lock().await;
        Ok(store.load_persisted(since)?)
    }

    async fn save(&self, state: &PersistedState) -> cgm_core::Result<()> {
        let mut store = self.store.lock().await;
        let inserted = store.save_persisted(state)?;
        if let Some(retention) = self.retention {
            store.prune_before(OffsetDateTime::now_utc() - retention)?;
        }
        debug!(inserted, "Persisted snapshot");
        Ok(())
    }
}

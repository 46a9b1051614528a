//! Local persistence for continuous glucose monitoring data.
//!
//! SQLite-backed storage for the paired sensor, its unlock counter and the
//! glucose history, so a restart resumes where the pipeline left off.
//!
//! # Features
//!
//! - Single paired sensor with calibration data and unlock counter
//! - Glucose history (sensor and manual entries) with de-duplication
//! - Time-range queries with pagination
//! - Summary statistics and retention pruning
//! - [`SqlitePersistence`] adapter for the pipeline's persistence hook
//!
//! # Example
//!
//! ```no_run
//! use cgm_store::{GlucoseQuery, Store};
//!
//! let store = Store::open_default()?;
//! let latest = store.query_glucose(&GlucoseQuery::new().limit(10))?;
//! # Ok::<(), cgm_store::Error>(())
//! ```

mod error;
mod models;
mod persistence;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{GlucoseStats, StoredSensor};
pub use persistence::SqlitePersistence;
pub use queries::GlucoseQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/cgm/data.db`
/// - macOS: `~/Library/Application Support/cgm/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\cgm\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("cgm")
        .join("data.db")
}

//! Query builder for glucose history.
//!
//! # Example
//!
//! ```
//! use cgm_store::{GlucoseQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let query = GlucoseQuery::new()
//!     .since(OffsetDateTime::now_utc() - Duration::hours(3))
//!     .oldest_first();
//! let values = store.query_glucose(&query)?;
//! assert!(values.is_empty());
//! # Ok::<(), cgm_store::Error>(())
//! ```

use cgm_types::GlucoseType;
use time::OffsetDateTime;

/// Fluent query builder for glucose values.
///
/// By default, queries return sensor and manual values, newest first.
#[derive(Debug, Default, Clone)]
pub struct GlucoseQuery {
    /// Restrict to one origin.
    pub glucose_type: Option<GlucoseType>,
    /// Values at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Values at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Skip faulted samples.
    pub valid_only: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Order by timestamp descending (default: true).
    pub newest_first: bool,
}

impl GlucoseQuery {
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn glucose_type(mut self, glucose_type: GlucoseType) -> Self {
        self.glucose_type = Some(glucose_type);
        self
    }

    #[must_use]
    pub fn since(mut self, at: OffsetDateTime) -> Self {
        self.since = Some(at);
        self
    }

    #[must_use]
    pub fn until(mut self, at: OffsetDateTime) -> Self {
        self.until = Some(at);
        self
    }

    #[must_use]
    pub fn valid_only(mut self) -> Self {
        self.valid_only = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL and its parameters.
    pub(crate) fn build_sql(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut sql = String::from(
            "SELECT id, glucose_type, timestamp, value, raw_value, minute_change, trend, quality \
             FROM glucose WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(glucose_type) = self.glucose_type {
            sql.push_str(" AND glucose_type = ?");
            params.push(Box::new(crate::store::glucose_type_name(glucose_type)));
        }
        if let Some(since) = self.since {
            sql.push_str(" AND timestamp >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }
        if let Some(until) = self.until {
            sql.push_str(" AND timestamp <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }
        if self.valid_only {
            sql.push_str(" AND value IS NOT NULL");
        }

        sql.push_str(if self.newest_first {
            " ORDER BY timestamp DESC"
        } else {
            " ORDER BY timestamp ASC"
        });

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            if self.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        (sql, params)
    }
}

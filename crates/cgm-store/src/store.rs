//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use cgm_core::PersistedState;
use cgm_types::{CalibratedGlucose, GlucoseType, SampleQuality, Sensor, Trend};

use crate::error::{Error, Result};
use crate::models::{GlucoseStats, StoredSensor};
use crate::queries::GlucoseQuery;
use crate::schema;

/// Default target range used by [`Store::stats`], in mg/dL.
pub const TARGET_RANGE: (i32, i32) = (70, 180);

/// SQLite-based store for the paired sensor and glucose history.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Sensor ===

    /// Store the paired sensor and its unlock counter, replacing any previous one.
    pub fn save_sensor(&self, sensor: &Sensor, unlock_count: u32) -> Result<()> {
        let data = serde_json::to_string(sensor)?;
        self.conn.execute(
            "INSERT INTO sensor (id, serial, data, unlock_count, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                serial = ?1, data = ?2, unlock_count = ?3, updated_at = ?4",
            params![
                sensor.serial,
                data,
                unlock_count,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        debug!(serial = %sensor.serial, unlock_count, "Saved sensor");
        Ok(())
    }

    /// The paired sensor, if any.
    pub fn load_sensor(&self) -> Result<Option<StoredSensor>> {
        let row = self
            .conn
            .query_row(
                "SELECT data, unlock_count, updated_at FROM sensor WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, unlock_count, updated_at)) = row else {
            return Ok(None);
        };
        let sensor: Sensor = serde_json::from_str(&data)?;
        let updated_at = OffsetDateTime::from_unix_timestamp(updated_at)
            .map_err(|_| Error::InvalidTimestamp(updated_at))?;

        Ok(Some(StoredSensor {
            sensor,
            unlock_count,
            updated_at,
        }))
    }

    /// Forget the paired sensor. History is kept.
    pub fn clear_sensor(&self) -> Result<bool> {
        let deleted = self.conn.execute("DELETE FROM sensor WHERE id = 1", [])?;
        Ok(deleted > 0)
    }

    // === Glucose ===

    /// Insert glucose values. Values whose origin and timestamp are already
    /// stored are skipped. Returns the number inserted.
    pub fn insert_glucose(&mut self, values: &[CalibratedGlucose]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let inserted = insert_glucose_tx(&tx, values)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Query glucose values.
    pub fn query_glucose(&self, query: &GlucoseQuery) -> Result<Vec<CalibratedGlucose>> {
        let (sql, params) = query.build_sql();
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), read_glucose_row)?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row_to_glucose(row?)?);
        }
        Ok(values)
    }

    /// Count glucose values, optionally of one origin.
    pub fn count_glucose(&self, glucose_type: Option<GlucoseType>) -> Result<u64> {
        let count: i64 = match glucose_type {
            Some(kind) => self.conn.query_row(
                "SELECT COUNT(*) FROM glucose WHERE glucose_type = ?",
                [glucose_type_name(kind)],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM glucose", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    /// Delete values older than `before`. Returns the number deleted.
    pub fn prune_before(&self, before: OffsetDateTime) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM glucose WHERE timestamp < ?",
            [before.unix_timestamp()],
        )?;
        if deleted > 0 {
            info!("Pruned {} glucose values", deleted);
        }
        Ok(deleted)
    }

    /// Summary of sensor values, optionally limited to values at or after `since`.
    pub fn stats(&self, since: Option<OffsetDateTime>) -> Result<GlucoseStats> {
        let mut query = GlucoseQuery::new()
            .glucose_type(GlucoseType::Cgm)
            .oldest_first();
        if let Some(since) = since {
            query = query.since(since);
        }
        Ok(summarize(&self.query_glucose(&query)?))
    }

    // === Pipeline state ===

    /// Write a pipeline snapshot: the sensor row is replaced or cleared and
    /// new values are appended. Runs in one transaction.
    ///
    /// The stored unlock counter of an unchanged sensor only moves forward.
    pub fn save_persisted(&mut self, state: &PersistedState) -> Result<usize> {
        let tx = self.conn.transaction()?;

        match &state.sensor {
            Some(sensor) => {
                // A late snapshot must not lower the counter of the same sensor.
                tx.execute(
                    "INSERT INTO sensor (id, serial, data, unlock_count, updated_at)
                     VALUES (1, ?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        unlock_count = CASE WHEN serial = ?1
                            THEN MAX(unlock_count, ?3) ELSE ?3 END,
                        serial = ?1, data = ?2, updated_at = ?4",
                    params![
                        sensor.serial,
                        serde_json::to_string(sensor)?,
                        state.unlock_count,
                        OffsetDateTime::now_utc().unix_timestamp()
                    ],
                )?;
            }
            None => {
                tx.execute("DELETE FROM sensor WHERE id = 1", [])?;
            }
        }

        let mut inserted = insert_glucose_tx(&tx, &state.glucose_values)?;
        inserted += insert_glucose_tx(&tx, &state.blood_glucose_values)?;
        tx.commit()?;

        debug!(inserted, paired = state.sensor.is_some(), "Saved snapshot");
        Ok(inserted)
    }

    /// Rebuild a pipeline snapshot from values at or after `since`.
    ///
    /// Returns `None` for an empty database.
    pub fn load_persisted(&self, since: OffsetDateTime) -> Result<Option<PersistedState>> {
        let stored = self.load_sensor()?;
        let glucose_values = self.query_glucose(
            &GlucoseQuery::new()
                .glucose_type(GlucoseType::Cgm)
                .since(since)
                .oldest_first(),
        )?;
        let blood_glucose_values = self.query_glucose(
            &GlucoseQuery::new()
                .glucose_type(GlucoseType::Bgm)
                .since(since)
                .oldest_first(),
        )?;

        if stored.is_none() && glucose_values.is_empty() && blood_glucose_values.is_empty() {
            return Ok(None);
        }

        let (sensor, unlock_count) = match stored {
            Some(stored) => (Some(stored.sensor), stored.unlock_count),
            None => (None, 0),
        };
        Ok(Some(PersistedState {
            sensor,
            unlock_count,
            glucose_values,
            blood_glucose_values,
        }))
    }
}

fn insert_glucose_tx(tx: &rusqlite::Transaction<'_>, values: &[CalibratedGlucose]) -> Result<usize> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO glucose
            (id, glucose_type, timestamp, value, raw_value, minute_change, trend, quality)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )?;

    let mut inserted = 0;
    for value in values {
        inserted += stmt.execute(params![
            value.id.to_string(),
            glucose_type_name(value.glucose_type),
            value.timestamp.unix_timestamp(),
            value.glucose_value,
            value.raw_value,
            value.minute_change,
            trend_name(value.trend),
            value.quality.code(),
        ])?;
    }
    Ok(inserted)
}

/// Columns of a glucose row before interpretation.
type GlucoseRow = (String, String, i64, Option<i32>, Option<f64>, Option<f64>, String, u16);

fn read_glucose_row(row: &Row) -> rusqlite::Result<GlucoseRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

/// Convert a database row to a glucose value.
fn row_to_glucose(row: GlucoseRow) -> Result<CalibratedGlucose> {
    let (id, glucose_type, timestamp, glucose_value, raw_value, minute_change, trend, quality) =
        row;

    Ok(CalibratedGlucose {
        id: Uuid::parse_str(&id).map_err(|_| Error::Corrupt(format!("glucose id {id}")))?,
        timestamp: OffsetDateTime::from_unix_timestamp(timestamp)
            .map_err(|_| Error::InvalidTimestamp(timestamp))?,
        glucose_value,
        raw_value,
        minute_change,
        trend: parse_trend(&trend),
        glucose_type: parse_glucose_type(&glucose_type)?,
        quality: SampleQuality::from_code(quality),
    })
}

fn summarize(values: &[CalibratedGlucose]) -> GlucoseStats {
    let mut stats = GlucoseStats {
        first: values.first().map(|v| v.timestamp),
        last: values.last().map(|v| v.timestamp),
        ..Default::default()
    };

    let numbers: Vec<i32> = values
        .iter()
        .filter(|v| v.is_valid())
        .filter_map(|v| v.glucose_value)
        .collect();
    stats.count = numbers.len() as u64;
    stats.faulted = (values.len() - numbers.len()) as u64;

    if numbers.is_empty() {
        return stats;
    }

    let (low, high) = TARGET_RANGE;
    let in_range = numbers.iter().filter(|&&v| (low..=high).contains(&v)).count();
    stats.min = numbers.iter().copied().min();
    stats.max = numbers.iter().copied().max();
    stats.mean = Some(numbers.iter().map(|&v| f64::from(v)).sum::<f64>() / numbers.len() as f64);
    stats.time_in_range = Some(in_range as f64 * 100.0 / numbers.len() as f64);
    stats
}

pub(crate) fn glucose_type_name(glucose_type: GlucoseType) -> &'static str {
    match glucose_type {
        GlucoseType::Cgm => "cgm",
        GlucoseType::Bgm => "bgm",
    }
}

fn parse_glucose_type(s: &str) -> Result<GlucoseType> {
    match s {
        "cgm" => Ok(GlucoseType::Cgm),
        "bgm" => Ok(GlucoseType::Bgm),
        other => Err(Error::Corrupt(format!("glucose type {other}"))),
    }
}

fn trend_name(trend: Trend) -> &'static str {
    match trend {
        Trend::RapidlyFalling => "rapidly_falling",
        Trend::FastFalling => "fast_falling",
        Trend::Falling => "falling",
        Trend::Constant => "constant",
        Trend::Rising => "rising",
        Trend::FastRising => "fast_rising",
        Trend::RapidlyRising => "rapidly_rising",
        Trend::Unknown => "unknown",
    }
}

fn parse_trend(s: &str) -> Trend {
    match s {
        "rapidly_falling" => Trend::RapidlyFalling,
        "fast_falling" => Trend::FastFalling,
        "falling" => Trend::Falling,
        "constant" => Trend::Constant,
        "rising" => Trend::Rising,
        "fast_rising" => Trend::FastRising,
        "rapidly_rising" => Trend::RapidlyRising,
        _ => Trend::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgm_types::FactoryCalibration;
    use time::Duration;
    use time::macros::datetime;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
    const PATCH: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    fn sensor() -> Sensor {
        Sensor::new(
            &UID,
            &PATCH,
            FactoryCalibration::identity(),
            600,
            datetime!(2026-03-01 12:00 UTC),
        )
        .unwrap()
    }

    fn series(start: OffsetDateTime, values: &[i32]) -> Vec<CalibratedGlucose> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                CalibratedGlucose::sensor(
                    start + Duration::minutes(i as i64),
                    v,
                    f64::from(v),
                    Some(0.5),
                    Trend::Constant,
                )
            })
            .collect()
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_sensor().unwrap().is_none());
        assert_eq!(store.count_glucose(None).unwrap(), 0);
    }

    #[test]
    fn test_sensor_roundtrip_and_replace() {
        let store = Store::open_in_memory().unwrap();
        let sensor = sensor();

        store.save_sensor(&sensor, 3).unwrap();
        let stored = store.load_sensor().unwrap().unwrap();
        assert_eq!(stored.sensor, sensor);
        assert_eq!(stored.unlock_count, 3);

        store.save_sensor(&sensor, 4).unwrap();
        assert_eq!(store.load_sensor().unwrap().unwrap().unlock_count, 4);

        assert!(store.clear_sensor().unwrap());
        assert!(store.load_sensor().unwrap().is_none());
        assert!(!store.clear_sensor().unwrap());
    }

    #[test]
    fn test_insert_skips_duplicate_minutes() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);

        assert_eq!(store.insert_glucose(&series(start, &[100, 105])).unwrap(), 2);
        // Same minutes, fresh ids
        assert_eq!(store.insert_glucose(&series(start, &[101, 106])).unwrap(), 0);
        // A manual entry at the same minute is a different origin
        let bg = CalibratedGlucose::blood_glucose(start, 110);
        assert_eq!(store.insert_glucose(&[bg]).unwrap(), 1);

        assert_eq!(store.count_glucose(None).unwrap(), 3);
        assert_eq!(store.count_glucose(Some(GlucoseType::Bgm)).unwrap(), 1);
    }

    #[test]
    fn test_query_preserves_fields() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        let mut values = series(start, &[100]);
        values.push(CalibratedGlucose::faulted(
            start + Duration::minutes(1),
            SampleQuality::SignalLoss,
        ));
        store.insert_glucose(&values).unwrap();

        let loaded = store.query_glucose(&GlucoseQuery::new().oldest_first()).unwrap();
        assert_eq!(loaded, values);

        let valid = store.query_glucose(&GlucoseQuery::new().valid_only()).unwrap();
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn test_query_range_and_pagination() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        store
            .insert_glucose(&series(start, &[100, 101, 102, 103, 104]))
            .unwrap();

        let newest = store.query_glucose(&GlucoseQuery::new().limit(2)).unwrap();
        assert_eq!(
            newest.iter().map(|v| v.glucose_value).collect::<Vec<_>>(),
            vec![Some(104), Some(103)]
        );

        let page = store
            .query_glucose(&GlucoseQuery::new().oldest_first().limit(2).offset(2))
            .unwrap();
        assert_eq!(page[0].glucose_value, Some(102));

        let window = store
            .query_glucose(
                &GlucoseQuery::new()
                    .since(start + Duration::minutes(1))
                    .until(start + Duration::minutes(3)),
            )
            .unwrap();
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_prune_before() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        store.insert_glucose(&series(start, &[100, 101, 102])).unwrap();

        assert_eq!(store.prune_before(start + Duration::minutes(2)).unwrap(), 2);
        assert_eq!(store.count_glucose(None).unwrap(), 1);
    }

    #[test]
    fn test_stats() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        let mut values = series(start, &[60, 100, 200, 120]);
        values.push(CalibratedGlucose::faulted(
            start + Duration::minutes(10),
            SampleQuality::Noisy,
        ));
        store.insert_glucose(&values).unwrap();
        store
            .insert_glucose(&[CalibratedGlucose::blood_glucose(start, 300)])
            .unwrap();

        let stats = store.stats(None).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.faulted, 1);
        assert_eq!(stats.min, Some(60));
        assert_eq!(stats.max, Some(200));
        assert_eq!(stats.mean, Some(120.0));
        assert_eq!(stats.time_in_range, Some(50.0));
        assert_eq!(stats.first, Some(start));

        let empty = Store::open_in_memory().unwrap().stats(None).unwrap();
        assert_eq!(empty.count, 0);
        assert!(empty.mean.is_none());
    }

    #[test]
    fn test_persisted_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        assert!(store.load_persisted(start).unwrap().is_none());

        let state = PersistedState {
            sensor: Some(sensor()),
            unlock_count: 7,
            glucose_values: series(start, &[100, 102]),
            blood_glucose_values: vec![CalibratedGlucose::blood_glucose(start, 98)],
        };
        assert_eq!(store.save_persisted(&state).unwrap(), 3);
        // Saving the same snapshot again adds nothing
        assert_eq!(store.save_persisted(&state).unwrap(), 0);

        let loaded = store.load_persisted(start).unwrap().unwrap();
        assert_eq!(loaded, state);

        let later = store
            .load_persisted(start + Duration::minutes(1))
            .unwrap()
            .unwrap();
        assert_eq!(later.glucose_values.len(), 1);
        assert!(later.blood_glucose_values.is_empty());
    }

    #[test]
    fn test_persisted_counter_never_moves_back() {
        let mut store = Store::open_in_memory().unwrap();
        let mut state = PersistedState {
            sensor: Some(sensor()),
            unlock_count: 5,
            ..Default::default()
        };
        store.save_persisted(&state).unwrap();

        state.unlock_count = 4;
        store.save_persisted(&state).unwrap();
        assert_eq!(store.load_sensor().unwrap().unwrap().unlock_count, 5);

        state.unlock_count = 6;
        store.save_persisted(&state).unwrap();
        assert_eq!(store.load_sensor().unwrap().unwrap().unlock_count, 6);
    }

    #[test]
    fn test_persisted_reset_clears_sensor_keeps_history() {
        let mut store = Store::open_in_memory().unwrap();
        let start = datetime!(2026-03-01 12:00 UTC);
        let mut state = PersistedState {
            sensor: Some(sensor()),
            unlock_count: 2,
            glucose_values: series(start, &[100]),
            blood_glucose_values: Vec::new(),
        };
        store.save_persisted(&state).unwrap();

        state.sensor = None;
        state.unlock_count = 0;
        store.save_persisted(&state).unwrap();

        let loaded = store.load_persisted(start).unwrap().unwrap();
        assert!(loaded.sensor.is_none());
        assert_eq!(loaded.unlock_count, 0);
        assert_eq!(loaded.glucose_values.len(), 1);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        {
            let store = Store::open(&path).unwrap();
            store.save_sensor(&sensor(), 1).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.load_sensor().unwrap().unwrap().unlock_count, 1);
    }

    #[test]
    fn test_name_helpers_roundtrip() {
        for trend in [
            Trend::RapidlyFalling,
            Trend::FastFalling,
            Trend::Falling,
            Trend::Constant,
            Trend::Rising,
            Trend::FastRising,
            Trend::RapidlyRising,
            Trend::Unknown,
        ] {
            assert_eq!(parse_trend(trend_name(trend)), trend);
        }
        assert!(parse_glucose_type("bogus").is_err());
    }
}

//! Shared helpers for command implementations.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tracing::debug;

use cgm_core::{Action, AppState, reduce};
use cgm_store::Store;

use crate::config::Config;

/// Write output to file or stdout
pub fn write_output(output: Option<&PathBuf>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }
        None => {
            print!("{}", content);
            io::stdout().flush()?;
        }
    }
    Ok(())
}

/// Parse RFC 3339 or `YYYY-MM-DD` (start of day, UTC).
pub fn parse_datetime(s: &str) -> Result<OffsetDateTime> {
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(dt);
    }

    if let Ok(date) = time::Date::parse(s, format_description!("[year]-[month]-[day]")) {
        return Ok(date.midnight().assume_utc());
    }

    bail!(
        "Invalid date format '{}'. Use RFC3339 (e.g., 2026-01-15T10:30:00Z) or YYYY-MM-DD",
        s
    )
}

/// Open the database, creating it if needed.
pub fn open_store(path: &Path) -> Result<Store> {
    Store::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Rebuild application state from the database, as the pipeline would at startup.
pub fn restore_state(store: &Store, config: &Config) -> Result<AppState> {
    let state = AppState::new(&config.store_config());
    let since = OffsetDateTime::now_utc() - config.horizon();
    match store
        .load_persisted(since)
        .context("Failed to load stored state")?
    {
        Some(persisted) => Ok(reduce(state, &Action::Restore(Box::new(persisted)))),
        None => Ok(state),
    }
}

/// Apply a command to the stored state without a running pipeline and save the result.
pub fn apply_offline(store: &mut Store, config: &Config, action: Action) -> Result<AppState> {
    let state = restore_state(store, config)?;
    debug!(action = action.name(), "Applying offline");
    let state = reduce(state, &action);
    store
        .save_persisted(&state.persisted())
        .context("Failed to save state")?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_datetime_rfc3339() {
        assert_eq!(
            parse_datetime("2026-01-15T10:30:00Z").unwrap(),
            datetime!(2026-01-15 10:30 UTC)
        );
    }

    #[test]
    fn test_parse_datetime_date_only() {
        assert_eq!(
            parse_datetime("2026-01-15").unwrap(),
            datetime!(2026-01-15 0:00 UTC)
        );
    }

    #[test]
    fn test_parse_datetime_invalid() {
        let err = parse_datetime("yesterday").unwrap_err().to_string();
        assert!(err.contains("Invalid date format"));
    }

    #[test]
    fn test_apply_offline_blood_glucose() {
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::default();

        let state = apply_offline(&mut store, &config, Action::add_blood_glucose(95)).unwrap();
        assert_eq!(state.blood_glucose_values.len(), 1);

        let restored = restore_state(&store, &config).unwrap();
        assert_eq!(restored.blood_glucose_values[0].glucose_value, Some(95));
    }

    #[test]
    fn test_write_output_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_output(Some(&path), "hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
    }
}

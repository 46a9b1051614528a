//! Command-line interface for continuous glucose monitor sensors.
//!
//! The CLI drives the `cgm-core` pipeline against a virtual sensor and keeps
//! its state in a local SQLite database (`cgm-store`). Commands other than
//! `simulate` work offline on that database, applying the same reducer the
//! pipeline uses.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `simulate` | Pair with a virtual sensor and stream readings |
//! | `status` | Paired sensor, latest value and 24 h statistics |
//! | `history` | Stored glucose values |
//! | `calibration` | List, add or remove custom calibration points |
//! | `bg` | Record a blood glucose meter reading |
//! | `reset` | Forget the paired sensor |
//! | `config` | Manage CLI configuration |
//! | `completions` | Generate shell completions |
//!
//! # Output Formats
//!
//! - **Text** (default): Human-readable colored output
//! - **JSON**: Machine-readable JSON format
//! - **CSV**: Comma-separated values for spreadsheets and data analysis
//!
//! # Configuration
//!
//! The CLI stores configuration in `~/.config/cgm/config.toml` (or platform
//! equivalent). It covers the database location, default output format,
//! calibration limits, reading interval, history horizon and simulation
//! defaults. Run `cgm config init` to write a commented default file.
//!
//! # Environment Variables
//!
//! - `CGM_DATABASE`: Database file (overridden by `--database`)
//! - `NO_COLOR`: Disable colored output when set
//! - `RUST_LOG`: Log filter when neither `--verbose` nor `--quiet` is given
//!
//! # Examples
//!
//! Stream two simulated hours at 600x:
//! ```bash
//! cgm simulate --minutes 120 --speed 600
//! ```
//!
//! Calibrate against a finger stick:
//! ```bash
//! cgm calibration add 112
//! ```
//!
//! Export the last day as CSV:
//! ```bash
//! cgm history --since 2026-01-01 --format csv --output glucose.csv
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod format;
pub mod style;
pub mod util;

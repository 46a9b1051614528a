//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

/// Which glucose values to include
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum GlucoseKind {
    /// Sensor values only
    #[default]
    Sensor,
    /// Blood glucose meter entries only
    Blood,
    /// Both
    All,
}

/// Reusable output format arguments
#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    /// Output format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Omit header row in CSV output (useful for appending)
    #[arg(long)]
    pub no_header: bool,
}

#[derive(Parser)]
#[command(name = "cgm")]
#[command(author, version, about = "CLI for continuous glucose monitor sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as JSON (shorthand for --format json)
    #[arg(long, global = true)]
    pub json: bool,

    /// Output compact JSON (no pretty-printing)
    #[arg(long, global = true)]
    pub compact: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Database file (defaults to the config value, then the platform data directory)
    #[arg(long, global = true, env = "CGM_DATABASE")]
    pub database: Option<PathBuf>,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pair with a virtual sensor and stream simulated readings through the pipeline
    Simulate(SimulateArgs),

    /// Show the paired sensor and the latest glucose value
    Status {
        #[command(flatten)]
        output: OutputArgs,

        /// Super-compact single-line output for scripting
        #[arg(long)]
        brief: bool,
    },

    /// Show stored glucose history
    History(HistoryArgs),

    /// Manage custom calibration points of the paired sensor
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },

    /// Record a blood glucose meter reading
    #[command(name = "bg")]
    BloodGlucose {
        /// Value in mg/dL
        #[arg(value_parser = parse_glucose)]
        value: i32,
    },

    /// Forget the paired sensor (history is kept)
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Arguments for the simulate command
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Number of simulated minutes to stream
    #[arg(short, long, default_value = "30")]
    pub minutes: u32,

    /// Time acceleration (60 streams one simulated minute per second)
    #[arg(short, long)]
    pub speed: Option<f64>,

    /// Seed for the virtual sensor; the same seed is the same sensor
    #[arg(long)]
    pub seed: Option<u64>,

    /// Sensor age in minutes when the simulation starts
    #[arg(long)]
    pub age: Option<u32>,

    /// Event output format (text, json)
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Do not read or write the database
    #[arg(long)]
    pub ephemeral: bool,
}

/// Arguments for the history command
#[derive(Debug, Clone, Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub output: OutputArgs,

    /// Maximum number of values (0 for all)
    #[arg(short = 'n', long, default_value = "0")]
    pub limit: u32,

    /// Values since this date/time (RFC3339 or YYYY-MM-DD)
    #[arg(long)]
    pub since: Option<String>,

    /// Values until this date/time (RFC3339 or YYYY-MM-DD)
    #[arg(long)]
    pub until: Option<String>,

    /// Which values to include
    #[arg(short, long, value_enum, default_value = "sensor")]
    pub kind: GlucoseKind,

    /// Oldest first
    #[arg(long)]
    pub reverse: bool,
}

/// Calibration subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum CalibrationAction {
    /// List calibration points
    List {
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Calibrate the latest sensor reading against a reference value
    Add {
        /// Reference value in mg/dL
        #[arg(value_parser = parse_reference)]
        value: f64,
    },

    /// Remove a calibration point
    #[command(alias = "rm")]
    Remove {
        /// Calibration point id
        id: Uuid,
    },
}

/// Configuration subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Parse a glucose value in mg/dL
fn parse_glucose(s: &str) -> Result<i32, String> {
    let value: i32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if (20..=600).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Invalid glucose value '{}'. Valid range: 20-600 mg/dL", value))
    }
}

/// Parse a calibration reference value in mg/dL
fn parse_reference(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if value.is_finite() && (20.0..=600.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Invalid reference value '{}'. Valid range: 20-600 mg/dL", s))
    }
}

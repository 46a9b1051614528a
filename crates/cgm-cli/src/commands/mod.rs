//! Command implementations for the CLI.

use std::path::PathBuf;

use crate::config::Config;
use crate::format::FormatOptions;

mod calibration;
mod config;
mod history;
mod reset;
mod simulate;
mod status;

pub use calibration::{cmd_blood_glucose, cmd_calibration};
pub use config::cmd_config;
pub use history::cmd_history;
pub use reset::cmd_reset;
pub use simulate::cmd_simulate;
pub use status::cmd_status;

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: Config,
    pub database: PathBuf,
    pub output: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
    pub opts: FormatOptions,
}

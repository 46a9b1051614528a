//! Visual styling utilities for the CLI.
//!
//! Colors, spinners and table styles shared by all commands.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tabled::settings::Style;

use cgm_types::{ConnectionState, Trend};

/// Standard spinner tick characters (Braille dots animation)
const SPINNER_TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

const SPINNER_TICK_MS: u64 = 80;

/// Glucose below this is shown as low, in mg/dL.
pub const LOW_GLUCOSE: i32 = 70;

/// Glucose above this is shown as high, in mg/dL.
pub const HIGH_GLUCOSE: i32 = 180;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_chars(SPINNER_TICK_CHARS)
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spinner shown on stderr while a long operation runs. Hidden when `quiet`.
pub fn operation_spinner(message: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// Format a glucose value colored by range.
pub fn format_glucose_colored(value: Option<i32>, no_color: bool) -> String {
    let Some(value) = value else {
        return if no_color {
            "---".to_string()
        } else {
            format!("{}", "---".dimmed())
        };
    };
    let text = format!("{} mg/dL", value);
    if no_color {
        text
    } else if value < LOW_GLUCOSE {
        format!("{}", text.red().bold())
    } else if value > HIGH_GLUCOSE {
        format!("{}", text.yellow().bold())
    } else {
        format!("{}", text.green())
    }
}

/// Trend arrow, ASCII when colors are disabled.
pub fn format_trend(trend: Trend, no_color: bool) -> String {
    if no_color {
        match trend {
            Trend::RapidlyFalling => "vv",
            Trend::FastFalling => "v",
            Trend::Falling => "\\",
            Trend::Constant => "->",
            Trend::Rising => "/",
            Trend::FastRising => "^",
            Trend::RapidlyRising => "^^",
            Trend::Unknown => "?",
        }
        .to_string()
    } else {
        trend.arrow().to_string()
    }
}

pub fn format_connection_state(state: ConnectionState, no_color: bool) -> String {
    let label = state.to_string();
    if no_color {
        return label;
    }
    match state {
        ConnectionState::Connected => format!("{}", label.green()),
        ConnectionState::Scanning | ConnectionState::Connecting => format!("{}", label.cyan()),
        ConnectionState::PoweredOff => format!("{}", label.red()),
        _ => format!("{}", label.dimmed()),
    }
}

/// Format a success message.
pub fn format_success(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[OK] {}", message)
    } else {
        format!("{} {}", "[OK]".green(), message)
    }
}

/// Format an info message.
pub fn format_info(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[--] {}", message)
    } else {
        format!("{} {}", "[--]".cyan(), message)
    }
}

/// Format a warning message.
pub fn format_warning(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[!!] {}", message)
    } else {
        format!("{} {}", "[!!]".yellow(), message)
    }
}

/// Format a title header.
pub fn format_title(title: &str, no_color: bool) -> String {
    let rule = "━".repeat(title.chars().count());
    if no_color {
        format!("{}\n{}", title, rule)
    } else {
        format!("{}\n{}", title.bold(), rule.dimmed())
    }
}

/// Apply the table style used by list output.
pub fn apply_table_style(table: &mut tabled::Table, no_color: bool) {
    if no_color {
        table.with(Style::ascii());
    } else {
        table.with(Style::rounded());
    }
}

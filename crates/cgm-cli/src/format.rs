//! Output formatting utilities for text, JSON, and CSV output.

use anyhow::Result;
use serde::Serialize;
use tabled::builder::Builder;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use cgm_core::CoreEvent;
use cgm_store::GlucoseStats;
use cgm_types::{CalibratedGlucose, CustomCalibrationPoint, GlucoseType, Sensor};

use crate::style;

/// Maximum rows in text tables.
const MAX_TEXT_ROWS: usize = 48;

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Omit header row in CSV output.
    pub no_header: bool,
    /// Use compact JSON output (no pretty-printing).
    pub compact: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool) -> Self {
        Self {
            no_color,
            ..Default::default()
        }
    }

    /// Create with no_header option for CSV output.
    pub fn with_no_header(mut self, no_header: bool) -> Self {
        self.no_header = no_header;
        self
    }

    /// Create with compact JSON option.
    pub fn with_compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Serialize value to JSON string, respecting compact option.
    pub fn as_json<T: serde::Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        Ok(json + "\n")
    }
}

/// Escape a string for CSV output.
/// Wraps the value in quotes if it contains commas, quotes, or newlines.
/// Double quotes are escaped by doubling them.
#[must_use]
pub fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// RFC 3339 timestamp, empty on failure.
#[must_use]
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM`
#[must_use]
pub fn format_timestamp_short(at: OffsetDateTime) -> String {
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
        .unwrap_or_else(|_| "Unknown".to_string())
}

/// Minutes as `13d 4h`, `4h 05m` or `12m`.
#[must_use]
pub fn format_minutes(minutes: u32) -> String {
    let days = minutes / 1440;
    let hours = (minutes % 1440) / 60;
    let mins = minutes % 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

/// How long ago `at` was, relative to `now`.
#[must_use]
pub fn format_ago(at: OffsetDateTime, now: OffsetDateTime) -> String {
    let elapsed = now - at;
    if elapsed < Duration::minutes(1) {
        "just now".to_string()
    } else {
        format!("{} ago", format_minutes(elapsed.whole_minutes() as u32))
    }
}

fn glucose_type_label(kind: GlucoseType) -> &'static str {
    match kind {
        GlucoseType::Cgm => "sensor",
        GlucoseType::Bgm => "blood",
    }
}

// ============================================================================
// History formatting
// ============================================================================

pub fn format_history_text(values: &[CalibratedGlucose], opts: &FormatOptions) -> String {
    if values.is_empty() {
        return "No glucose values found.\n".to_string();
    }

    let mut output = format!("History ({} values):\n\n", values.len());
    let mut builder = Builder::default();
    builder.push_record(["Time", "Glucose", "Trend", "Change/min", "Source"]);

    for value in values.iter().take(MAX_TEXT_ROWS) {
        let glucose = if value.is_valid() {
            style::format_glucose_colored(value.glucose_value, opts.no_color)
        } else {
            value.quality.to_string()
        };
        builder.push_record([
            format_timestamp_short(value.timestamp),
            glucose,
            style::format_trend(value.trend, opts.no_color),
            value
                .minute_change
                .map(|c| format!("{:+.1}", c))
                .unwrap_or_default(),
            glucose_type_label(value.glucose_type).to_string(),
        ]);
    }

    let mut table = builder.build();
    style::apply_table_style(&mut table, opts.no_color);
    output.push_str(&table.to_string());
    output.push('\n');

    if values.len() > MAX_TEXT_ROWS {
        output.push_str(&format!(
            "... and {} more values\n",
            values.len() - MAX_TEXT_ROWS
        ));
        output.push_str("(Use --format csv or --format json for full data)\n");
    }
    output
}

#[must_use]
pub fn format_history_csv(values: &[CalibratedGlucose], opts: &FormatOptions) -> String {
    let mut output = if opts.no_header {
        String::new()
    } else {
        "timestamp,glucose_mg_dl,raw_value,minute_change,trend,source,quality\n".to_string()
    };
    for value in values {
        output.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            format_timestamp(value.timestamp),
            value.glucose_value.map(|v| v.to_string()).unwrap_or_default(),
            value.raw_value.map(|v| format!("{:.2}", v)).unwrap_or_default(),
            value
                .minute_change
                .map(|v| format!("{:.2}", v))
                .unwrap_or_default(),
            csv_escape(&value.trend.to_string()),
            glucose_type_label(value.glucose_type),
            csv_escape(&value.quality.to_string()),
        ));
    }
    output
}

#[derive(Debug, Serialize)]
struct GlucoseJson {
    id: Uuid,
    timestamp: String,
    glucose_mg_dl: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minute_change: Option<f64>,
    trend: String,
    source: &'static str,
    quality: String,
}

impl From<&CalibratedGlucose> for GlucoseJson {
    fn from(value: &CalibratedGlucose) -> Self {
        Self {
            id: value.id,
            timestamp: format_timestamp(value.timestamp),
            glucose_mg_dl: value.glucose_value,
            raw_value: value.raw_value,
            minute_change: value.minute_change,
            trend: value.trend.to_string(),
            source: glucose_type_label(value.glucose_type),
            quality: value.quality.to_string(),
        }
    }
}

pub fn format_history_json(values: &[CalibratedGlucose], opts: &FormatOptions) -> Result<String> {
    let records: Vec<GlucoseJson> = values.iter().map(GlucoseJson::from).collect();
    opts.as_json(&records)
}

// ============================================================================
// Status formatting
// ============================================================================

/// Everything `cgm status` shows.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub sensor: Option<Sensor>,
    pub unlock_count: u32,
    pub latest: Option<CalibratedGlucose>,
    pub stats: GlucoseStats,
    pub now: OffsetDateTime,
}

pub fn format_status_text(view: &StatusView, opts: &FormatOptions) -> String {
    let mut output = String::new();

    match &view.sensor {
        Some(sensor) => {
            output.push_str(&style::format_title(
                &format!("Sensor {}", sensor.serial),
                opts.no_color,
            ));
            output.push('\n');
            output.push_str(&format!("  Type:         {}\n", sensor.sensor_type));
            output.push_str(&format!("  State:        {}\n", sensor.state));
            output.push_str(&format!("  Age:          {}\n", format_minutes(sensor.age)));
            output.push_str(&format!(
                "  Remaining:    {}\n",
                format_minutes(sensor.remaining_minutes())
            ));
            output.push_str(&format!(
                "  Started:      {}\n",
                format_timestamp_short(sensor.start_timestamp)
            ));
            output.push_str(&format!(
                "  Calibration:  {} custom point(s)\n",
                sensor.custom_calibration.len()
            ));
            output.push_str(&format!("  Unlock count: {}\n", view.unlock_count));
        }
        None => {
            output.push_str(&style::format_info(
                "No sensor paired. Run `cgm simulate` to pair a virtual sensor.",
                opts.no_color,
            ));
            output.push('\n');
        }
    }

    output.push('\n');
    match &view.latest {
        Some(latest) => {
            output.push_str(&format!(
                "  Glucose:      {} {} ({})\n",
                style::format_glucose_colored(latest.glucose_value, opts.no_color),
                style::format_trend(latest.trend, opts.no_color),
                format_ago(latest.timestamp, view.now)
            ));
        }
        None => output.push_str("  Glucose:      no readings\n"),
    }

    if let (Some(mean), Some(tir)) = (view.stats.mean, view.stats.time_in_range) {
        output.push_str(&format!(
            "  Last 24h:     mean {:.0} mg/dL, {:.0}% in range, {} values\n",
            mean, tir, view.stats.count
        ));
    }
    output
}

/// Just the latest value and trend.
#[must_use]
pub fn format_status_brief(view: &StatusView, opts: &FormatOptions) -> String {
    match view.latest.as_ref().and_then(|l| l.glucose_value.map(|v| (v, l.trend))) {
        Some((value, trend)) => format!("{} {}\n", value, style::format_trend(trend, opts.no_color)),
        None => "---\n".to_string(),
    }
}

pub fn format_status_json(view: &StatusView, opts: &FormatOptions) -> Result<String> {
    #[derive(Serialize)]
    struct SensorJson<'a> {
        serial: &'a str,
        sensor_type: String,
        state: String,
        age_minutes: u32,
        remaining_minutes: u32,
        started: String,
        calibration_points: usize,
    }

    #[derive(Serialize)]
    struct StatusJson<'a> {
        sensor: Option<SensorJson<'a>>,
        unlock_count: u32,
        latest: Option<GlucoseJson>,
        stats: &'a GlucoseStats,
    }

    let status = StatusJson {
        sensor: view.sensor.as_ref().map(|s| SensorJson {
            serial: &s.serial,
            sensor_type: s.sensor_type.to_string(),
            state: s.state.to_string(),
            age_minutes: s.age,
            remaining_minutes: s.remaining_minutes(),
            started: format_timestamp(s.start_timestamp),
            calibration_points: s.custom_calibration.len(),
        }),
        unlock_count: view.unlock_count,
        latest: view.latest.as_ref().map(GlucoseJson::from),
        stats: &view.stats,
    };
    opts.as_json(&status)
}

// ============================================================================
// Calibration formatting
// ============================================================================

pub fn format_calibration_text(points: &[CustomCalibrationPoint], opts: &FormatOptions) -> String {
    if points.is_empty() {
        return "No custom calibration points.\n".to_string();
    }
    let mut builder = Builder::default();
    builder.push_record(["Id", "Time", "Sensor", "Reference"]);
    for point in points {
        builder.push_record([
            point.id.to_string(),
            format_timestamp_short(point.timestamp),
            format!("{:.1}", point.x),
            format!("{:.1}", point.y),
        ]);
    }
    let mut table = builder.build();
    style::apply_table_style(&mut table, opts.no_color);
    format!("{}\n", table)
}

#[must_use]
pub fn format_calibration_csv(points: &[CustomCalibrationPoint], opts: &FormatOptions) -> String {
    let mut output = if opts.no_header {
        String::new()
    } else {
        "id,timestamp,sensor_value,reference_value\n".to_string()
    };
    for point in points {
        output.push_str(&format!(
            "{},{},{:.2},{:.2}\n",
            point.id,
            format_timestamp(point.timestamp),
            point.x,
            point.y
        ));
    }
    output
}

pub fn format_calibration_json(
    points: &[CustomCalibrationPoint],
    opts: &FormatOptions,
) -> Result<String> {
    opts.as_json(&points)
}

// ============================================================================
// Event formatting (simulate)
// ============================================================================

/// One line per event; `None` for events not worth a line.
pub fn format_event_text(event: &CoreEvent, opts: &FormatOptions) -> Option<String> {
    let line = match event {
        CoreEvent::SensorPaired { sensor } => style::format_success(
            &format!("Paired {} ({}, {})", sensor.serial, sensor.sensor_type, sensor.state),
            opts.no_color,
        ),
        CoreEvent::ConnectionStateChanged { state } => format!(
            "Connection: {}",
            style::format_connection_state(*state, opts.no_color)
        ),
        CoreEvent::SensorAgeChanged { age, state } => {
            format!("Sensor age {} ({})", format_minutes(*age), state)
        }
        CoreEvent::GlucoseAdded { values } => {
            let latest = values.iter().rev().find(|v| v.is_valid())?;
            format!(
                "{}  {} {}  (+{} value{})",
                format_timestamp_short(latest.timestamp),
                style::format_glucose_colored(latest.glucose_value, opts.no_color),
                style::format_trend(latest.trend, opts.no_color),
                values.len(),
                if values.len() == 1 { "" } else { "s" }
            )
        }
        CoreEvent::MissedReading { count } => style::format_warning(
            &format!("Missed reading ({} in a row)", count),
            opts.no_color,
        ),
        CoreEvent::ConnectionError {
            message,
            is_critical,
            ..
        } => style::format_warning(
            &format!(
                "{}{}",
                if *is_critical { "Critical: " } else { "" },
                message
            ),
            opts.no_color,
        ),
        _ => return None,
    };
    Some(line + "\n")
}

/// One JSON object per line.
pub fn format_event_json(event: &CoreEvent) -> Result<String> {
    Ok(serde_json::to_string(event)? + "\n")
}

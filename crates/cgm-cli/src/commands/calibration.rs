//! Calibration and blood glucose commands.
//!
//! These edit the stored state directly through the reducer; no sensor
//! connection is needed.

use anyhow::{Result, bail};
use time::OffsetDateTime;
use uuid::Uuid;

use cgm_core::Action;

use crate::cli::{CalibrationAction, OutputArgs, OutputFormat};
use crate::commands::CommandContext;
use crate::config::resolve_format;
use crate::format::{format_calibration_csv, format_calibration_json, format_calibration_text};
use crate::style;
use crate::util::{apply_offline, open_store, restore_state, write_output};

pub fn cmd_calibration(ctx: &CommandContext, action: &CalibrationAction) -> Result<()> {
    match action {
        CalibrationAction::List { output } => list(ctx, output),
        CalibrationAction::Add { value } => add(ctx, *value),
        CalibrationAction::Remove { id } => remove(ctx, *id),
    }
}

fn list(ctx: &CommandContext, output: &OutputArgs) -> Result<()> {
    let store = open_store(&ctx.database)?;
    let Some(stored) = store.load_sensor()? else {
        bail!("No sensor paired");
    };
    let points = &stored.sensor.custom_calibration.points;

    let opts = ctx.opts.with_no_header(output.no_header);
    let content = match resolve_format(output.format, ctx.json, &ctx.config) {
        OutputFormat::Json => format_calibration_json(points, &opts)?,
        OutputFormat::Csv => format_calibration_csv(points, &opts),
        OutputFormat::Text => format_calibration_text(points, &opts),
    };
    write_output(ctx.output.as_ref(), &content)
}

fn add(ctx: &CommandContext, value: f64) -> Result<()> {
    let mut store = open_store(&ctx.database)?;
    let before = restore_state(&store, &ctx.config)?;
    let Some(sensor) = &before.sensor else {
        bail!("No sensor paired");
    };
    let Some(reading) = before.latest_sensor_glucose().and_then(|g| g.raw_value) else {
        bail!("No recent sensor reading to calibrate against");
    };
    let count = sensor.custom_calibration.len();

    let id = Uuid::new_v4();
    let action = Action::AddCustomCalibration {
        id,
        value,
        at: OffsetDateTime::now_utc(),
    };
    let after = apply_offline(&mut store, &ctx.config, action)?;
    let added = after
        .sensor
        .as_ref()
        .is_some_and(|s| s.custom_calibration.len() > count);
    if !added {
        bail!("Calibration point was not recorded");
    }

    if !ctx.quiet {
        eprintln!(
            "{}",
            style::format_success(
                &format!("Calibrated {:.1} -> {:.1} mg/dL ({})", reading, value, id),
                ctx.opts.no_color
            )
        );
    }
    Ok(())
}

fn remove(ctx: &CommandContext, id: Uuid) -> Result<()> {
    let mut store = open_store(&ctx.database)?;
    let before = restore_state(&store, &ctx.config)?;
    let Some(sensor) = &before.sensor else {
        bail!("No sensor paired");
    };
    if !sensor.custom_calibration.points.iter().any(|p| p.id == id) {
        bail!("No calibration point with id {}", id);
    }

    apply_offline(&mut store, &ctx.config, Action::RemoveCustomCalibration { id })?;
    if !ctx.quiet {
        eprintln!(
            "{}",
            style::format_success(&format!("Removed calibration point {}", id), ctx.opts.no_color)
        );
    }
    Ok(())
}

pub fn cmd_blood_glucose(ctx: &CommandContext, value: i32) -> Result<()> {
    let mut store = open_store(&ctx.database)?;
    apply_offline(&mut store, &ctx.config, Action::add_blood_glucose(value))?;
    if !ctx.quiet {
        eprintln!(
            "{}",
            style::format_success(
                &format!("Recorded blood glucose {} mg/dL", value),
                ctx.opts.no_color
            )
        );
    }
    Ok(())
}

//! Status command implementation.

use anyhow::Result;
use time::{Duration, OffsetDateTime};

use cgm_store::GlucoseQuery;
use cgm_types::GlucoseType;

use crate::cli::{OutputArgs, OutputFormat};
use crate::commands::CommandContext;
use crate::config::resolve_format;
use crate::format::{StatusView, format_status_brief, format_status_json, format_status_text};
use crate::util::{open_store, write_output};

pub fn cmd_status(ctx: &CommandContext, output: &OutputArgs, brief: bool) -> Result<()> {
    let store = open_store(&ctx.database)?;
    let now = OffsetDateTime::now_utc();

    let stored = store.load_sensor()?;
    let latest = store
        .query_glucose(
            &GlucoseQuery::new()
                .glucose_type(GlucoseType::Cgm)
                .valid_only()
                .limit(1),
        )?
        .pop();
    let stats = store.stats(Some(now - Duration::hours(24)))?;

    let view = StatusView {
        unlock_count: stored.as_ref().map_or(0, |s| s.unlock_count),
        sensor: stored.map(|s| s.sensor),
        latest,
        stats,
        now,
    };

    let opts = ctx.opts.with_no_header(output.no_header);
    let content = match resolve_format(output.format, ctx.json, &ctx.config) {
        OutputFormat::Json => format_status_json(&view, &opts)?,
        OutputFormat::Text | OutputFormat::Csv if brief => format_status_brief(&view, &opts),
        OutputFormat::Text => format_status_text(&view, &opts),
        OutputFormat::Csv => anyhow::bail!("CSV output is not available for status"),
    };
    write_output(ctx.output.as_ref(), &content)
}

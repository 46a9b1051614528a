//! History command implementation.

use anyhow::{Result, bail};

use cgm_store::GlucoseQuery;
use cgm_types::GlucoseType;

use crate::cli::{GlucoseKind, HistoryArgs, OutputFormat};
use crate::commands::CommandContext;
use crate::config::resolve_format;
use crate::format::{format_history_csv, format_history_json, format_history_text};
use crate::util::{open_store, parse_datetime, write_output};

/// Build the store query for the given arguments.
pub(crate) fn build_query(args: &HistoryArgs) -> Result<GlucoseQuery> {
    let mut query = GlucoseQuery::new();

    query = match args.kind {
        GlucoseKind::Sensor => query.glucose_type(GlucoseType::Cgm),
        GlucoseKind::Blood => query.glucose_type(GlucoseType::Bgm),
        GlucoseKind::All => query,
    };
    if let Some(since) = &args.since {
        query = query.since(parse_datetime(since)?);
    }
    if let Some(until) = &args.until {
        query = query.until(parse_datetime(until)?);
    }
    if let (Some(since), Some(until)) = (query.since, query.until)
        && since > until
    {
        bail!("--since must not be after --until");
    }
    if args.limit > 0 {
        query = query.limit(args.limit);
    }
    if args.reverse {
        query = query.oldest_first();
    }
    Ok(query)
}

pub fn cmd_history(ctx: &CommandContext, args: &HistoryArgs) -> Result<()> {
    let query = build_query(args)?;
    let store = open_store(&ctx.database)?;
    let values = store.query_glucose(&query)?;

    let opts = ctx.opts.with_no_header(args.output.no_header);
    let content = match resolve_format(args.output.format, ctx.json, &ctx.config) {
        OutputFormat::Json => format_history_json(&values, &opts)?,
        OutputFormat::Csv => format_history_csv(&values, &opts),
        OutputFormat::Text => format_history_text(&values, &opts),
    };
    write_output(ctx.output.as_ref(), &content)
}

//! Simulate command implementation.
//!
//! Runs the whole acquisition pipeline against a [`VirtualSensor`]: pairing,
//! unlock, encrypted frames, calibration and persistence, on an accelerated
//! clock.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{info, warn};

use cgm_core::{
    MockTransport, Persistence, Pipeline, ScaledClock, SharedTransport, VirtualSensor,
};
use cgm_store::{GlucoseQuery, SqlitePersistence};
use cgm_types::{ConnectionState, GlucoseType};

use crate::cli::{OutputFormat, SimulateArgs};
use crate::commands::CommandContext;
use crate::format::{FormatOptions, format_event_json, format_event_text};
use crate::style;

/// Multiple of the connect timeout to wait for pairing and the first link.
const LINK_WAIT_FACTOR: u32 = 3;

/// Resolved simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plan {
    pub minutes: u32,
    pub speed: f64,
    pub seed: u64,
    pub age: u32,
    pub interval: Duration,
}

pub(crate) fn plan(ctx: &CommandContext, args: &SimulateArgs) -> Result<Plan> {
    let speed = args.speed.unwrap_or(ctx.config.simulate.speed);
    if !(speed.is_finite() && speed > 0.0) {
        bail!("--speed must be positive");
    }
    if args.minutes == 0 {
        bail!("--minutes must be at least 1");
    }
    let base = Duration::from_secs(ctx.config.connection.reading_interval_secs);
    Ok(Plan {
        minutes: args.minutes,
        speed,
        seed: args.seed.unwrap_or(ctx.config.simulate.seed),
        age: args.age.unwrap_or(ctx.config.simulate.start_age),
        interval: base.div_f64(speed),
    })
}

/// Start of the simulated timeline.
///
/// An accelerated run stores readings ahead of the wall clock, so a later run
/// continues one minute after the newest stored reading instead of replaying
/// timestamps the pipeline would drop as stale.
pub(crate) fn clock_origin(now: OffsetDateTime, latest: Option<OffsetDateTime>) -> OffsetDateTime {
    match latest {
        Some(latest) if latest + time::Duration::MINUTE > now => latest + time::Duration::MINUTE,
        _ => now,
    }
}

fn event_sink(ctx: &CommandContext) -> Result<Box<dyn Write + Send>> {
    match &ctx.output {
        Some(path) => Ok(Box::new(File::create(path).with_context(|| {
            format!("Failed to create {}", path.display())
        })?)),
        None => Ok(Box::new(io::stdout())),
    }
}

pub async fn cmd_simulate(ctx: &CommandContext, args: &SimulateArgs) -> Result<()> {
    let plan = plan(ctx, args)?;
    let format = match args.format.or(ctx.json.then_some(OutputFormat::Json)) {
        Some(OutputFormat::Csv) => bail!("simulate prints events as text or json"),
        Some(format) => format,
        None => OutputFormat::Text,
    };

    let mut sensor = VirtualSensor::new(plan.seed).with_age(plan.age);
    let transport = Arc::new(MockTransport::with_default_name());
    sensor.install(&transport).await;

    let backend = if args.ephemeral {
        None
    } else {
        let backend = SqlitePersistence::open(&ctx.database)
            .with_context(|| format!("Failed to open database {}", ctx.database.display()))?
            .restore_window(time::Duration::try_from(ctx.config.horizon())?)
            .retention(
                ctx.config
                    .retention()
                    .map(time::Duration::try_from)
                    .transpose()?,
            );
        Some(Arc::new(backend))
    };

    let latest = match &backend {
        Some(backend) => backend
            .store()
            .lock()
            .await
            .query_glucose(&GlucoseQuery::new().glucose_type(GlucoseType::Cgm).limit(1))
            .context("Failed to read stored history")?
            .first()
            .map(|value| value.timestamp),
        None => None,
    };
    let origin = clock_origin(OffsetDateTime::now_utc(), latest);
    if latest.is_some_and(|at| at >= OffsetDateTime::now_utc()) {
        info!(%origin, "Continuing after stored history");
    }

    let mut builder = Pipeline::builder(transport.clone() as SharedTransport)
        .calibration(ctx.config.calibration_config())
        .connection(ctx.config.connection_config().expected_interval(plan.interval))
        .store(ctx.config.store_config())
        .clock(Arc::new(ScaledClock::starting_at(origin, plan.speed)));
    if let Some(backend) = &backend {
        builder = builder.persistence(backend.clone());
    }

    let pipeline = builder.start().await.context("Failed to start pipeline")?;
    let printer = spawn_printer(pipeline.subscribe(), event_sink(ctx)?, format, ctx.opts);

    let state = pipeline.state();
    match &state.sensor {
        Some(paired) if paired.uuid == *sensor.uid() => {
            info!(serial = %paired.serial, "Resuming paired sensor");
            pipeline.connect()?;
        }
        Some(paired) => {
            info!(serial = %paired.serial, "Replacing paired sensor");
            pipeline.reset_sensor()?;
            pipeline.pair()?;
        }
        None => pipeline.pair()?,
    }

    let spinner = style::operation_spinner(
        "Pairing with virtual sensor...",
        ctx.quiet || format == OutputFormat::Json,
    );
    let link_wait = ctx.config.connection_config().connect_timeout * LINK_WAIT_FACTOR;
    let linked = timeout(
        link_wait,
        pipeline.store().wait_for(|s| {
            s.connection_state == ConnectionState::Connected
                || (s.connection_error_is_critical
                    && s.connection_state == ConnectionState::Disconnected)
        }),
    )
    .await;
    spinner.finish_and_clear();

    let state = match linked {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => bail!("Pipeline stopped: {}", e),
        Err(_) => bail!("Timed out waiting for the sensor link"),
    };
    if state.connection_state != ConnectionState::Connected {
        bail!(
            "Could not connect: {}",
            state.connection_error.as_deref().unwrap_or("unknown error")
        );
    }

    let mut streamed = 0;
    let mut ticker = tokio::time::interval(plan.interval);
    ticker.tick().await;
    while streamed < plan.minutes {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                for chunk in sensor.tick()? {
                    transport.push_chunk(chunk);
                }
                streamed += 1;
            }
        }
    }

    pipeline.disconnect()?;
    let _ = timeout(
        Duration::from_secs(2),
        pipeline
            .store()
            .wait_for(|s| s.connection_state == ConnectionState::Disconnected),
    )
    .await;

    let final_state = pipeline.state();
    pipeline.shutdown();
    if let Some(backend) = &backend {
        backend
            .save(&final_state.persisted())
            .await
            .context("Failed to save final state")?;
    }
    drop(pipeline);
    if timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Event printer did not finish");
    }

    if !ctx.quiet && format == OutputFormat::Text {
        let latest = final_state
            .latest_sensor_glucose()
            .and_then(|value| value.glucose_value);
        eprintln!(
            "{}",
            style::format_success(
                &format!(
                    "Streamed {} minute(s); {} value(s) in memory; latest {}",
                    streamed,
                    final_state.glucose_values.len(),
                    style::format_glucose_colored(latest, ctx.opts.no_color)
                ),
                ctx.opts.no_color
            )
        );
    }
    Ok(())
}

fn spawn_printer(
    mut events: cgm_core::EventReceiver,
    mut sink: Box<dyn Write + Send>,
    format: OutputFormat,
    opts: FormatOptions,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event output fell behind; skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let line = match format {
                OutputFormat::Json => format_event_json(&event).ok(),
                _ => format_event_text(&event, &opts),
            };
            if let Some(line) = line
                && let Err(e) = sink.write_all(line.as_bytes()).and_then(|_| sink.flush())
            {
                warn!("Failed to write event: {}", e);
                break;
            }
        }
    })
}

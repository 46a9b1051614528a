use std::io;

use anyhow::{Result, bail};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use cgm_cli::cli::{Cli, Commands};
use cgm_cli::commands::{
    CommandContext, cmd_blood_glucose, cmd_calibration, cmd_config, cmd_history, cmd_reset,
    cmd_simulate, cmd_status,
};
use cgm_cli::config::Config;
use cgm_cli::format::FormatOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle completions command early (before tracing init)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "cgm", &mut io::stdout());
        return Ok(());
    }

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = Config::load();
    // Config commands must work on an invalid file
    if !matches!(cli.command, Commands::Config { .. })
        && let Err(errors) = config.validate()
    {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!(
            "Invalid configuration in {}:\n  {}",
            Config::path().display(),
            details.join("\n  ")
        );
    }

    let ctx = CommandContext {
        database: config.database_path(cli.database.as_deref()),
        output: cli.output.clone(),
        json: cli.json,
        quiet: cli.quiet,
        opts: FormatOptions::new(cli.no_color || config.no_color).with_compact(cli.compact),
        config,
    };

    match &cli.command {
        Commands::Simulate(args) => cmd_simulate(&ctx, args).await,
        Commands::Status { output, brief } => cmd_status(&ctx, output, *brief),
        Commands::History(args) => cmd_history(&ctx, args),
        Commands::Calibration { action } => cmd_calibration(&ctx, action),
        Commands::BloodGlucose { value } => cmd_blood_glucose(&ctx, *value),
        Commands::Reset { yes } => cmd_reset(&ctx, *yes),
        Commands::Config { action } => cmd_config(&ctx, action),
        Commands::Completions { .. } => {
            // Already handled above
            unreachable!()
        }
    }
}

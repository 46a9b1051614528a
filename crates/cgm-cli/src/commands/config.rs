//! Config command implementation.

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::commands::CommandContext;
use crate::config::Config;
use crate::style;
use crate::util::write_output;

pub fn cmd_config(ctx: &CommandContext, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let content =
                toml::to_string_pretty(&ctx.config).context("Failed to serialize config")?;
            let mut output = format!("# {}\n{}", Config::path().display(), content);
            output.push_str(&format!(
                "\n# database in use: {}\n",
                ctx.database.display()
            ));
            write_output(ctx.output.as_ref(), &output)
        }
        ConfigAction::Path => {
            write_output(ctx.output.as_ref(), &format!("{}\n", Config::path().display()))
        }
        ConfigAction::Init { force } => {
            let path = Config::path();
            if path.exists() && !force {
                bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save_to(&path)?;
            if !ctx.quiet {
                eprintln!(
                    "{}",
                    style::format_success(
                        &format!("Wrote {}", path.display()),
                        ctx.opts.no_color
                    )
                );
            }
            Ok(())
        }
    }
}

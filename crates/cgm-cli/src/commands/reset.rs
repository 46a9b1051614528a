//! Reset command implementation.

use anyhow::{Result, bail};
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;

use cgm_core::Action;

use crate::commands::CommandContext;
use crate::style;
use crate::util::{apply_offline, open_store};

pub fn cmd_reset(ctx: &CommandContext, yes: bool) -> Result<()> {
    let mut store = open_store(&ctx.database)?;
    let Some(stored) = store.load_sensor()? else {
        if !ctx.quiet {
            eprintln!("{}", style::format_info("No sensor paired", ctx.opts.no_color));
        }
        return Ok(());
    };

    if !yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Forget sensor {}? Glucose history is kept.",
                stored.sensor.serial
            ))
            .default(false)
            .interact()
            .map_err(|_| anyhow::anyhow!("Confirmation required; pass --yes to reset"))?;
        if !confirmed {
            bail!("Reset cancelled");
        }
    }

    apply_offline(&mut store, &ctx.config, Action::ResetSensor)?;
    if !ctx.quiet {
        eprintln!(
            "{}",
            style::format_success(
                &format!("Sensor {} forgotten", stored.sensor.serial),
                ctx.opts.no_color
            )
        );
    }
    Ok(())
}

//! Configuration view and validation commands: `forgeflow config`, `forgeflow statuses`.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use super::load_config;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = load_config(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No flow.toml at {}; showing defaults", config_path.display());
            }
            println!("# Effective values include FORGEFLOW_* overrides");
            println!();
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            // A table that cannot be built is an error, not a warning.
            config.status_table()?;

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}

pub fn cmd_statuses(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let table = config.status_table()?;

    println!(
        "{:>3}  {:<28} {:<16} {:<12} {}",
        "#", "STATUS", "PHASE", "STAGE", "FLAGS"
    );
    for (i, entry) in table.entries().iter().enumerate() {
        let mut flags = Vec::new();
        if entry.cascade {
            flags.push("cascade");
        }
        if entry.rollup {
            flags.push("rollup");
        }
        println!(
            "{:>3}  {:<28} {:<16} {:<12} {}",
            i + 1,
            entry.name,
            entry.phase.map(|p| p.as_str()).unwrap_or("-"),
            entry.stage.as_str(),
            flags.join(",")
        );
    }
    Ok(())
}

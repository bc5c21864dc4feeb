//! Project bootstrap: `forgeflow init`.

use std::path::Path;

use anyhow::Result;
use forgeflow::config::starter_config;

use super::open_db;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("flow.toml already exists at {}", config_path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    let config = starter_config();
    config.save(config_path)?;
    open_db(&config)?;

    println!("Created {}", config_path.display());
    println!("Database: {}", config.database.path.display());
    println!();
    println!("Next steps:");
    println!("  - set [tracker] base_url and token (or FORGEFLOW_TRACKER_URL / FORGEFLOW_TRACKER_TOKEN)");
    println!("  - adjust [[statuses]] to match your tracker's workflow");
    println!("  - run 'forgeflow serve' and point the tracker webhook at /webhooks/tracker");
    Ok(())
}

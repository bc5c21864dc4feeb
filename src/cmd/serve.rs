//! Webhook server: `forgeflow serve`.

use std::path::Path;

use anyhow::Result;

use super::{load_config, open_engine};

pub async fn cmd_serve(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let engine = open_engine(&config)?;
    tracing::info!(
        db = %config.database.path.display(),
        statuses = engine.services.table.len(),
        "engine ready"
    );
    forgeflow::server::start_server(&config.server, engine).await
}

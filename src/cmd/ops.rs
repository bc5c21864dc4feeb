//! Operator commands: `forgeflow replay`, `forgeflow cancel`, `forgeflow sweep`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use forgeflow::router::RouteOutcome;

use super::{load_config, open_engine};

/// Route one recorded event through a local engine. Without `wait` the
/// process exits right after routing; a started run stays `running` in the
/// store and is picked up by the next `serve`.
pub async fn cmd_replay(config_path: &Path, event: &Path, wait: bool, timeout_secs: u64) -> Result<()> {
    let raw = std::fs::read(event).with_context(|| format!("Failed to read event file {}", event.display()))?;
    let config = load_config(config_path)?;
    let mut engine = open_engine(&config)?;
    let handles = engine.start(false).await?;

    let outcome = engine.router.route_raw(&raw).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if wait && let RouteOutcome::Started { run_id, .. } = &outcome {
        let settled = engine
            .runtime
            .wait_settled(run_id, Duration::from_secs(timeout_secs))
            .await?;
        match settled {
            Some(run) => println!(
                "run {} is {}{}",
                run.id,
                run.state.as_str(),
                run.error.map(|e| format!(": {}", e)).unwrap_or_default()
            ),
            None => println!("run {} disappeared", run_id),
        }
    }

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

pub async fn cmd_cancel(config_path: &Path, run_id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config)?;

    let id = run_id.to_string();
    let Some(run) = engine.services.db.call(move |db| db.get_run(&id)).await? else {
        bail!("Run {} not found", run_id);
    };
    if engine.runtime.cancel(run_id).await? {
        println!("Cancelled run {}", run_id);
    } else {
        println!("Run {} is already {}", run_id, run.state.as_str());
    }
    Ok(())
}

/// Expire overdue questions. Their runs resume on the next `serve`.
pub async fn cmd_sweep(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config)?;

    let expired = engine.services.broker.expire_overdue(Utc::now()).await?;
    if expired.is_empty() {
        println!("No overdue questions.");
    } else {
        for q in &expired {
            println!("expired {} (run {}, step {})", q.id, q.run_id, q.step_name);
        }
        println!("{} question(s) expired", expired.len());
    }
    Ok(())
}

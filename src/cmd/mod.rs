//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                      |
//! |-----------|---------------------------------------|
//! | `serve`   | `Serve`                               |
//! | `project` | `Init`                                |
//! | `config`  | `Config`, `Statuses`                  |
//! | `inspect` | `Runs`, `Questions`                   |
//! | `ops`     | `Replay`, `Cancel`, `Sweep`           |

pub mod config;
pub mod inspect;
pub mod ops;
pub mod project;
pub mod serve;

pub use config::{cmd_config, cmd_statuses};
pub use inspect::{cmd_questions, cmd_runs};
pub use ops::{cmd_cancel, cmd_replay, cmd_sweep};
pub use project::cmd_init;
pub use serve::cmd_serve;

use std::path::Path;

use anyhow::{Context, Result};
use forgeflow::collab::Collaborators;
use forgeflow::config::FlowConfig;
use forgeflow::db::DbHandle;
use forgeflow::engine::Engine;

/// File, then `FORGEFLOW_*` environment.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    let mut config = FlowConfig::load_or_default(path)?;
    config.apply_env()?;
    Ok(config)
}

pub fn open_db(config: &FlowConfig) -> Result<DbHandle> {
    DbHandle::open(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))
}

/// Wire an engine over the configured store and production collaborators.
pub fn open_engine(config: &FlowConfig) -> Result<Engine> {
    let db = open_db(config)?;
    let collab = Collaborators::from_config(config)?;
    Engine::build(config, db, collab)
}

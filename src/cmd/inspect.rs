//! Read-only store inspection: `forgeflow runs`, `forgeflow questions`.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use forgeflow::models::QuestionState;

use super::{load_config, open_db};

pub fn cmd_runs(config_path: &Path, item: Option<&str>, limit: i64) -> Result<()> {
    let config = load_config(config_path)?;
    let db = open_db(&config)?;
    let runs = {
        let db = db.lock_sync()?;
        match item {
            Some(item_id) => db.runs_for_item(item_id)?,
            None => db.recent_runs(limit)?,
        }
    };

    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    println!(
        "{:<48} {:<16} {:<16} {:<10} {:>4}  {}",
        "RUN", "ITEM", "PHASE", "STATE", "STEP", "UPDATED"
    );
    for run in runs {
        println!(
            "{:<48} {:<16} {:<16} {:<10} {:>4}  {}",
            run.id,
            run.item_id,
            run.phase.as_str(),
            run.state.as_str(),
            run.current_step,
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

pub fn cmd_questions(config_path: &Path, state: &str) -> Result<()> {
    let state = QuestionState::from_str(state).map_err(|e| anyhow!(e))?;
    let config = load_config(config_path)?;
    let db = open_db(&config)?;
    let questions = db.lock_sync()?.questions_in_state(state)?;

    if questions.is_empty() {
        println!("No {} questions.", state.as_str());
        return Ok(());
    }

    for q in questions {
        println!("{}  [{}] {}", q.id, q.kind.as_str(), q.prompt);
        println!(
            "    run {} / step {} / comment {} / deadline {}",
            q.run_id,
            q.step_name,
            q.comment_id,
            q.deadline.format("%Y-%m-%d %H:%M")
        );
        for option in &q.options {
            println!("    OPTION:{}  {}", option.id, option.label);
        }
    }
    Ok(())
}

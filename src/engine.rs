//! Composition root: wires the store, collaborators, broker, runtime and
//! router together and owns the background loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::HumanSignalBroker;
use crate::collab::Collaborators;
use crate::config::FlowConfig;
use crate::db::DbHandle;
use crate::phases::PhaseRegistry;
use crate::pipeline::Services;
use crate::router::TriggerRouter;
use crate::runtime::Runtime;
use crate::status::StatusWriter;

pub struct Engine {
    pub services: Arc<Services>,
    pub runtime: Arc<Runtime>,
    pub router: Arc<TriggerRouter>,
    signals: Option<mpsc::UnboundedReceiver<String>>,
    settled: Option<mpsc::UnboundedReceiver<String>>,
    sweep_interval: Duration,
}

impl Engine {
    pub fn build(config: &FlowConfig, db: DbHandle, collab: Collaborators) -> Result<Self> {
        let table = Arc::new(config.status_table().context("Invalid status table")?);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();

        let services = Arc::new(Services {
            status: StatusWriter::new(db.clone(), collab.tracker.clone()),
            broker: HumanSignalBroker::new(
                db.clone(),
                collab.tracker.clone(),
                signal_tx,
                config.questions.timeout(),
            ),
            db,
            table,
            collab,
            flags: config.features.clone(),
            pipeline: config.pipeline.clone(),
        });
        let runtime = Arc::new(Runtime::new(
            services.clone(),
            PhaseRegistry::standard(),
            Some(settled_tx),
        ));
        let router = Arc::new(TriggerRouter::new(
            runtime.clone(),
            config.tracker.bot_user_id.clone(),
        ));

        Ok(Self {
            services,
            runtime,
            router,
            signals: Some(signal_rx),
            settled: Some(settled_rx),
            sweep_interval: config.questions.sweep_interval(),
        })
    }

    /// Recover interrupted runs and spawn the signal and follow-up loops,
    /// plus the question sweeper when `sweeper` is set. Only the first call
    /// spawns anything.
    pub async fn start(&mut self, sweeper: bool) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        if let Some(signals) = self.signals.take() {
            handles.push(self.runtime.spawn_signal_loop(signals));
        }
        if let Some(settled) = self.settled.take() {
            handles.push(spawn_settled_loop(self.router.clone(), self.services.db.clone(), settled));
        }
        if sweeper {
            handles.push(self.runtime.spawn_sweeper(self.sweep_interval));
        }

        let recovered = self.runtime.recover().await.context("Failed to recover runs")?;
        if recovered > 0 {
            tracing::info!(recovered, "resumed runs from a previous process");
        }
        Ok(handles)
    }
}

/// Re-evaluate items whose run just completed. Their final status was
/// written by us, so the tracker's echo is dropped and rollup has to be
/// driven from here.
fn spawn_settled_loop(
    router: Arc<TriggerRouter>,
    db: DbHandle,
    mut settled: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item_id) = settled.recv().await {
            let id = item_id.clone();
            let item = match db.call(move |db| db.get_item(&id)).await {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(item_id = %item_id, error = %e, "failed to load settled item");
                    continue;
                }
            };
            match router.evaluate(item).await {
                Ok(outcome) => tracing::debug!(item_id = %item_id, outcome = ?outcome, "settled item evaluated"),
                Err(e) => tracing::error!(item_id = %item_id, error = %e, "settled item evaluation failed"),
            }
        }
    })
}

use std::sync::Arc;

use anyhow::Result;

use crate::collab::IssueTracker;
use crate::db::DbHandle;

/// Writes item statuses to the store and mirrors them to the tracker.
///
/// The store is the source of truth for cascade and rollup decisions. The
/// tracker echoes every status we write back as a webhook; the router sees the
/// stored status already matches and drops the echo.
#[derive(Clone)]
pub struct StatusWriter {
    db: DbHandle,
    tracker: Arc<dyn IssueTracker>,
}

impl StatusWriter {
    pub fn new(db: DbHandle, tracker: Arc<dyn IssueTracker>) -> Self {
        Self { db, tracker }
    }

    /// Set a status unconditionally. The tracker is updated even when the
    /// stored status did not change, so a lost mirror write heals on retry.
    pub async fn set(&self, item_id: &str, status: &str) -> Result<()> {
        let (id, s) = (item_id.to_string(), status.to_string());
        let changed = self.db.call(move |db| db.set_status(&id, &s)).await?;
        tracing::debug!(item_id, status, changed, "status set");
        self.tracker.update_status(item_id, status).await
    }

    /// Advance a status only if it still equals `expected`. Returns whether
    /// this writer won; the tracker is only touched on success.
    ///
    /// Once the store moved the transition has happened. A failed tracker
    /// mirror is logged and left for the next write of this item to repair,
    /// so callers still run their follow-up for a moved item.
    pub async fn advance(&self, item_id: &str, expected: &str, status: &str) -> Result<bool> {
        let (id, e, s) = (item_id.to_string(), expected.to_string(), status.to_string());
        let won = self
            .db
            .call(move |db| db.compare_and_set_status(&id, &e, &s))
            .await?;
        if won {
            tracing::info!(item_id, from = expected, to = status, "status advanced");
            if let Err(e) = self.tracker.update_status(item_id, status).await {
                tracing::warn!(item_id, status, error = %e, "tracker status mirror failed");
            }
        }
        Ok(won)
    }
}

//! Cascade and rollup across a parent/child tree of work items.
//!
//! Cascade pushes a parent's status down to its children, each one
//! independently, and lets the caller evaluate every moved child as if its
//! own status had just changed. Rollup is the reverse AND-join: a parent moves
//! forward only once every child has reached the rollup status.
//!
//! Every status write is a compare-and-set against the status that was read,
//! so concurrent cascades and sibling rollups cannot overwrite each other.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;

use crate::db::DbHandle;
use crate::models::WorkItem;
use crate::status::{StatusTable, StatusWriter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The child is already at or past the target.
    AtOrPastTarget,
    /// The child's status is not in the table, so it cannot be ordered.
    UnknownStatus,
    TransitionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChild {
    pub id: String,
    pub status: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Summary of one cascade. `cascaded.len() + skipped.len() == children_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeResult {
    pub parent_id: String,
    pub target_status: String,
    pub children_count: usize,
    pub cascaded: Vec<String>,
    pub skipped: Vec<SkippedChild>,
}

impl CascadeResult {
    pub fn skipped_ids(&self) -> Vec<String> {
        self.skipped.iter().map(|s| s.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupResult {
    pub parent_id: String,
    pub changed: bool,
    pub from: String,
    pub to: Option<String>,
    /// Siblings that have not reached the rollup status yet.
    pub pending_siblings: usize,
}

enum ChildOutcome {
    Cascaded(String),
    Skipped(SkippedChild),
}

#[derive(Clone)]
pub struct Propagator {
    db: DbHandle,
    table: Arc<StatusTable>,
    status: StatusWriter,
}

impl Propagator {
    pub fn new(db: DbHandle, table: Arc<StatusTable>, status: StatusWriter) -> Self {
        Self { db, table, status }
    }

    /// Move every child strictly before `target` to `target`, then hand each
    /// moved child to `evaluate`. Children are processed concurrently; an
    /// error on one child is recorded against it and never stops the rest.
    pub async fn cascade<F, Fut, T>(&self, parent: &WorkItem, target: &str, evaluate: F) -> Result<CascadeResult>
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let parent_id = parent.id.clone();
        let children = self.db.call(move |db| db.children(&parent_id)).await?;
        let children_count = children.len();
        let target = self
            .table
            .canonical(target)
            .unwrap_or(target)
            .to_string();

        let outcomes = join_all(
            children
                .into_iter()
                .map(|child| self.cascade_child(child, &target, &evaluate)),
        )
        .await;

        let mut result = CascadeResult {
            parent_id: parent.id.clone(),
            target_status: target.clone(),
            children_count,
            cascaded: Vec::new(),
            skipped: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                ChildOutcome::Cascaded(id) => result.cascaded.push(id),
                ChildOutcome::Skipped(skipped) => result.skipped.push(skipped),
            }
        }
        tracing::info!(
            parent_id = %parent.id,
            target = %target,
            children = children_count,
            cascaded = result.cascaded.len(),
            skipped = result.skipped.len(),
            "cascade finished"
        );
        Ok(result)
    }

    async fn cascade_child<F, Fut, T>(&self, child: WorkItem, target: &str, evaluate: &F) -> ChildOutcome
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let skip = |reason: SkipReason| {
            ChildOutcome::Skipped(SkippedChild {
                id: child.id.clone(),
                status: child.status.clone(),
                reason,
            })
        };

        if !self.table.contains(&child.status) {
            return skip(SkipReason::UnknownStatus);
        }
        if !self.table.is_before(&child.status, target) {
            return skip(SkipReason::AtOrPastTarget);
        }

        match self.status.advance(&child.id, &child.status, target).await {
            Ok(true) => {}
            Ok(false) => {
                return skip(SkipReason::TransitionFailed(
                    "status changed concurrently".to_string(),
                ));
            }
            Err(e) => {
                tracing::warn!(child_id = %child.id, error = %e, "cascade transition failed");
                return skip(SkipReason::TransitionFailed(e.to_string()));
            }
        }

        let mut moved = child.clone();
        moved.status = target.to_string();
        if let Err(e) = evaluate(moved).await {
            // The child did move; a failing follow-up does not undo that.
            tracing::warn!(child_id = %child.id, error = %e, "cascaded child evaluation failed");
        }
        ChildOutcome::Cascaded(child.id.clone())
    }

    /// Advance `child`'s parent once every sibling reached the child's
    /// rollup status. Returns `None` when the child has no parent or its
    /// status is not rollup-eligible.
    pub async fn rollup(&self, child: &WorkItem) -> Result<Option<RollupResult>> {
        let Some(parent_id) = child.parent_id.clone() else {
            return Ok(None);
        };
        let Some(entry) = self.table.get(&child.status).filter(|e| e.rollup) else {
            return Ok(None);
        };
        let reached = entry.name.clone();

        let id = parent_id.clone();
        let Some(parent) = self.db.call(move |db| db.get_item(&id)).await? else {
            tracing::warn!(child_id = %child.id, parent_id = %parent_id, "rollup parent is unknown");
            return Ok(None);
        };
        let id = parent_id.clone();
        let siblings = self.db.call(move |db| db.children(&id)).await?;

        let pending_siblings = siblings
            .iter()
            .filter(|s| !self.table.has_reached(&s.status, &reached))
            .count();
        let mut result = RollupResult {
            parent_id: parent.id.clone(),
            changed: false,
            from: parent.status.clone(),
            to: None,
            pending_siblings,
        };
        if pending_siblings > 0 {
            tracing::debug!(parent_id = %parent.id, pending_siblings, "rollup waiting on siblings");
            return Ok(Some(result));
        }

        let Some(target) = self.table.rollup_target(&reached).map(|e| e.name.clone()) else {
            return Ok(Some(result));
        };
        result.to = Some(target.clone());
        if !self.table.is_before(&parent.status, &target) {
            tracing::debug!(parent_id = %parent.id, status = %parent.status, target = %target, "parent already at or past rollup target");
            return Ok(Some(result));
        }

        result.changed = self.status.advance(&parent.id, &parent.status, &target).await?;
        if result.changed {
            tracing::info!(parent_id = %parent.id, from = %parent.status, to = %target, "rolled up parent");
        }
        Ok(Some(result))
    }
}

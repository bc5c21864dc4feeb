//! Status table: the ordered lifecycle of a work item.
//!
//! Every status a tracker can report is an entry in a single ordered table.
//! Each entry names the phase it belongs to, the stage it represents inside
//! that phase, and whether it is eligible for cascade (parent → children) or
//! rollup (children → parent). The table is configuration, loaded from
//! `[[statuses]]` in `flow.toml`, and read-only at runtime.
//!
//! Ordering matters: cascade only moves a child *forward* and rollup only
//! advances a parent to a status later than its current one.

mod writer;

pub use writer::StatusWriter;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// The four delivery phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refinement,
    UserStory,
    TechnicalPlan,
    CodeGeneration,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Refinement,
        Phase::UserStory,
        Phase::TechnicalPlan,
        Phase::CodeGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refinement => "refinement",
            Self::UserStory => "user_story",
            Self::TechnicalPlan => "technical_plan",
            Self::CodeGeneration => "code_generation",
        }
    }

    /// Human-facing name used in status names and comments.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Refinement => "Refinement",
            Self::UserStory => "User Story",
            Self::TechnicalPlan => "Technical Plan",
            Self::CodeGeneration => "Code Generation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "refinement" => Ok(Self::Refinement),
            "user_story" | "user_stories" => Ok(Self::UserStory),
            "technical_plan" | "tech_plan" => Ok(Self::TechnicalPlan),
            "code_generation" | "codegen" => Ok(Self::CodeGeneration),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Where inside a phase a status sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not owned by any phase run (backlog, done, manual states).
    #[default]
    Idle,
    /// Entering this status starts the phase.
    Trigger,
    InProgress,
    Ready,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Trigger => "trigger",
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// One row of the status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub stage: Stage,
    /// A parent entering this status cascades it to its children.
    #[serde(default)]
    pub cascade: bool,
    /// A child reaching this status may roll its parent forward.
    #[serde(default)]
    pub rollup: bool,
}

impl StatusEntry {
    pub fn new(name: &str, phase: Option<Phase>, stage: Stage) -> Self {
        Self {
            name: name.to_string(),
            phase,
            stage,
            cascade: false,
            rollup: false,
        }
    }

    fn cascading(mut self) -> Self {
        self.cascade = true;
        self
    }

    fn rolling_up(mut self) -> Self {
        self.rollup = true;
        self
    }

    pub fn is_trigger(&self) -> bool {
        self.stage == Stage::Trigger && self.phase.is_some()
    }

    /// The phase this status starts, if it is a trigger status.
    pub fn trigger_phase(&self) -> Option<Phase> {
        if self.is_trigger() { self.phase } else { None }
    }
}

/// Ordered, case-insensitive lookup over status entries.
#[derive(Debug, Clone)]
pub struct StatusTable {
    entries: Vec<StatusEntry>,
    index: HashMap<String, usize>,
}

impl StatusTable {
    /// Build a table, rejecting empty tables and duplicate names.
    pub fn new(entries: Vec<StatusEntry>) -> Result<Self> {
        if entries.is_empty() {
            bail!("Status table must contain at least one status");
        }
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let key = Self::key(&entry.name);
            if key.is_empty() {
                bail!("Status at position {} has an empty name", position);
            }
            if index.insert(key, position).is_some() {
                bail!("Duplicate status '{}' in status table", entry.name);
            }
        }
        Ok(Self { entries, index })
    }

    fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StatusEntry> {
        self.position(name).map(|p| &self.entries[p])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&Self::key(name))
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(&Self::key(name)).copied()
    }

    /// Canonical spelling of a status name as written in the table.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.name.as_str())
    }

    /// True when `status` sits strictly before `target`. Unknown statuses are
    /// never "before" anything.
    pub fn is_before(&self, status: &str, target: &str) -> bool {
        match (self.position(status), self.position(target)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// True when `status` is at or past `target` and is not a failure status.
    pub fn has_reached(&self, status: &str, target: &str) -> bool {
        match (self.position(status), self.position(target)) {
            (Some(a), Some(b)) => a >= b && self.entries[a].stage != Stage::Failed,
            _ => false,
        }
    }

    /// First status in the table for a phase/stage pair.
    pub fn status_for(&self, phase: Phase, stage: Stage) -> Option<&StatusEntry> {
        self.entries
            .iter()
            .find(|e| e.phase == Some(phase) && e.stage == stage)
    }

    /// The status a parent advances to once all children reached `status`:
    /// the next entry after it that is not a failure status.
    pub fn rollup_target(&self, status: &str) -> Option<&StatusEntry> {
        let position = self.position(status)?;
        self.entries[position + 1..]
            .iter()
            .find(|e| e.stage != Stage::Failed)
    }

    /// Human-readable warnings about an incomplete table.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for phase in Phase::ALL {
            for (stage, label) in [
                (Stage::Trigger, "trigger"),
                (Stage::InProgress, "in-progress"),
                (Stage::Ready, "ready"),
                (Stage::Failed, "failed"),
            ] {
                if self.status_for(phase, stage).is_none() {
                    warnings.push(format!("Phase {} has no {} status", phase, label));
                }
            }
        }
        let mut seen_rollup_phases = HashSet::new();
        for entry in &self.entries {
            if entry.rollup && self.rollup_target(&entry.name).is_none() {
                warnings.push(format!(
                    "Rollup status '{}' is last in the table; parents can never advance",
                    entry.name
                ));
            }
            if entry.rollup
                && let Some(phase) = entry.phase
                && !seen_rollup_phases.insert(phase)
            {
                warnings.push(format!("Phase {} has more than one rollup status", phase));
            }
            if entry.cascade && entry.stage == Stage::Failed {
                warnings.push(format!(
                    "Failure status '{}' is marked cascade-eligible",
                    entry.name
                ));
            }
        }
        warnings
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        // Built-in names are unique by construction.
        let entries = default_entries();
        let index = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (Self::key(&entry.name), position))
            .collect();
        Self { entries, index }
    }
}

/// The built-in lifecycle used when `flow.toml` declares no statuses.
pub fn default_entries() -> Vec<StatusEntry> {
    use Stage::*;
    let mut entries = vec![StatusEntry::new("Backlog", None, Idle)];
    for (phase, trigger) in [
        (Phase::Refinement, "Needs Refinement"),
        (Phase::UserStory, "Write User Stories"),
        (Phase::TechnicalPlan, "Plan Technical Approach"),
        (Phase::CodeGeneration, "Generate Code"),
    ] {
        let name = phase.display_name();
        entries.push(StatusEntry::new(trigger, Some(phase), Trigger).cascading());
        entries.push(StatusEntry::new(
            &format!("{} In Progress", name),
            Some(phase),
            InProgress,
        ));
        entries.push(
            StatusEntry::new(&format!("{} Ready", name), Some(phase), Ready).rolling_up(),
        );
        entries.push(StatusEntry::new(
            &format!("{} Failed", name),
            Some(phase),
            Failed,
        ));
    }
    entries.push(StatusEntry::new("Done", None, Idle));
    entries
}

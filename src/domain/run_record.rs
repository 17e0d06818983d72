//! Run records and the stage state machine
//!
//! A RunRecord is one attempt of one stage for one run date. The ledger
//! enforces at most one Running record per (run_date, stage); Succeeded is
//! terminal and only superseded by an explicit forced re-run that itself
//! succeeds.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::artifact::ArtifactRef;
use crate::id::now_ms;

/// The four ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Select,
    Generate,
    Audit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Select => "select",
            Stage::Generate => "generate",
            Stage::Audit => "audit",
        }
    }

    /// Parse a stage name; invalid names are a caller contract violation.
    pub fn parse(s: &str) -> Option<Stage> {
        match s.to_lowercase().as_str() {
            "ingest" => Some(Stage::Ingest),
            "select" => Some(Stage::Select),
            "generate" => Some(Stage::Generate),
            "audit" => Some(Stage::Audit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    /// Returns true if the attempt reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

/// Depth of analysis requested for SELECT; persisted so audits are
/// mode-aware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Lite,
    Full,
}

impl AnalysisMode {
    pub fn parse(s: &str) -> Option<AnalysisMode> {
        match s.to_lowercase().as_str() {
            "lite" => Some(AnalysisMode::Lite),
            "full" => Some(AnalysisMode::Full),
            _ => None,
        }
    }
}

/// One attempt of one stage for one run date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Logical date the run belongs to, not wall-clock execution time
    pub run_date: NaiveDate,

    pub stage: Stage,

    /// Monotonically increasing per (run_date, stage)
    pub attempt_id: u32,

    pub state: RunState,

    /// Ordered opaque references to produced outputs
    pub artifact_refs: Vec<ArtifactRef>,

    /// Analysis mode this attempt ran under, where applicable
    pub mode: Option<AnalysisMode>,

    /// Human-readable failure cause
    pub cause: Option<String>,

    /// Unix timestamp in milliseconds
    pub started_at: i64,

    pub finished_at: Option<i64>,
}

impl RunRecord {
    /// Begin a new Running attempt.
    pub fn begin(run_date: NaiveDate, stage: Stage, attempt_id: u32, mode: Option<AnalysisMode>) -> Self {
        Self {
            run_date,
            stage,
            attempt_id,
            state: RunState::Running,
            artifact_refs: vec![],
            mode,
            cause: None,
            started_at: now_ms(),
            finished_at: None,
        }
    }

    /// Ledger key: `{run_date}/{stage}/{attempt_id}`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.run_date, self.stage, self.attempt_id)
    }

    /// True when the record has been Running longer than the timeout,
    /// which recovery treats as a crashed attempt.
    pub fn is_stale(&self, staleness_timeout_ms: i64) -> bool {
        self.state == RunState::Running && now_ms().saturating_sub(self.started_at) > staleness_timeout_ms
    }

    pub fn mark_succeeded(&mut self, artifact_refs: Vec<ArtifactRef>) {
        self.state = RunState::Succeeded;
        self.artifact_refs = artifact_refs;
        self.finished_at = Some(now_ms());
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) {
        self.state = RunState::Failed;
        self.cause = Some(cause.into());
        self.finished_at = Some(now_ms());
    }
}

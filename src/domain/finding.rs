//! Audit findings emitted by the reconciler
//!
//! Findings are appended to an immutable per-date audit log; re-running
//! audit for the same date produces a fresh record rather than mutating
//! history.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::run_record::Stage;
use crate::id::{audit_id, now_ms};

/// Classification of a reconciliation discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// A succeeded record references an artifact the ledger cannot resolve
    MissingArtifact,
    /// An artifact exists that no succeeded record references
    OrphanArtifact,
    /// An item stuck mid-lifecycle (never finalized by the gate)
    StaleItem,
    /// A sampled artifact scored below the quality threshold
    ScoreDrift,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::MissingArtifact => "missing_artifact",
            FindingKind::OrphanArtifact => "orphan_artifact",
            FindingKind::StaleItem => "stale_item",
            FindingKind::ScoreDrift => "score_drift",
        }
    }
}

/// One reconciliation discrepancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub run_date: NaiveDate,
    pub stage: Stage,
    pub kind: FindingKind,
    pub detail: String,
}

impl AuditFinding {
    pub fn new(run_date: NaiveDate, stage: Stage, kind: FindingKind, detail: impl Into<String>) -> Self {
        Self {
            run_date,
            stage,
            kind,
            detail: detail.into(),
        }
    }
}

/// One immutable audit run over a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub run_date: NaiveDate,
    pub created_at: i64,
    pub findings: Vec<AuditFinding>,
}

impl AuditRecord {
    pub fn new(run_date: NaiveDate, findings: Vec<AuditFinding>) -> Self {
        Self {
            id: audit_id(run_date),
            run_date,
            created_at: now_ms(),
            findings,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

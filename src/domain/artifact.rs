//! Artifacts and artifact references
//!
//! Artifact references are opaque to the ledger: path- or
//! content-addressed strings that only the producing stage knows how to
//! resolve. The Artifact record itself carries the review flag that gates
//! delivery of paid output.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::id::now_ms;

/// Opaque reference to a produced output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What kind of output an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Ingest batch summary (admitted/rejected counts and keys)
    Batch,
    /// Selection outline produced by SELECT
    Outline,
    /// Draft text produced by GENERATE
    Draft,
    /// Rendered document
    Document,
    /// Paid deep-research report; always held for human review
    Report,
    /// Delivery receipt or external acknowledgment
    Receipt,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Batch => "batch",
            ArtifactKind::Outline => "outline",
            ArtifactKind::Draft => "draft",
            ArtifactKind::Document => "document",
            ArtifactKind::Report => "report",
            ArtifactKind::Receipt => "receipt",
        }
    }
}

/// A produced output registered with the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub kind: ArtifactKind,
    pub run_date: NaiveDate,

    /// Must not be auto-delivered until a human signs off
    pub requires_human_review: bool,

    /// Inline payload or pointer metadata, shape owned by the producer
    pub payload: serde_json::Value,

    pub created_at: i64,
}

impl Artifact {
    pub fn new(
        reference: ArtifactRef,
        kind: ArtifactKind,
        run_date: NaiveDate,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            reference,
            kind,
            run_date,
            // Only the paid report kind defaults to held
            requires_human_review: kind == ArtifactKind::Report,
            payload,
            created_at: now_ms(),
        }
    }
}

//! Selection output of the SELECT stage

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::artifact::ArtifactRef;
use crate::domain::run_record::AnalysisMode;

/// The SELECT stage's output: a chosen topic with ranked title candidates
/// and an outline reference. Owned by the pipeline for the run date it was
/// produced under; consumed by GENERATE but re-readable for retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub run_date: NaiveDate,

    pub topic: String,

    /// Ranked, best first
    pub title_candidates: Vec<String>,

    pub outline_ref: ArtifactRef,

    /// Mode the selection was produced under
    pub mode: AnalysisMode,

    /// Dedup keys of the admitted items the selection drew from
    pub item_keys: Vec<String>,
}

impl Selection {
    /// A selection with no topic is unusable downstream.
    pub fn is_empty(&self) -> bool {
        self.topic.trim().is_empty()
    }
}

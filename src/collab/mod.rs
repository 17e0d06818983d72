//! External collaborator interfaces
//!
//! The pipeline core never talks to the network itself; scoring,
//! selection, drafting, rendering, and delivery all sit behind these
//! traits. Calls are long-latency and are wrapped in per-call timeouts by
//! the coordinator; errors discriminate retryable from permanent via
//! [`CollabError::is_retryable`].

pub mod mock;
pub mod offline;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::artifact::ArtifactRef;
use crate::domain::item::Item;
use crate::domain::run_record::AnalysisMode;
use crate::domain::selection::Selection;
use crate::schedule::Theme;

/// Errors that can occur during collaborator calls
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl CollabError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CollabError::Timeout(_) => true,
            CollabError::RateLimited { .. } => true,
            CollabError::Upstream { status, .. } => *status >= 500,
            CollabError::InvalidPayload(_) => false,
        }
    }
}

/// A candidate as it arrives from a source connector, before dedup keying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawItem {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub source: String,
    pub published_at: Option<String>,
    pub keyword: Option<String>,
}

/// Receipt returned by the delivery channel. Receipt of delivery is not
/// acknowledgment; paid output stays held until an ack lands separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub receipt_ref: String,
}

/// Fetches candidate items for a theme. Finite, restartable, unordered.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn fetch(&self, theme: &Theme) -> Result<Vec<RawItem>, CollabError>;
}

/// Scores one item across the named metrics.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, item: &Item) -> Result<BTreeMap<String, f64>, CollabError>;
}

/// Chooses a topic from the admitted items for a run date.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(
        &self,
        run_date: NaiveDate,
        items: &[Item],
        mode: AnalysisMode,
    ) -> Result<Selection, CollabError>;
}

/// Turns a selection into draft text.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn generate(&self, selection: &Selection) -> Result<String, CollabError>;
}

/// Turns a draft into a distributable document reference.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, run_date: NaiveDate, draft: &str) -> Result<ArtifactRef, CollabError>;
}

/// Pushes a document downstream and returns a receipt.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, document: &ArtifactRef, caption: &str) -> Result<DeliveryReceipt, CollabError>;
}

/// Advisory quality scoring of produced artifacts, used only by audit.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score_artifact(&self, artifact: &ArtifactRef) -> Result<f64, CollabError>;
}

/// The full collaborator set the coordinator is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn SourceConnector>,
    pub scorer: Arc<dyn Scorer>,
    pub selector: Arc<dyn Selector>,
    pub drafter: Arc<dyn Drafter>,
    pub renderer: Arc<dyn Renderer>,
    pub delivery: Arc<dyn DeliveryChannel>,
    pub quality: Arc<dyn QualityScorer>,
}

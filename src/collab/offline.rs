//! File-backed collaborator set
//!
//! Lets the binary run the full pipeline without any network
//! collaborators: candidates are dropped as JSON files into an inbox
//! directory, drafts and documents are written under the data directory,
//! and deliveries append to an outbox manifest awaiting human pickup.
//! Real deployments swap in connector/scorer implementations behind the
//! same traits.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{
    CollabError, Collaborators, DeliveryChannel, DeliveryReceipt, Drafter, QualityScorer, RawItem, Renderer, Scorer,
    Selector, SourceConnector,
};
use crate::domain::artifact::ArtifactRef;
use crate::domain::item::Item;
use crate::domain::run_record::AnalysisMode;
use crate::domain::selection::Selection;
use crate::id::{artifact_ref, now_ms};
use crate::schedule::Theme;

fn io_err(e: std::io::Error) -> CollabError {
    CollabError::Upstream {
        status: 500,
        message: e.to_string(),
    }
}

/// Reads candidate batches from `<inbox>/*.json`, each file holding a JSON
/// array of raw items. Files are left in place; the admission gate makes
/// re-reads harmless.
pub struct InboxConnector {
    inbox: PathBuf,
}

impl InboxConnector {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self { inbox: inbox.into() }
    }
}

#[async_trait]
impl SourceConnector for InboxConnector {
    async fn fetch(&self, theme: &Theme) -> Result<Vec<RawItem>, CollabError> {
        if !self.inbox.exists() {
            return Ok(vec![]);
        }

        let mut items = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.inbox)
            .map_err(io_err)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();

        for path in entries {
            let text = fs::read_to_string(&path).map_err(io_err)?;
            let batch: Vec<RawItem> = serde_json::from_str(&text)
                .map_err(|e| CollabError::InvalidPayload(format!("{}: {}", path.display(), e)))?;
            items.extend(batch);
        }

        log::debug!("inbox yielded {} raw items for theme {}", items.len(), theme.name);
        Ok(items)
    }
}

/// Applies a fixed prior to every required metric. A stand-in for an LLM
/// scorer during offline runs.
pub struct FixedScorer {
    prior: f64,
}

impl FixedScorer {
    pub fn new(prior: f64) -> Self {
        Self { prior }
    }
}

#[async_trait]
impl Scorer for FixedScorer {
    async fn score(&self, _item: &Item) -> Result<BTreeMap<String, f64>, CollabError> {
        Ok(BTreeMap::from([
            ("relevance".to_string(), self.prior),
            ("asymmetry".to_string(), self.prior),
            ("potential".to_string(), self.prior),
        ]))
    }
}

/// Picks the highest-scoring admitted item as the topic and writes its
/// outline next to the other artifacts.
pub struct TopScoreSelector {
    artifacts_dir: PathBuf,
}

impl TopScoreSelector {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

#[async_trait]
impl Selector for TopScoreSelector {
    async fn select(
        &self,
        run_date: NaiveDate,
        items: &[Item],
        mode: AnalysisMode,
    ) -> Result<Selection, CollabError> {
        let best = items
            .iter()
            .max_by(|a, b| a.avg_score().total_cmp(&b.avg_score()))
            .ok_or_else(|| CollabError::InvalidPayload("no admitted items".to_string()))?;

        let outline = format!(
            "# {}\n\n- why it matters\n- what changed\n- what to do about it\n",
            best.title
        );
        let outline_ref = artifact_ref("outline", run_date, 1);
        let outline_path = self.artifacts_dir.join(outline_ref.replace('/', "-")).with_extension("md");
        fs::create_dir_all(&self.artifacts_dir).map_err(io_err)?;
        fs::write(&outline_path, outline).map_err(io_err)?;

        Ok(Selection {
            run_date,
            topic: best.title.clone(),
            title_candidates: vec![
                best.title.clone(),
                format!("{}: the quiet shift", best.title),
                format!("What {} means downstream", best.title),
            ],
            outline_ref: ArtifactRef::new(outline_ref),
            mode,
            item_keys: items.iter().map(|i| i.dedup_key.clone()).collect(),
        })
    }
}

/// Expands the selection outline into a skeleton draft.
pub struct TemplateDrafter;

#[async_trait]
impl Drafter for TemplateDrafter {
    async fn generate(&self, selection: &Selection) -> Result<String, CollabError> {
        if selection.is_empty() {
            return Err(CollabError::InvalidPayload("empty selection".to_string()));
        }
        let titles = selection
            .title_candidates
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!(
            "# {}\n\n## Candidate titles\n{}\n\n## Body\n\n(drafted offline from {} source items)\n",
            selection.topic,
            titles,
            selection.item_keys.len()
        ))
    }
}

/// Writes the draft to a markdown file and returns its path as the ref.
pub struct FileRenderer {
    artifacts_dir: PathBuf,
}

impl FileRenderer {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

#[async_trait]
impl Renderer for FileRenderer {
    async fn render(&self, run_date: NaiveDate, draft: &str) -> Result<ArtifactRef, CollabError> {
        fs::create_dir_all(&self.artifacts_dir).map_err(io_err)?;
        let path = self.artifacts_dir.join(format!("{}-article.md", run_date));
        fs::write(&path, draft).map_err(io_err)?;
        Ok(ArtifactRef::new(path.to_string_lossy().into_owned()))
    }
}

/// Appends delivered refs to `<dir>/outbox.jsonl` for a human to pick up.
pub struct OutboxDelivery {
    dir: PathBuf,
}

impl OutboxDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DeliveryChannel for OutboxDelivery {
    async fn deliver(&self, document: &ArtifactRef, caption: &str) -> Result<DeliveryReceipt, CollabError> {
        use std::io::Write;

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let receipt_ref = format!("outbox/{}", now_ms());
        let line = serde_json::json!({
            "receipt": receipt_ref,
            "document": document.as_str(),
            "caption": caption,
        });
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("outbox.jsonl"))
            .map_err(io_err)?;
        writeln!(file, "{}", line).map_err(io_err)?;

        Ok(DeliveryReceipt { receipt_ref })
    }
}

/// Length-based quality prior: very short documents score low, everything
/// else passes. A stand-in for an LLM quality audit.
pub struct LengthQuality {
    min_len: usize,
}

impl LengthQuality {
    pub fn new(min_len: usize) -> Self {
        Self { min_len }
    }
}

#[async_trait]
impl QualityScorer for LengthQuality {
    async fn score_artifact(&self, artifact: &ArtifactRef) -> Result<f64, CollabError> {
        let path = PathBuf::from(artifact.as_str());
        let len = fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
        Ok(if len >= self.min_len { 7.0 } else { 3.0 })
    }
}

/// The full offline set rooted at a data directory.
pub fn offline_collaborators(data_dir: &std::path::Path, score_prior: f64) -> Collaborators {
    let artifacts = data_dir.join("artifacts");
    Collaborators {
        connector: Arc::new(InboxConnector::new(data_dir.join("inbox"))),
        scorer: Arc::new(FixedScorer::new(score_prior)),
        selector: Arc::new(TopScoreSelector::new(artifacts.clone())),
        drafter: Arc::new(TemplateDrafter),
        renderer: Arc::new(FileRenderer::new(artifacts)),
        delivery: Arc::new(OutboxDelivery::new(data_dir.join("outbox"))),
        quality: Arc::new(LengthQuality::new(200)),
    }
}

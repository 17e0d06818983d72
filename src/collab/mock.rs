//! Mock collaborators for tests
//!
//! Every mock counts its calls so tests can prove that idempotent replay
//! performs zero collaborator work, and each can be scripted with a queue
//! of failures to exercise the retry policy.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

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
use crate::id::artifact_ref;
use crate::schedule::Theme;

/// Failure script shared by all mocks: pop one error per call until empty.
#[derive(Default)]
struct FailureScript {
    queued: Mutex<VecDeque<CollabError>>,
}

impl FailureScript {
    fn push(&self, err: CollabError) {
        self.queued.lock().unwrap().push_back(err);
    }

    fn next(&self) -> Option<CollabError> {
        self.queued.lock().unwrap().pop_front()
    }
}

fn transient() -> CollabError {
    CollabError::Timeout(Duration::from_secs(30))
}

/// Connector returning a fixed batch of raw items.
#[derive(Default)]
pub struct MockConnector {
    items: Mutex<Vec<RawItem>>,
    failures: FailureScript,
    pub calls: AtomicUsize,
}

impl MockConnector {
    pub fn with_items(items: Vec<RawItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, times: usize) {
        for _ in 0..times {
            self.failures.push(transient());
        }
    }

    /// Add items to the feed for subsequent fetches.
    pub fn extend_items(&self, extra: Vec<RawItem>) {
        self.items.lock().unwrap().extend(extra);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn fetch(&self, _theme: &Theme) -> Result<Vec<RawItem>, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Scorer returning the same score for every required metric.
pub struct MockScorer {
    score: f64,
    failures: FailureScript,
    pub calls: AtomicUsize,
}

impl MockScorer {
    pub fn scoring(score: f64) -> Self {
        Self {
            score,
            failures: FailureScript::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, times: usize) {
        for _ in 0..times {
            self.failures.push(transient());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for MockScorer {
    async fn score(&self, _item: &Item) -> Result<BTreeMap<String, f64>, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        Ok(BTreeMap::from([
            ("relevance".to_string(), self.score),
            ("asymmetry".to_string(), self.score),
            ("potential".to_string(), self.score),
        ]))
    }
}

/// Selector choosing the highest-scoring item's title as the topic.
#[derive(Default)]
pub struct MockSelector {
    failures: FailureScript,
    pub calls: AtomicUsize,
}

impl MockSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        for _ in 0..times {
            self.failures.push(transient());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Selector for MockSelector {
    async fn select(
        &self,
        run_date: NaiveDate,
        items: &[Item],
        mode: AnalysisMode,
    ) -> Result<Selection, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.next() {
            return Err(err);
        }

        let best = items
            .iter()
            .max_by(|a, b| a.avg_score().total_cmp(&b.avg_score()))
            .ok_or_else(|| CollabError::InvalidPayload("no items to select from".to_string()))?;

        Ok(Selection {
            run_date,
            topic: best.title.clone(),
            title_candidates: vec![
                best.title.clone(),
                format!("{} explained", best.title),
                format!("Why {} matters", best.title),
            ],
            outline_ref: ArtifactRef::new(artifact_ref("outline", run_date, 1)),
            mode,
            item_keys: items.iter().map(|i| i.dedup_key.clone()).collect(),
        })
    }
}

/// Drafter emitting a deterministic draft from the topic.
#[derive(Default)]
pub struct MockDrafter {
    failures: FailureScript,
    pub calls: AtomicUsize,
}

impl MockDrafter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        for _ in 0..times {
            self.failures.push(transient());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Drafter for MockDrafter {
    async fn generate(&self, selection: &Selection) -> Result<String, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        Ok(format!("# {}\n\ndraft body\n", selection.topic))
    }
}

/// Renderer returning a deterministic document ref.
#[derive(Default)]
pub struct MockRenderer {
    pub calls: AtomicUsize,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, run_date: NaiveDate, _draft: &str) -> Result<ArtifactRef, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactRef::new(format!("rendered/{}", run_date)))
    }
}

/// Delivery channel recording every delivered ref.
#[derive(Default)]
pub struct MockDelivery {
    pub delivered: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for MockDelivery {
    async fn deliver(&self, document: &ArtifactRef, _caption: &str) -> Result<DeliveryReceipt, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.delivered.lock().unwrap().push(document.to_string());
        Ok(DeliveryReceipt {
            receipt_ref: format!("receipt/{}", document),
        })
    }
}

/// Quality scorer returning a fixed score.
pub struct MockQuality {
    score: f64,
    pub calls: AtomicUsize,
}

impl MockQuality {
    pub fn scoring(score: f64) -> Self {
        Self {
            score,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityScorer for MockQuality {
    async fn score_artifact(&self, _artifact: &ArtifactRef) -> Result<f64, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.score)
    }
}

/// Handles onto each mock so tests can script failures and read counters
/// after handing the trait objects to the coordinator.
pub struct MockSet {
    pub connector: Arc<MockConnector>,
    pub scorer: Arc<MockScorer>,
    pub selector: Arc<MockSelector>,
    pub drafter: Arc<MockDrafter>,
    pub renderer: Arc<MockRenderer>,
    pub delivery: Arc<MockDelivery>,
    pub quality: Arc<MockQuality>,
}

impl MockSet {
    /// A well-behaved set: the given items, every metric scored 8.0,
    /// quality comfortably above threshold.
    pub fn with_items(items: Vec<RawItem>) -> Self {
        Self {
            connector: Arc::new(MockConnector::with_items(items)),
            scorer: Arc::new(MockScorer::scoring(8.0)),
            selector: Arc::new(MockSelector::new()),
            drafter: Arc::new(MockDrafter::new()),
            renderer: Arc::new(MockRenderer::new()),
            delivery: Arc::new(MockDelivery::new()),
            quality: Arc::new(MockQuality::scoring(8.0)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            connector: self.connector.clone(),
            scorer: self.scorer.clone(),
            selector: self.selector.clone(),
            drafter: self.drafter.clone(),
            renderer: self.renderer.clone(),
            delivery: self.delivery.clone(),
            quality: self.quality.clone(),
        }
    }
}

/// A raw item helper for tests.
pub fn raw_item(source_id: &str, title: &str, url: &str) -> RawItem {
    RawItem {
        source_id: source_id.to_string(),
        title: title.to_string(),
        url: url.to_string(),
        summary: format!("{} summary", title),
        source: "mock".to_string(),
        published_at: None,
        keyword: None,
    }
}

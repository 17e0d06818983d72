//! Stage bodies
//!
//! Each body takes the claimed Running record, performs the external work
//! through the collaborator seams, writes results through the stores, and
//! returns the artifact refs for the ledger to commit. Collaborator errors
//! bubble up as transient/permanent and the coordinator's retry loop does
//! the rest.

use chrono::{NaiveDate, Timelike};
use serde_json::json;

use crate::domain::artifact::{Artifact, ArtifactKind, ArtifactRef};
use crate::domain::finding::AuditRecord;
use crate::domain::item::Item;
use crate::domain::run_record::{RunRecord, Stage};
use crate::error::{MillrunError, Result};
use crate::gate::Admission;
use crate::id::artifact_ref;
use crate::schedule::TrackTier;

use super::{Coordinator, RunOptions};

impl Coordinator {
    /// INGEST: fetch candidates for the slot theme, sight new dedup keys,
    /// score them, and push each through the admission gate. The batch
    /// summary is the stage artifact.
    pub(super) async fn run_ingest(
        &self,
        run_date: NaiveDate,
        record: &RunRecord,
        opts: &RunOptions,
    ) -> Result<Vec<ArtifactRef>> {
        let theme = match &opts.theme {
            Some(name) => self.schedule().theme_override(name),
            None => {
                let hour = opts.hour.unwrap_or_else(|| chrono::Local::now().hour());
                self.schedule().theme_for_hour(hour).clone()
            }
        };
        log::info!("ingest {} theme={} tier={:?}", run_date, theme.name, theme.tier);

        let raw = self
            .call_collab("source connector", self.collabs().connector.fetch(&theme))
            .await?;
        let fetched = raw.len();

        // Sight each candidate; the insert is the global at-most-once
        // claim on the dedup key, so keys with a settled admission decision
        // drop here. A non-terminal record is our own sighting that a prior
        // crashed or failed attempt never finalized - resume it.
        let mut fresh: Vec<Item> = Vec::new();
        let mut already_seen = 0usize;
        {
            let mut items = self.lock_items()?;
            for r in raw {
                let item = Item::from_raw(r, run_date);
                match items.get(&item.dedup_key)? {
                    Some(existing) if existing.status.is_terminal() => already_seen += 1,
                    Some(existing) => fresh.push(existing),
                    None => {
                        if items.insert_new(&item)? {
                            fresh.push(item);
                        } else {
                            already_seen += 1;
                        }
                    }
                }
            }
        }

        // Score the survivors concurrently; any scorer failure fails the
        // attempt (transient ones retry as a new attempt).
        let score_results = futures::future::join_all(
            fresh
                .iter()
                .map(|item| self.call_collab("scorer", self.collabs().scorer.score(item))),
        )
        .await;

        let mut admitted_keys = Vec::new();
        let mut rejected_low = 0usize;
        let mut rejected_dup = 0usize;
        for (mut item, scores) in fresh.into_iter().zip(score_results) {
            item.apply_scores(scores?);
            {
                let mut items = self.lock_items()?;
                items.update(&item)?;
            }
            match self.gate().admit(&item)? {
                Admission::Admitted => admitted_keys.push(item.dedup_key.clone()),
                Admission::RejectedLowScore => rejected_low += 1,
                Admission::RejectedDuplicate => rejected_dup += 1,
            }
        }

        // Shortlist for the batch summary, best first
        let shortlist: Vec<String> = {
            let items = self.lock_items()?;
            let mut admitted = Vec::new();
            for key in &admitted_keys {
                if let Some(item) = items.get(key)? {
                    admitted.push(item);
                }
            }
            admitted.sort_by(|a, b| b.avg_score().total_cmp(&a.avg_score()));
            admitted
                .into_iter()
                .take(self.config().pipeline.max_items_per_batch)
                .map(|i| i.dedup_key)
                .collect()
        };

        let batch_ref = ArtifactRef::new(artifact_ref("batch", run_date, record.attempt_id));
        let batch = Artifact::new(
            batch_ref.clone(),
            ArtifactKind::Batch,
            run_date,
            json!({
                "theme": theme.name,
                "tier": match theme.tier { TrackTier::Free => "free", TrackTier::Premium => "premium" },
                "fetched": fetched,
                "already_seen": already_seen,
                "admitted": admitted_keys.len(),
                "rejected_low_score": rejected_low,
                "rejected_duplicate": rejected_dup,
                "shortlist": shortlist,
            }),
        );
        {
            let mut ledger = self.lock_ledger()?;
            ledger.put_artifact(&batch)?;
        }

        log::info!(
            "ingest {} done: {} fetched, {} admitted, {} low-score, {} duplicate",
            run_date,
            fetched,
            admitted_keys.len(),
            rejected_low,
            rejected_dup
        );
        Ok(vec![batch_ref])
    }

    /// SELECT: pick a topic from the admitted item window, enforcing the
    /// topic cooldown. The outline is the stage artifact; the selection
    /// record is stored alongside for GENERATE.
    pub(super) async fn run_select(
        &self,
        run_date: NaiveDate,
        _record: &RunRecord,
        opts: &RunOptions,
    ) -> Result<Vec<ArtifactRef>> {
        let window = self.config().pipeline.select_window_days;
        let admitted = {
            let items = self.lock_items()?;
            items.admitted_in_window(run_date, window)?
        };
        if admitted.is_empty() {
            return Err(MillrunError::PermanentInput(format!(
                "no admitted items for {} (window {} days)",
                run_date, window
            )));
        }

        let selection = self
            .call_collab(
                "selector",
                self.collabs().selector.select(run_date, &admitted, opts.mode),
            )
            .await?;
        if selection.is_empty() {
            return Err(MillrunError::PermanentInput("selector returned an empty selection".to_string()));
        }

        {
            let ledger = self.lock_ledger()?;
            if ledger.topic_in_cooldown(&selection.topic, run_date, self.config().pipeline.topic_cooldown_days)? {
                return Err(MillrunError::PermanentInput(format!(
                    "topic '{}' is still in cooldown",
                    selection.topic
                )));
            }
        }

        let outline = Artifact::new(
            selection.outline_ref.clone(),
            ArtifactKind::Outline,
            run_date,
            json!({
                "topic": selection.topic,
                "title_candidates": selection.title_candidates,
                "item_keys": selection.item_keys,
            }),
        );

        {
            let mut ledger = self.lock_ledger()?;
            ledger.put_artifact(&outline)?;
            ledger.put_selection(&selection)?;
            ledger.mark_topic_written(&selection.topic, run_date, self.config().pipeline.topic_retention_days)?;
        }

        log::info!("select {} chose topic '{}'", run_date, selection.topic);
        Ok(vec![selection.outline_ref])
    }

    /// GENERATE: draft and render the selected topic. The paid variant
    /// holds delivery open until an external acknowledgment; the free
    /// variant delivers straight away. Both count against the daily caps.
    pub(super) async fn run_generate(
        &self,
        run_date: NaiveDate,
        record: &RunRecord,
        opts: &RunOptions,
    ) -> Result<Vec<ArtifactRef>> {
        // GENERATE may only start once SELECT has a succeeded, non-empty
        // selection for this run date.
        let mut selection = {
            let ledger = self.lock_ledger()?;
            if ledger.latest_succeeded(run_date, Stage::Select)?.is_none() {
                return Err(MillrunError::PermanentInput(format!(
                    "no succeeded select record for {}",
                    run_date
                )));
            }
            ledger.get_selection(run_date)?.ok_or_else(|| {
                MillrunError::PermanentInput(format!("select succeeded but selection record missing for {}", run_date))
            })?
        };
        if selection.is_empty() {
            return Err(MillrunError::PermanentInput("stored selection is empty".to_string()));
        }

        let track = if opts.paid { "paid" } else { "free" };
        let cap = if opts.paid {
            self.config().pipeline.max_paid_per_day
        } else {
            self.config().pipeline.max_free_per_day
        };
        {
            let ledger = self.lock_ledger()?;
            if ledger.publish_count(run_date, track)? >= cap {
                return Err(MillrunError::PermanentInput(format!(
                    "daily {} publish cap ({}) reached for {}",
                    track, cap, run_date
                )));
            }
        }

        // Paid runs may override the topic explicitly or pull from the
        // queue; a request already marked processing is re-read so retries
        // do not drain the queue.
        let mut paid_topic: Option<String> = None;
        if opts.paid {
            let topic = match &opts.topic {
                Some(topic) => Some(topic.clone()),
                None => {
                    let mut ledger = self.lock_ledger()?;
                    match ledger.processing_paid()? {
                        Some(request) => Some(request.topic),
                        None => ledger.dequeue_paid()?.map(|r| r.topic),
                    }
                }
            };
            let topic = topic.ok_or_else(|| {
                MillrunError::PermanentInput("paid generate needs a topic: queue is empty and none given".to_string())
            })?;
            selection.topic = topic.clone();
            paid_topic = Some(topic);
        } else if let Some(topic) = &opts.topic {
            selection.topic = topic.clone();
        }

        let draft_text = self
            .call_collab("drafter", self.collabs().drafter.generate(&selection))
            .await?;
        if draft_text.trim().is_empty() {
            return Err(MillrunError::PermanentInput("drafter returned an empty draft".to_string()));
        }

        let draft_ref = ArtifactRef::new(artifact_ref("draft", run_date, record.attempt_id));
        let draft = Artifact::new(
            draft_ref.clone(),
            ArtifactKind::Draft,
            run_date,
            json!({ "topic": selection.topic, "text": draft_text }),
        );

        let document_ref = self
            .call_collab("renderer", self.collabs().renderer.render(run_date, &draft_text))
            .await?;
        let kind = if opts.paid { ArtifactKind::Report } else { ArtifactKind::Document };
        let document = Artifact::new(
            document_ref.clone(),
            kind,
            run_date,
            json!({ "topic": selection.topic, "draft_ref": draft_ref.as_str() }),
        );

        {
            let mut ledger = self.lock_ledger()?;
            ledger.put_artifact(&draft)?;
            ledger.put_artifact(&document)?;
        }

        let mut refs = vec![draft_ref, document_ref.clone()];

        if opts.paid {
            // Hold the side effect open: delivery completes only when the
            // external acknowledgment lands.
            {
                let mut ledger = self.lock_ledger()?;
                ledger.open_delivery(run_date, document_ref.clone())?;
            }
            let caption = format!("Paid report: {} (awaiting review)", selection.topic);
            let receipt = self
                .call_collab("delivery channel", self.collabs().delivery.deliver(&document_ref, &caption))
                .await?;

            let receipt_ref = ArtifactRef::new(receipt.receipt_ref);
            let receipt_artifact = Artifact::new(
                receipt_ref.clone(),
                ArtifactKind::Receipt,
                run_date,
                json!({ "document": document_ref.as_str() }),
            );
            {
                let mut ledger = self.lock_ledger()?;
                ledger.put_artifact(&receipt_artifact)?;
                if let Some(topic) = &paid_topic {
                    ledger.complete_paid(topic)?;
                }
                ledger.increment_publish(run_date, "paid")?;
            }
            refs.push(receipt_ref);
        } else {
            let caption = format!("Daily article: {}", selection.topic);
            let receipt = self
                .call_collab("delivery channel", self.collabs().delivery.deliver(&document_ref, &caption))
                .await?;

            let receipt_ref = ArtifactRef::new(receipt.receipt_ref);
            let receipt_artifact = Artifact::new(
                receipt_ref.clone(),
                ArtifactKind::Receipt,
                run_date,
                json!({ "document": document_ref.as_str() }),
            );
            {
                let mut ledger = self.lock_ledger()?;
                ledger.put_artifact(&receipt_artifact)?;
                ledger.increment_publish(run_date, "free")?;
            }
            refs.push(receipt_ref);
        }

        log::info!("generate {} produced {} ({})", run_date, document_ref, track);
        Ok(refs)
    }

    /// AUDIT: reconcile the date and append the findings to the immutable
    /// audit log. The audit record id is the stage artifact.
    pub(super) async fn run_audit(&self, run_date: NaiveDate) -> Result<Vec<ArtifactRef>> {
        let findings = self.reconciler().reconcile(run_date).await?;
        let audit_record = AuditRecord::new(run_date, findings);
        let audit_ref = ArtifactRef::new(audit_record.id.clone());

        {
            let mut ledger = self.lock_ledger()?;
            ledger.append_audit(&audit_record)?;
        }

        log::info!("audit {} recorded {} findings", run_date, audit_record.findings.len());
        Ok(vec![audit_ref])
    }

    pub(crate) fn collabs(&self) -> &crate::collab::Collaborators {
        &self.collabs
    }
}

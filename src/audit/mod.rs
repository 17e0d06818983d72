//! Reconciler
//!
//! Recomputes the expected stage graph for a run date from committed state
//! and compares it against the ledger. The reconciler is read-only over
//! the stores: it emits findings and never mutates pipeline state. Running
//! attempts are excluded from every comparison so an audit racing an
//! in-flight stage cannot raise false findings.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use crate::collab::QualityScorer;
use crate::config::AuditConfig;
use crate::domain::artifact::{Artifact, ArtifactKind};
use crate::domain::finding::{AuditFinding, FindingKind};
use crate::domain::item::ItemStatus;
use crate::domain::run_record::{RunRecord, RunState, Stage};
use crate::error::{MillrunError, Result};
use crate::store::{ItemStore, StageLedger};

/// Read-only drift detection over the Item Store and Stage Ledger.
pub struct Reconciler {
    items: Arc<Mutex<ItemStore>>,
    ledger: Arc<Mutex<StageLedger>>,
    quality: Arc<dyn QualityScorer>,
    config: AuditConfig,
}

/// Snapshot of committed state for one run date.
struct Snapshot {
    records: Vec<RunRecord>,
    artifacts: Vec<Artifact>,
    selection: Option<crate::domain::selection::Selection>,
    delivery: Option<crate::store::DeliveryRecord>,
    audit_ids: HashSet<String>,
    stale_item_keys: Vec<String>,
    admitted_keys: HashSet<String>,
}

impl Reconciler {
    pub fn new(
        items: Arc<Mutex<ItemStore>>,
        ledger: Arc<Mutex<StageLedger>>,
        quality: Arc<dyn QualityScorer>,
        config: AuditConfig,
    ) -> Self {
        Self {
            items,
            ledger,
            quality,
            config,
        }
    }

    /// Reconcile one run date. Deterministic for unchanged inputs: the
    /// findings come out sorted by (kind, detail).
    pub async fn reconcile(&self, run_date: NaiveDate) -> Result<Vec<AuditFinding>> {
        let snapshot = self.snapshot(run_date)?;
        let mut findings = Vec::new();

        let succeeded: Vec<&RunRecord> = snapshot
            .records
            .iter()
            .filter(|r| r.state == RunState::Succeeded)
            .collect();
        let running_stages: HashSet<Stage> = snapshot
            .records
            .iter()
            .filter(|r| r.state == RunState::Running)
            .map(|r| r.stage)
            .collect();

        // 1. Every ref a succeeded record carries must resolve.
        let resolvable: HashSet<String> = snapshot
            .artifacts
            .iter()
            .map(|a| a.reference.to_string())
            .chain(snapshot.audit_ids.iter().cloned())
            .collect();
        for record in &succeeded {
            for r in &record.artifact_refs {
                if !resolvable.contains(r.as_str()) {
                    findings.push(AuditFinding::new(
                        run_date,
                        record.stage,
                        FindingKind::MissingArtifact,
                        format!("attempt {} references unresolvable {}", record.attempt_id, r),
                    ));
                }
            }
        }

        // 2. A succeeded SELECT must have a selection consistent with the
        // admitted item set.
        if succeeded.iter().any(|r| r.stage == Stage::Select) {
            match &snapshot.selection {
                None => findings.push(AuditFinding::new(
                    run_date,
                    Stage::Select,
                    FindingKind::MissingArtifact,
                    "select succeeded but selection record is missing",
                )),
                Some(selection) => {
                    for key in &selection.item_keys {
                        if !snapshot.admitted_keys.contains(key) {
                            findings.push(AuditFinding::new(
                                run_date,
                                Stage::Select,
                                FindingKind::MissingArtifact,
                                format!("selection references item {} which is not admitted", key),
                            ));
                        }
                    }
                }
            }
        }

        // 3. Orphan artifacts: anything for this date no succeeded record
        // references. Skipped entirely while any stage is running, since
        // an in-flight attempt writes artifacts before it commits.
        if running_stages.is_empty() {
            let referenced: HashSet<String> = succeeded
                .iter()
                .flat_map(|r| r.artifact_refs.iter().map(|a| a.to_string()))
                .collect();
            for artifact in &snapshot.artifacts {
                if !referenced.contains(&artifact.reference.to_string()) {
                    findings.push(AuditFinding::new(
                        run_date,
                        Stage::Generate,
                        FindingKind::OrphanArtifact,
                        format!("artifact {} is referenced by no succeeded attempt", artifact.reference),
                    ));
                }
            }
        }

        // 4. Items stuck mid-lifecycle: sighted or scored but never
        // finalized by the gate. Skipped while ingest is running.
        if !running_stages.contains(&Stage::Ingest) {
            for key in &snapshot.stale_item_keys {
                findings.push(AuditFinding::new(
                    run_date,
                    Stage::Ingest,
                    FindingKind::StaleItem,
                    format!("item {} was never finalized by the admission gate", key),
                ));
            }
        }

        // 5. Reviewed artifacts need a delivery hold on record.
        let needs_review = snapshot.artifacts.iter().any(|a| a.requires_human_review);
        if needs_review && snapshot.delivery.is_none() && !running_stages.contains(&Stage::Generate) {
            findings.push(AuditFinding::new(
                run_date,
                Stage::Generate,
                FindingKind::MissingArtifact,
                "artifact requires human review but no delivery record exists",
            ));
        }

        // 6. Advisory quality sampling. Failures here are logged and
        // skipped; this path never mutates run state.
        findings.extend(self.sample_quality(run_date, &snapshot.artifacts).await);

        findings.sort_by(|a, b| (a.kind, &a.detail).cmp(&(b.kind, &b.detail)));
        Ok(findings)
    }

    async fn sample_quality(&self, run_date: NaiveDate, artifacts: &[Artifact]) -> Vec<AuditFinding> {
        let mut sample: Vec<&Artifact> = artifacts
            .iter()
            .filter(|a| matches!(a.kind, ArtifactKind::Document | ArtifactKind::Report))
            .collect();
        sample.sort_by(|a, b| a.reference.as_str().cmp(b.reference.as_str()));
        sample.truncate(self.config.sample_size);

        let mut findings = Vec::new();
        for artifact in sample {
            match self.quality.score_artifact(&artifact.reference).await {
                Ok(score) if score < self.config.quality_threshold => {
                    findings.push(AuditFinding::new(
                        run_date,
                        Stage::Generate,
                        FindingKind::ScoreDrift,
                        format!(
                            "artifact {} scored {:.1}, below threshold {:.1}",
                            artifact.reference, score, self.config.quality_threshold
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("quality scoring of {} failed, skipping: {}", artifact.reference, e);
                }
            }
        }
        findings
    }

    /// Read everything the comparison needs in one pass, then drop the
    /// locks before any collaborator call.
    fn snapshot(&self, run_date: NaiveDate) -> Result<Snapshot> {
        let (records, artifacts, selection, delivery, audit_ids) = {
            let ledger = self.ledger.lock().map_err(|e| MillrunError::Storage(e.to_string()))?;
            let records = ledger.records_for_date(run_date)?;
            let artifacts = ledger.artifacts_for_date(run_date)?;
            let selection = ledger.get_selection(run_date)?;
            let delivery = ledger.get_delivery(run_date)?;
            let audit_ids = ledger
                .audits_for_date(run_date)?
                .into_iter()
                .map(|a| a.id)
                .collect::<HashSet<_>>();
            (records, artifacts, selection, delivery, audit_ids)
        };

        let (stale_item_keys, admitted_keys) = {
            let items = self.items.lock().map_err(|e| MillrunError::Storage(e.to_string()))?;
            let for_date = items.items_for_date(run_date)?;
            let stale: Vec<String> = for_date
                .iter()
                .filter(|i| !i.status.is_terminal())
                .map(|i| i.dedup_key.clone())
                .collect();

            // Selections may draw on a window of prior dates, so resolve
            // each referenced key individually rather than by date.
            let mut admitted = HashSet::new();
            if let Some(sel) = &selection {
                for key in &sel.item_keys {
                    if let Some(item) = items.get(key)? {
                        if item.status == ItemStatus::Admitted {
                            admitted.insert(key.clone());
                        }
                    }
                }
            }
            (stale, admitted)
        };

        Ok(Snapshot {
            records,
            artifacts,
            selection,
            delivery,
            audit_ids,
            stale_item_keys,
            admitted_keys,
        })
    }
}

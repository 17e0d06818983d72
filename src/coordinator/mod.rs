//! Stage Coordinator
//!
//! Drives the Ingest -> Select -> Generate -> Audit sequence for a run
//! date. The coordinator is the sole writer of run records, selections,
//! and artifact references; all external work goes through the
//! collaborator traits, time-bounded and retried under a bounded backoff
//! policy. Every automatic retry is a fresh ledger attempt, so the attempt
//! history is the retry history.

mod stages;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;

use crate::audit::Reconciler;
use crate::collab::{CollabError, Collaborators};
use crate::config::Config;
use crate::domain::artifact::ArtifactRef;
use crate::domain::finding::AuditFinding;
use crate::domain::run_record::{AnalysisMode, RunRecord, Stage};
use crate::error::{MillrunError, Result};
use crate::gate::{AdmissionGate, GatePolicy};
use crate::schedule::Schedule;
use crate::store::{BeginOutcome, ItemStore, StageLedger};

/// Options for one `run()` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Re-run a stage that already succeeded; the prior success stays the
    /// replay target until the forced attempt itself succeeds
    pub force_rerun: bool,
    /// Theme override for ingest; otherwise the hour schedule decides
    pub theme: Option<String>,
    /// Topic override for generate
    pub topic: Option<String>,
    /// Analysis depth for select
    pub mode: AnalysisMode,
    /// Produce the paid report variant (held for human review)
    pub paid: bool,
    /// Hour used for theme resolution; defaults to the current local hour
    pub hour: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_rerun: false,
            theme: None,
            topic: None,
            mode: AnalysisMode::Lite,
            paid: false,
            hour: None,
        }
    }
}

/// Terminal outcome of a `run()` invocation. Expected failures come back
/// here, never as an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded {
        attempt_id: u32,
        artifact_refs: Vec<ArtifactRef>,
    },
    Failed {
        attempt_id: u32,
        cause: String,
    },
    /// Another attempt for this (run_date, stage) is running and fresh
    Busy {
        attempt_id: u32,
    },
}

impl RunOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

/// Drives stage execution against the durable stores.
pub struct Coordinator {
    items: Arc<Mutex<ItemStore>>,
    ledger: Arc<Mutex<StageLedger>>,
    gate: AdmissionGate,
    collabs: Collaborators,
    schedule: Schedule,
    config: Config,
    cancels: Mutex<HashMap<(NaiveDate, Stage), Arc<AtomicBool>>>,
}

impl Coordinator {
    pub fn new(
        items: Arc<Mutex<ItemStore>>,
        ledger: Arc<Mutex<StageLedger>>,
        collabs: Collaborators,
        config: Config,
    ) -> Self {
        let gate = AdmissionGate::new(
            items.clone(),
            GatePolicy {
                score_threshold: config.admission.score_threshold,
                metric_floor: config.admission.metric_floor,
            },
        );
        Self {
            items,
            ledger,
            gate,
            collabs,
            schedule: Schedule::default(),
            config,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one stage for a run date.
    ///
    /// Idempotent: a prior success replays its artifact refs without any
    /// collaborator calls. Transient collaborator failures retry as fresh
    /// attempts with exponential backoff up to the configured cap;
    /// permanent failures stop immediately.
    pub async fn run(&self, stage: Stage, run_date: NaiveDate, opts: RunOptions) -> Result<RunOutcome> {
        tracing::info!(stage = %stage, date = %run_date, force = opts.force_rerun, "stage run requested");
        let mode = match stage {
            Stage::Select => Some(opts.mode),
            _ => None,
        };

        let mut attempts_made = 0u32;
        loop {
            attempts_made += 1;

            let begin = {
                let mut ledger = self.lock_ledger()?;
                ledger.try_begin(
                    run_date,
                    stage,
                    mode,
                    self.config.staleness_timeout_ms(),
                    opts.force_rerun,
                )?
            };

            let record = match begin {
                BeginOutcome::Busy { attempt_id } => {
                    log::info!("{}/{} busy on attempt {}", run_date, stage, attempt_id);
                    return Ok(RunOutcome::Busy { attempt_id });
                }
                BeginOutcome::Replay(rec) => {
                    log::info!("{}/{} replaying succeeded attempt {}", run_date, stage, rec.attempt_id);
                    return Ok(RunOutcome::Succeeded {
                        attempt_id: rec.attempt_id,
                        artifact_refs: rec.artifact_refs,
                    });
                }
                BeginOutcome::Started(rec) => rec,
            };

            let cancel = self.register_cancel(run_date, stage);
            let result = self.execute_stage(stage, run_date, &record, &opts).await;
            self.clear_cancel(run_date, stage);

            match result {
                Ok(refs) => {
                    let finished = {
                        let mut ledger = self.lock_ledger()?;
                        ledger.finish_success(run_date, stage, record.attempt_id, refs)
                    };
                    return match finished {
                        Ok(rec) => Ok(RunOutcome::Succeeded {
                            attempt_id: rec.attempt_id,
                            artifact_refs: rec.artifact_refs,
                        }),
                        // Cancelled while the collaborator call was in
                        // flight; the record is already Failed
                        Err(MillrunError::Consistency(_)) => Ok(RunOutcome::Failed {
                            attempt_id: record.attempt_id,
                            cause: "cancelled by external signal".to_string(),
                        }),
                        Err(e) => Err(e),
                    };
                }
                Err(err) => {
                    let cause = err.to_string();
                    {
                        let mut ledger = self.lock_ledger()?;
                        match ledger.finish_failure(run_date, stage, record.attempt_id, &cause) {
                            Ok(_) => {}
                            // Cancel already failed the record
                            Err(MillrunError::Consistency(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }

                    let cancelled = cancel.load(Ordering::SeqCst);
                    if err.is_transient() && attempts_made < self.config.pipeline.max_attempts && !cancelled {
                        let delay = backoff_delay(
                            attempts_made,
                            self.config.pipeline.backoff_base_ms,
                            self.config.pipeline.backoff_cap_ms,
                        );
                        log::warn!(
                            "{}/{} attempt {} failed transiently ({}), retrying in {:?}",
                            run_date,
                            stage,
                            record.attempt_id,
                            cause,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Ok(RunOutcome::Failed {
                        attempt_id: record.attempt_id,
                        cause,
                    });
                }
            }
        }
    }

    /// Read-only reconciliation of a run date. Does not write a run
    /// record; `run(Stage::Audit, ...)` does and also appends to the
    /// audit log.
    pub async fn audit(&self, run_date: NaiveDate) -> Result<Vec<AuditFinding>> {
        self.reconciler().reconcile(run_date).await
    }

    /// Cancel the in-flight attempt for (run_date, stage), if any.
    ///
    /// The running record transitions to Failed immediately; the stage
    /// body notices when it tries to commit, and retries are suppressed.
    pub fn cancel(&self, run_date: NaiveDate, stage: Stage) -> Result<Option<RunRecord>> {
        if let Some(flag) = self.cancels.lock().unwrap().get(&(run_date, stage)) {
            flag.store(true, Ordering::SeqCst);
        }
        self.lock_ledger()?.cancel(run_date, stage)
    }

    /// Complete a pending paid delivery with an external acknowledgment.
    pub fn acknowledge_delivery(&self, run_date: NaiveDate, ack_ref: ArtifactRef) -> Result<()> {
        self.lock_ledger()?.acknowledge_delivery(run_date, ack_ref)?;
        Ok(())
    }

    /// Queue a topic for the paid-report variant of GENERATE.
    pub fn enqueue_paid(&self, topic: &str, priority: &str) -> Result<bool> {
        self.lock_ledger()?.enqueue_paid(topic, priority)
    }

    pub(crate) fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.items.clone(),
            self.ledger.clone(),
            self.collabs.quality.clone(),
            self.config.audit.clone(),
        )
    }

    async fn execute_stage(
        &self,
        stage: Stage,
        run_date: NaiveDate,
        record: &RunRecord,
        opts: &RunOptions,
    ) -> Result<Vec<ArtifactRef>> {
        match stage {
            Stage::Ingest => self.run_ingest(run_date, record, opts).await,
            Stage::Select => self.run_select(run_date, record, opts).await,
            Stage::Generate => self.run_generate(run_date, record, opts).await,
            Stage::Audit => self.run_audit(run_date).await,
        }
    }

    /// Wrap a collaborator call with the per-call timeout and translate
    /// its errors into the pipeline taxonomy.
    pub(crate) async fn call_collab<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, CollabError>>,
    {
        let timeout = Duration::from_millis(self.config.pipeline.collaborator_timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_retryable() => Err(MillrunError::TransientCollaborator(format!("{}: {}", what, e))),
            Ok(Err(e)) => Err(MillrunError::PermanentInput(format!("{}: {}", what, e))),
            Err(_) => Err(MillrunError::TransientCollaborator(format!(
                "{} timed out after {:?}",
                what, timeout
            ))),
        }
    }

    pub(crate) fn lock_items(&self) -> Result<std::sync::MutexGuard<'_, ItemStore>> {
        self.items.lock().map_err(|e| MillrunError::Storage(e.to_string()))
    }

    pub(crate) fn lock_ledger(&self) -> Result<std::sync::MutexGuard<'_, StageLedger>> {
        self.ledger.lock().map_err(|e| MillrunError::Storage(e.to_string()))
    }

    pub(crate) fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn register_cancel(&self, run_date: NaiveDate, stage: Stage) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .unwrap()
            .insert((run_date, stage), flag.clone());
        flag
    }

    fn clear_cancel(&self, run_date: NaiveDate, stage: Stage) {
        self.cancels.lock().unwrap().remove(&(run_date, stage));
    }
}

/// Exponential backoff between automatic retries: base * 2^(n-1), capped.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)));
    Duration::from_millis(exp.min(cap_ms))
}

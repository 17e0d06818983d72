//! Stage Ledger with JSONL append log and SQLite index.
//!
//! The ledger is the durable record of everything the coordinator does:
//! run attempts keyed by (run_date, stage, attempt_id), selections,
//! artifacts, delivery holds, topic cooldowns, the paid-request queue,
//! daily publish counts, and the append-only audit log. A single tagged
//! JSONL file logs every change (last record wins per key on rebuild);
//! the SQLite index serves queries.
//!
//! All access goes through one `Arc<Mutex<StageLedger>>`, which is the
//! serialization primitive behind the single-RUNNING invariant: the
//! check-and-set in `try_begin` runs start to finish under that lock.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::domain::artifact::{Artifact, ArtifactRef};
use crate::domain::finding::AuditRecord;
use crate::domain::run_record::{AnalysisMode, RunRecord, RunState, Stage};
use crate::domain::selection::Selection;
use crate::error::{MillrunError, Result};
use crate::id::now_ms;

/// Outcome of attempting to claim a (run_date, stage) for execution.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// A fresh Running attempt was claimed
    Started(RunRecord),
    /// A prior attempt already succeeded; its refs satisfy the caller
    /// without re-invoking external work
    Replay(RunRecord),
    /// Another attempt is Running and fresh
    Busy { attempt_id: u32 },
}

/// Hold on a delivered paid document until an external ack lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub run_date: NaiveDate,
    pub state: RunState,
    pub document_ref: ArtifactRef,
    pub requested_at: i64,
    pub acked_at: Option<i64>,
    pub ack_ref: Option<ArtifactRef>,
}

/// A topic that has been written, for the cooldown check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub topic: String,
    pub written_on: NaiveDate,
}

/// Queue state of a paid-report request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaidStatus {
    Pending,
    Processing,
    Done,
}

impl PaidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaidStatus::Pending => "pending",
            PaidStatus::Processing => "processing",
            PaidStatus::Done => "done",
        }
    }
}

/// A queued paid-report topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaidRequest {
    pub topic: String,
    pub priority: String,
    pub status: PaidStatus,
    pub enqueued_at: i64,
    pub completed_at: Option<i64>,
}

/// Daily publish counter per track ("free" / "paid").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PublishCount {
    run_date: NaiveDate,
    track: String,
    count: u32,
}

/// One line of the ledger log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LedgerEntry {
    Run(RunRecord),
    Selection(Selection),
    Artifact(Artifact),
    Delivery(DeliveryRecord),
    Topic(TopicRecord),
    Paid(PaidRequest),
    Publish(PublishCount),
    Audit(AuditRecord),
}

/// Durable per-day, per-stage run ledger.
pub struct StageLedger {
    jsonl_path: PathBuf,
    db: Connection,
}

impl StageLedger {
    /// Open or create a StageLedger at the given directory.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;

        let jsonl_path = base_dir.join("ledger.jsonl");
        let db_path = base_dir.join("ledger.db");

        let db = Connection::open(&db_path)?;
        Self::init_schema(&db)?;

        let mut ledger = Self { jsonl_path, db };
        ledger.rebuild_index_if_needed()?;

        Ok(ledger)
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_date TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempt_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                json_data TEXT NOT NULL,
                PRIMARY KEY (run_date, stage, attempt_id)
            );
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);

            CREATE TABLE IF NOT EXISTS selections (
                run_date TEXT PRIMARY KEY,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                reference TEXT PRIMARY KEY,
                run_date TEXT NOT NULL,
                kind TEXT NOT NULL,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_date ON artifacts(run_date);

            CREATE TABLE IF NOT EXISTS deliveries (
                run_date TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS topics (
                topic TEXT PRIMARY KEY,
                written_on TEXT NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS paid_queue (
                topic TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS publishes (
                run_date TEXT NOT NULL,
                track TEXT NOT NULL,
                count INTEGER NOT NULL,
                json_data TEXT NOT NULL,
                PRIMARY KEY (run_date, track)
            );

            CREATE TABLE IF NOT EXISTS audits (
                id TEXT PRIMARY KEY,
                run_date TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audits_date ON audits(run_date);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn rebuild_index_if_needed(&mut self) -> Result<()> {
        if !self.jsonl_path.exists() {
            return Ok(());
        }

        let jsonl_lines = {
            let file = File::open(&self.jsonl_path)?;
            BufReader::new(file).lines().count()
        };
        let indexed: usize = self
            .db
            .query_row("SELECT value FROM meta WHERE key = 'indexed_lines'", [], |row| {
                row.get::<_, String>(0)
            })
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if jsonl_lines != indexed {
            self.rebuild_index(jsonl_lines)?;
        }

        Ok(())
    }

    /// Replay the whole log into a fresh index; last record wins per key,
    /// audits are append-only and all survive.
    fn rebuild_index(&mut self, jsonl_lines: usize) -> Result<()> {
        let mut runs: HashMap<String, RunRecord> = HashMap::new();
        let mut selections: HashMap<String, Selection> = HashMap::new();
        let mut artifacts: HashMap<String, Artifact> = HashMap::new();
        let mut deliveries: HashMap<String, DeliveryRecord> = HashMap::new();
        let mut topics: HashMap<String, TopicRecord> = HashMap::new();
        let mut paid: HashMap<String, PaidRequest> = HashMap::new();
        let mut publishes: HashMap<String, PublishCount> = HashMap::new();
        let mut audits: HashMap<String, AuditRecord> = HashMap::new();

        let file = File::open(&self.jsonl_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line)? {
                LedgerEntry::Run(r) => {
                    runs.insert(r.key(), r);
                }
                LedgerEntry::Selection(s) => {
                    selections.insert(s.run_date.to_string(), s);
                }
                LedgerEntry::Artifact(a) => {
                    artifacts.insert(a.reference.to_string(), a);
                }
                LedgerEntry::Delivery(d) => {
                    deliveries.insert(d.run_date.to_string(), d);
                }
                LedgerEntry::Topic(t) => {
                    topics.insert(t.topic.clone(), t);
                }
                LedgerEntry::Paid(p) => {
                    paid.insert(p.topic.clone(), p);
                }
                LedgerEntry::Publish(p) => {
                    publishes.insert(format!("{}/{}", p.run_date, p.track), p);
                }
                LedgerEntry::Audit(a) => {
                    audits.insert(a.id.clone(), a);
                }
            }
        }

        let tx = self.db.transaction()?;
        tx.execute_batch(
            "DELETE FROM runs; DELETE FROM selections; DELETE FROM artifacts; DELETE FROM deliveries;
             DELETE FROM topics; DELETE FROM paid_queue; DELETE FROM publishes; DELETE FROM audits;",
        )?;
        for r in runs.values() {
            Self::upsert_run(&tx, r)?;
        }
        for s in selections.values() {
            Self::upsert_selection(&tx, s)?;
        }
        for a in artifacts.values() {
            Self::upsert_artifact(&tx, a)?;
        }
        for d in deliveries.values() {
            Self::upsert_delivery(&tx, d)?;
        }
        for t in topics.values() {
            Self::upsert_topic(&tx, t)?;
        }
        for p in paid.values() {
            Self::upsert_paid(&tx, p)?;
        }
        for p in publishes.values() {
            Self::upsert_publish(&tx, p)?;
        }
        for a in audits.values() {
            Self::upsert_audit(&tx, a)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('indexed_lines', ?1)",
            params![jsonl_lines.to_string()],
        )?;
        tx.commit()?;

        Ok(())
    }

    //=== Upserts ===

    fn upsert_run(db: &Connection, r: &RunRecord) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO runs (run_date, stage, attempt_id, state, started_at, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                r.run_date.to_string(),
                r.stage.as_str(),
                r.attempt_id,
                r.state.as_str(),
                r.started_at,
                serde_json::to_string(r)?,
            ],
        )?;
        Ok(())
    }

    fn upsert_selection(db: &Connection, s: &Selection) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO selections (run_date, json_data) VALUES (?1, ?2)",
            params![s.run_date.to_string(), serde_json::to_string(s)?],
        )?;
        Ok(())
    }

    fn upsert_artifact(db: &Connection, a: &Artifact) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO artifacts (reference, run_date, kind, json_data) VALUES (?1, ?2, ?3, ?4)",
            params![
                a.reference.to_string(),
                a.run_date.to_string(),
                a.kind.as_str(),
                serde_json::to_string(a)?,
            ],
        )?;
        Ok(())
    }

    fn upsert_delivery(db: &Connection, d: &DeliveryRecord) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO deliveries (run_date, state, json_data) VALUES (?1, ?2, ?3)",
            params![d.run_date.to_string(), d.state.as_str(), serde_json::to_string(d)?],
        )?;
        Ok(())
    }

    fn upsert_topic(db: &Connection, t: &TopicRecord) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO topics (topic, written_on, json_data) VALUES (?1, ?2, ?3)",
            params![t.topic, t.written_on.to_string(), serde_json::to_string(t)?],
        )?;
        Ok(())
    }

    fn upsert_paid(db: &Connection, p: &PaidRequest) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO paid_queue (topic, status, enqueued_at, json_data) VALUES (?1, ?2, ?3, ?4)",
            params![p.topic, p.status.as_str(), p.enqueued_at, serde_json::to_string(p)?],
        )?;
        Ok(())
    }

    fn upsert_publish(db: &Connection, p: &PublishCount) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO publishes (run_date, track, count, json_data) VALUES (?1, ?2, ?3, ?4)",
            params![p.run_date.to_string(), p.track, p.count, serde_json::to_string(p)?],
        )?;
        Ok(())
    }

    fn upsert_audit(db: &Connection, a: &AuditRecord) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO audits (id, run_date, created_at, json_data) VALUES (?1, ?2, ?3, ?4)",
            params![a.id, a.run_date.to_string(), a.created_at, serde_json::to_string(a)?],
        )?;
        Ok(())
    }

    fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.jsonl_path)?;
        writeln!(file, "{}", json)?;
        self.db.execute(
            r#"
            INSERT INTO meta (key, value) VALUES ('indexed_lines', '1')
            ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
            "#,
            [],
        )?;
        Ok(())
    }

    fn write_run(&mut self, r: &RunRecord) -> Result<()> {
        self.append_entry(&LedgerEntry::Run(r.clone()))?;
        Self::upsert_run(&self.db, r)?;
        Ok(())
    }

    //=== Run attempts ===

    /// Claim (run_date, stage) for execution.
    ///
    /// The whole check-and-set runs under the ledger lock held by the
    /// caller, which is what enforces the single-RUNNING invariant across
    /// overlapping triggers:
    /// - a fresh Running attempt wins a Busy signal,
    /// - a Running attempt older than the staleness timeout is presumed
    ///   crashed, marked Failed, and superseded,
    /// - a Succeeded attempt is replayed unless `force` is set,
    /// - otherwise a new attempt with the next attempt_id starts Running.
    pub fn try_begin(
        &mut self,
        run_date: NaiveDate,
        stage: Stage,
        mode: Option<AnalysisMode>,
        staleness_ms: i64,
        force: bool,
    ) -> Result<BeginOutcome> {
        if let Some(mut latest) = self.latest_attempt(run_date, stage)? {
            if latest.state == RunState::Running {
                if latest.is_stale(staleness_ms) {
                    log::warn!("{} attempt {} presumed crashed, marking failed", latest.key(), latest.attempt_id);
                    latest.mark_failed("stale running record (presumed crash)");
                    self.write_run(&latest)?;
                } else {
                    return Ok(BeginOutcome::Busy {
                        attempt_id: latest.attempt_id,
                    });
                }
            }
        }

        if !force {
            if let Some(succeeded) = self.latest_succeeded(run_date, stage)? {
                return Ok(BeginOutcome::Replay(succeeded));
            }
        }

        let next_id = self
            .latest_attempt(run_date, stage)?
            .map(|r| r.attempt_id + 1)
            .unwrap_or(1);
        let record = RunRecord::begin(run_date, stage, next_id, mode);
        self.write_run(&record)?;
        Ok(BeginOutcome::Started(record))
    }

    /// Transition a Running attempt to Succeeded.
    ///
    /// Fails with a consistency error if the attempt is no longer Running
    /// (e.g. cancelled while the collaborator call was in flight).
    pub fn finish_success(
        &mut self,
        run_date: NaiveDate,
        stage: Stage,
        attempt_id: u32,
        artifact_refs: Vec<ArtifactRef>,
    ) -> Result<RunRecord> {
        let mut record = self.expect_running(run_date, stage, attempt_id)?;
        record.mark_succeeded(artifact_refs);
        self.write_run(&record)?;
        Ok(record)
    }

    /// Transition a Running attempt to Failed with a cause.
    pub fn finish_failure(
        &mut self,
        run_date: NaiveDate,
        stage: Stage,
        attempt_id: u32,
        cause: &str,
    ) -> Result<RunRecord> {
        let mut record = self.expect_running(run_date, stage, attempt_id)?;
        record.mark_failed(cause);
        self.write_run(&record)?;
        Ok(record)
    }

    fn expect_running(&self, run_date: NaiveDate, stage: Stage, attempt_id: u32) -> Result<RunRecord> {
        let record = self.get_run(run_date, stage, attempt_id)?.ok_or_else(|| {
            MillrunError::Consistency(format!("run record {}/{}/{} not found", run_date, stage, attempt_id))
        })?;
        if record.state != RunState::Running {
            return Err(MillrunError::Consistency(format!(
                "run record {} is {}, not running",
                record.key(),
                record.state.as_str()
            )));
        }
        Ok(record)
    }

    /// Cancel the Running attempt for (run_date, stage), if any.
    pub fn cancel(&mut self, run_date: NaiveDate, stage: Stage) -> Result<Option<RunRecord>> {
        match self.latest_attempt(run_date, stage)? {
            Some(mut record) if record.state == RunState::Running => {
                record.mark_failed("cancelled by external signal");
                self.write_run(&record)?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Append an artifact ref to a Succeeded record. Used only to mirror
    /// the delivery acknowledgment into the GENERATE record.
    pub fn append_artifact_ref(
        &mut self,
        run_date: NaiveDate,
        stage: Stage,
        attempt_id: u32,
        artifact_ref: ArtifactRef,
    ) -> Result<RunRecord> {
        let mut record = self.get_run(run_date, stage, attempt_id)?.ok_or_else(|| {
            MillrunError::Consistency(format!("run record {}/{}/{} not found", run_date, stage, attempt_id))
        })?;
        if record.state != RunState::Succeeded {
            return Err(MillrunError::Consistency(format!(
                "cannot append ref to {} record {}",
                record.state.as_str(),
                record.key()
            )));
        }
        record.artifact_refs.push(artifact_ref);
        self.write_run(&record)?;
        Ok(record)
    }

    pub fn get_run(&self, run_date: NaiveDate, stage: Stage, attempt_id: u32) -> Result<Option<RunRecord>> {
        self.query_run_opt(
            "SELECT json_data FROM runs WHERE run_date = ?1 AND stage = ?2 AND attempt_id = ?3",
            params![run_date.to_string(), stage.as_str(), attempt_id],
        )
    }

    pub fn latest_attempt(&self, run_date: NaiveDate, stage: Stage) -> Result<Option<RunRecord>> {
        self.query_run_opt(
            "SELECT json_data FROM runs WHERE run_date = ?1 AND stage = ?2 ORDER BY attempt_id DESC LIMIT 1",
            params![run_date.to_string(), stage.as_str()],
        )
    }

    pub fn latest_succeeded(&self, run_date: NaiveDate, stage: Stage) -> Result<Option<RunRecord>> {
        self.query_run_opt(
            "SELECT json_data FROM runs WHERE run_date = ?1 AND stage = ?2 AND state = 'succeeded'
             ORDER BY attempt_id DESC LIMIT 1",
            params![run_date.to_string(), stage.as_str()],
        )
    }

    fn query_run_opt(&self, sql: &str, args: impl rusqlite::Params) -> Result<Option<RunRecord>> {
        let mut stmt = self.db.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// All attempts for a run date across stages, ordered for stable audit
    /// comparison.
    pub fn records_for_date(&self, run_date: NaiveDate) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .db
            .prepare("SELECT json_data FROM runs WHERE run_date = ?1 ORDER BY stage, attempt_id")?;
        let rows = stmt.query_map(params![run_date.to_string()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }

    //=== Selections ===

    pub fn put_selection(&mut self, selection: &Selection) -> Result<()> {
        self.append_entry(&LedgerEntry::Selection(selection.clone()))?;
        Self::upsert_selection(&self.db, selection)?;
        Ok(())
    }

    pub fn get_selection(&self, run_date: NaiveDate) -> Result<Option<Selection>> {
        let mut stmt = self.db.prepare("SELECT json_data FROM selections WHERE run_date = ?1")?;
        let mut rows = stmt.query(params![run_date.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    //=== Artifacts ===

    pub fn put_artifact(&mut self, artifact: &Artifact) -> Result<()> {
        self.append_entry(&LedgerEntry::Artifact(artifact.clone()))?;
        Self::upsert_artifact(&self.db, artifact)?;
        Ok(())
    }

    pub fn get_artifact(&self, reference: &ArtifactRef) -> Result<Option<Artifact>> {
        let mut stmt = self.db.prepare("SELECT json_data FROM artifacts WHERE reference = ?1")?;
        let mut rows = stmt.query(params![reference.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    pub fn artifacts_for_date(&self, run_date: NaiveDate) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .db
            .prepare("SELECT json_data FROM artifacts WHERE run_date = ?1 ORDER BY reference")?;
        let rows = stmt.query_map(params![run_date.to_string()], |row| row.get::<_, String>(0))?;

        let mut artifacts = Vec::new();
        for json in rows {
            artifacts.push(serde_json::from_str(&json?)?);
        }
        Ok(artifacts)
    }

    //=== Deliveries ===

    /// Open a Pending delivery hold for the date; idempotent when one
    /// already exists.
    pub fn open_delivery(&mut self, run_date: NaiveDate, document_ref: ArtifactRef) -> Result<DeliveryRecord> {
        if let Some(existing) = self.get_delivery(run_date)? {
            return Ok(existing);
        }
        let record = DeliveryRecord {
            run_date,
            state: RunState::Pending,
            document_ref,
            requested_at: now_ms(),
            acked_at: None,
            ack_ref: None,
        };
        self.append_entry(&LedgerEntry::Delivery(record.clone()))?;
        Self::upsert_delivery(&self.db, &record)?;
        Ok(record)
    }

    pub fn get_delivery(&self, run_date: NaiveDate) -> Result<Option<DeliveryRecord>> {
        let mut stmt = self.db.prepare("SELECT json_data FROM deliveries WHERE run_date = ?1")?;
        let mut rows = stmt.query(params![run_date.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Complete a Pending delivery with an external acknowledgment and
    /// mirror the ack ref into the Succeeded GENERATE record.
    pub fn acknowledge_delivery(&mut self, run_date: NaiveDate, ack_ref: ArtifactRef) -> Result<DeliveryRecord> {
        let mut record = self
            .get_delivery(run_date)?
            .ok_or_else(|| MillrunError::Consistency(format!("no delivery record for {}", run_date)))?;
        if record.state != RunState::Pending {
            return Err(MillrunError::Consistency(format!(
                "delivery for {} is {}, not pending",
                run_date,
                record.state.as_str()
            )));
        }

        record.state = RunState::Succeeded;
        record.acked_at = Some(now_ms());
        record.ack_ref = Some(ack_ref.clone());
        self.append_entry(&LedgerEntry::Delivery(record.clone()))?;
        Self::upsert_delivery(&self.db, &record)?;

        // Register the ack so audit can resolve it like any other ref
        let ack_artifact = Artifact::new(
            ack_ref.clone(),
            crate::domain::artifact::ArtifactKind::Receipt,
            run_date,
            serde_json::json!({ "acknowledges": record.document_ref.as_str() }),
        );
        self.put_artifact(&ack_artifact)?;

        if let Some(generate) = self.latest_succeeded(run_date, Stage::Generate)? {
            self.append_artifact_ref(run_date, Stage::Generate, generate.attempt_id, ack_ref)?;
        }

        Ok(record)
    }

    //=== Topic cooldown ===

    /// Record a topic as written and drop records past retention.
    pub fn mark_topic_written(&mut self, topic: &str, written_on: NaiveDate, retention_days: u32) -> Result<()> {
        let record = TopicRecord {
            topic: topic.trim().to_lowercase(),
            written_on,
        };
        self.append_entry(&LedgerEntry::Topic(record.clone()))?;
        Self::upsert_topic(&self.db, &record)?;

        let cutoff = written_on - chrono::Duration::days(retention_days as i64);
        self.db
            .execute("DELETE FROM topics WHERE written_on < ?1", params![cutoff.to_string()])?;
        Ok(())
    }

    /// True while the topic was written within the cooldown window.
    pub fn topic_in_cooldown(&self, topic: &str, as_of: NaiveDate, cooldown_days: u32) -> Result<bool> {
        let cutoff = as_of - chrono::Duration::days(cooldown_days as i64);
        let written_on: Option<String> = self
            .db
            .query_row(
                "SELECT written_on FROM topics WHERE topic = ?1",
                params![topic.trim().to_lowercase()],
                |row| row.get(0),
            )
            .ok();

        match written_on {
            Some(d) => {
                let written: NaiveDate = d
                    .parse()
                    .map_err(|e| MillrunError::Storage(format!("bad topic date {}: {}", d, e)))?;
                Ok(written > cutoff)
            }
            None => Ok(false),
        }
    }

    //=== Publish counters ===

    pub fn publish_count(&self, run_date: NaiveDate, track: &str) -> Result<u32> {
        let count: Option<u32> = self
            .db
            .query_row(
                "SELECT count FROM publishes WHERE run_date = ?1 AND track = ?2",
                params![run_date.to_string(), track],
                |row| row.get(0),
            )
            .ok();
        Ok(count.unwrap_or(0))
    }

    pub fn increment_publish(&mut self, run_date: NaiveDate, track: &str) -> Result<u32> {
        let next = self.publish_count(run_date, track)? + 1;
        let record = PublishCount {
            run_date,
            track: track.to_string(),
            count: next,
        };
        self.append_entry(&LedgerEntry::Publish(record.clone()))?;
        Self::upsert_publish(&self.db, &record)?;
        Ok(next)
    }

    //=== Paid queue ===

    /// Queue a paid-report topic; duplicates of a queued topic are no-ops.
    pub fn enqueue_paid(&mut self, topic: &str, priority: &str) -> Result<bool> {
        let existing: Option<String> = self
            .db
            .query_row("SELECT status FROM paid_queue WHERE topic = ?1", params![topic], |row| {
                row.get(0)
            })
            .ok();
        if existing.is_some() {
            return Ok(false);
        }

        let request = PaidRequest {
            topic: topic.to_string(),
            priority: priority.to_string(),
            status: PaidStatus::Pending,
            enqueued_at: now_ms(),
            completed_at: None,
        };
        self.append_entry(&LedgerEntry::Paid(request.clone()))?;
        Self::upsert_paid(&self.db, &request)?;
        Ok(true)
    }

    /// The request currently being processed, if any. Retries of a failed
    /// GENERATE re-read this instead of draining the queue further.
    pub fn processing_paid(&self) -> Result<Option<PaidRequest>> {
        let json: Option<String> = self
            .db
            .query_row(
                "SELECT json_data FROM paid_queue WHERE status = 'processing' ORDER BY enqueued_at LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Take the oldest pending request and mark it processing. At-most-once
    /// under the ledger lock.
    pub fn dequeue_paid(&mut self) -> Result<Option<PaidRequest>> {
        let json: Option<String> = self
            .db
            .query_row(
                "SELECT json_data FROM paid_queue WHERE status = 'pending' ORDER BY enqueued_at LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        match json {
            Some(json) => {
                let mut request: PaidRequest = serde_json::from_str(&json)?;
                request.status = PaidStatus::Processing;
                self.append_entry(&LedgerEntry::Paid(request.clone()))?;
                Self::upsert_paid(&self.db, &request)?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    pub fn complete_paid(&mut self, topic: &str) -> Result<()> {
        let json: Option<String> = self
            .db
            .query_row("SELECT json_data FROM paid_queue WHERE topic = ?1", params![topic], |row| {
                row.get(0)
            })
            .ok();

        if let Some(json) = json {
            let mut request: PaidRequest = serde_json::from_str(&json)?;
            request.status = PaidStatus::Done;
            request.completed_at = Some(now_ms());
            self.append_entry(&LedgerEntry::Paid(request.clone()))?;
            Self::upsert_paid(&self.db, &request)?;
        }
        Ok(())
    }

    //=== Audit log ===

    /// Append an audit record. The log is immutable: re-running audit for
    /// a date adds a fresh record instead of touching history.
    pub fn append_audit(&mut self, record: &AuditRecord) -> Result<()> {
        self.append_entry(&LedgerEntry::Audit(record.clone()))?;
        Self::upsert_audit(&self.db, record)?;
        Ok(())
    }

    pub fn audits_for_date(&self, run_date: NaiveDate) -> Result<Vec<AuditRecord>> {
        let mut stmt = self
            .db
            .prepare("SELECT json_data FROM audits WHERE run_date = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![run_date.to_string()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::ArtifactKind;
    use crate::domain::finding::{AuditFinding, FindingKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn open(temp: &TempDir) -> StageLedger {
        StageLedger::open_at(temp.path()).unwrap()
    }

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn test_try_begin_first_attempt() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        let outcome = ledger
            .try_begin(date("2026-08-07"), Stage::Ingest, None, HOUR_MS, false)
            .unwrap();
        match outcome {
            BeginOutcome::Started(rec) => {
                assert_eq!(rec.attempt_id, 1);
                assert_eq!(rec.state, RunState::Running);
            }
            other => panic!("expected Started, got {:?}", other),
        }
    }

    #[test]
    fn test_try_begin_busy_while_running() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        let outcome = ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        assert!(matches!(outcome, BeginOutcome::Busy { attempt_id: 1 }));
    }

    #[test]
    fn test_try_begin_takes_over_stale_running() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        let rec = match ledger.try_begin(d, Stage::Select, None, HOUR_MS, false).unwrap() {
            BeginOutcome::Started(rec) => rec,
            other => panic!("expected Started, got {:?}", other),
        };

        // Backdate the running record past the staleness timeout
        let mut stale = rec.clone();
        stale.started_at -= 2 * HOUR_MS;
        ledger.write_run(&stale).unwrap();

        let outcome = ledger.try_begin(d, Stage::Select, None, HOUR_MS, false).unwrap();
        match outcome {
            BeginOutcome::Started(new_rec) => assert_eq!(new_rec.attempt_id, 2),
            other => panic!("expected Started, got {:?}", other),
        }

        // The crashed attempt was marked failed
        let crashed = ledger.get_run(d, Stage::Select, 1).unwrap().unwrap();
        assert_eq!(crashed.state, RunState::Failed);
        assert!(crashed.cause.as_deref().unwrap().contains("stale"));
    }

    #[test]
    fn test_try_begin_replays_succeeded() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        ledger
            .finish_success(d, Stage::Ingest, 1, vec![ArtifactRef::new("batch/2026-08-07-01")])
            .unwrap();

        let outcome = ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        match outcome {
            BeginOutcome::Replay(rec) => {
                assert_eq!(rec.attempt_id, 1);
                assert_eq!(rec.artifact_refs, vec![ArtifactRef::new("batch/2026-08-07-01")]);
            }
            other => panic!("expected Replay, got {:?}", other),
        }
    }

    #[test]
    fn test_try_begin_force_rerun_supersedes_only_on_success() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        ledger
            .finish_success(d, Stage::Ingest, 1, vec![ArtifactRef::new("batch/old")])
            .unwrap();

        // Forced rerun starts attempt 2
        let rec = match ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, true).unwrap() {
            BeginOutcome::Started(rec) => rec,
            other => panic!("expected Started, got {:?}", other),
        };
        assert_eq!(rec.attempt_id, 2);

        // Attempt 2 fails: the original success is still the replay target
        ledger.finish_failure(d, Stage::Ingest, 2, "connector down").unwrap();
        match ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap() {
            BeginOutcome::Replay(rec) => assert_eq!(rec.artifact_refs, vec![ArtifactRef::new("batch/old")]),
            other => panic!("expected Replay, got {:?}", other),
        }

        // A later forced rerun that succeeds supersedes it
        ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, true).unwrap();
        ledger
            .finish_success(d, Stage::Ingest, 3, vec![ArtifactRef::new("batch/new")])
            .unwrap();
        match ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap() {
            BeginOutcome::Replay(rec) => assert_eq!(rec.artifact_refs, vec![ArtifactRef::new("batch/new")]),
            other => panic!("expected Replay, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_success_requires_running() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
        ledger.finish_failure(d, Stage::Ingest, 1, "boom").unwrap();

        let result = ledger.finish_success(d, Stage::Ingest, 1, vec![]);
        assert!(matches!(result, Err(MillrunError::Consistency(_))));
    }

    #[test]
    fn test_cancel_running_attempt() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Generate, None, HOUR_MS, false).unwrap();
        let cancelled = ledger.cancel(d, Stage::Generate).unwrap().unwrap();
        assert_eq!(cancelled.state, RunState::Failed);
        assert!(cancelled.cause.as_deref().unwrap().contains("cancelled"));

        // Nothing left to cancel
        assert!(ledger.cancel(d, Stage::Generate).unwrap().is_none());
    }

    #[test]
    fn test_attempt_ids_are_monotonic() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        for expected in 1..=3u32 {
            let rec = match ledger.try_begin(d, Stage::Select, None, HOUR_MS, false).unwrap() {
                BeginOutcome::Started(rec) => rec,
                other => panic!("expected Started, got {:?}", other),
            };
            assert_eq!(rec.attempt_id, expected);
            ledger.finish_failure(d, Stage::Select, expected, "transient").unwrap();
        }
    }

    #[test]
    fn test_persistence_across_instances() {
        let temp = TempDir::new().unwrap();
        let d = date("2026-08-07");

        {
            let mut ledger = open(&temp);
            ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
            ledger
                .finish_success(d, Stage::Ingest, 1, vec![ArtifactRef::new("batch/1")])
                .unwrap();
        }

        {
            let ledger = open(&temp);
            let rec = ledger.latest_succeeded(d, Stage::Ingest).unwrap().unwrap();
            assert_eq!(rec.artifact_refs, vec![ArtifactRef::new("batch/1")]);
        }
    }

    #[test]
    fn test_rebuild_recovers_from_missing_index() {
        let temp = TempDir::new().unwrap();
        let d = date("2026-08-07");

        {
            let mut ledger = open(&temp);
            ledger.try_begin(d, Stage::Ingest, None, HOUR_MS, false).unwrap();
            ledger.finish_success(d, Stage::Ingest, 1, vec![]).unwrap();
            ledger.mark_topic_written("ai agents", d, 30).unwrap();
        }

        fs::remove_file(temp.path().join("ledger.db")).unwrap();

        let ledger = open(&temp);
        assert!(ledger.latest_succeeded(d, Stage::Ingest).unwrap().is_some());
        assert!(ledger.topic_in_cooldown("AI Agents", d, 7).unwrap());
    }

    #[test]
    fn test_selection_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        let selection = Selection {
            run_date: d,
            topic: "AI agents".to_string(),
            title_candidates: vec!["T1".to_string()],
            outline_ref: ArtifactRef::new("outline/2026-08-07-01"),
            mode: AnalysisMode::Full,
            item_keys: vec!["k1".to_string()],
        };
        ledger.put_selection(&selection).unwrap();

        let loaded = ledger.get_selection(d).unwrap().unwrap();
        assert_eq!(loaded, selection);
        assert!(ledger.get_selection(date("2026-08-08")).unwrap().is_none());
    }

    #[test]
    fn test_artifact_roundtrip_and_date_query() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        let artifact = Artifact::new(ArtifactRef::new("document/2026-08-07-01"), ArtifactKind::Document, d, json!({}));
        ledger.put_artifact(&artifact).unwrap();

        assert_eq!(ledger.get_artifact(&artifact.reference).unwrap().unwrap(), artifact);
        assert_eq!(ledger.artifacts_for_date(d).unwrap().len(), 1);
        assert!(ledger.artifacts_for_date(date("2026-08-08")).unwrap().is_empty());
    }

    #[test]
    fn test_delivery_hold_until_ack() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        // Ack without a hold is a consistency error
        assert!(ledger.acknowledge_delivery(d, ArtifactRef::new("ack/1")).is_err());

        let record = ledger.open_delivery(d, ArtifactRef::new("report/2026-08-07-01")).unwrap();
        assert_eq!(record.state, RunState::Pending);

        // Opening again is idempotent
        let again = ledger.open_delivery(d, ArtifactRef::new("report/other")).unwrap();
        assert_eq!(again.document_ref, ArtifactRef::new("report/2026-08-07-01"));

        let acked = ledger.acknowledge_delivery(d, ArtifactRef::new("ack/1")).unwrap();
        assert_eq!(acked.state, RunState::Succeeded);
        assert_eq!(acked.ack_ref, Some(ArtifactRef::new("ack/1")));

        // Double-ack is a consistency error
        assert!(ledger.acknowledge_delivery(d, ArtifactRef::new("ack/2")).is_err());
    }

    #[test]
    fn test_ack_mirrors_into_generate_record() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger.try_begin(d, Stage::Generate, None, HOUR_MS, false).unwrap();
        ledger
            .finish_success(d, Stage::Generate, 1, vec![ArtifactRef::new("report/1")])
            .unwrap();
        ledger.open_delivery(d, ArtifactRef::new("report/1")).unwrap();

        ledger.acknowledge_delivery(d, ArtifactRef::new("ack/1")).unwrap();

        let generate = ledger.latest_succeeded(d, Stage::Generate).unwrap().unwrap();
        assert!(generate.artifact_refs.contains(&ArtifactRef::new("ack/1")));
    }

    #[test]
    fn test_topic_cooldown_window() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        ledger.mark_topic_written("AI Agents", date("2026-08-01"), 30).unwrap();

        // Within 7 days of 2026-08-01
        assert!(ledger.topic_in_cooldown("ai agents", date("2026-08-07"), 7).unwrap());
        // Past the window
        assert!(!ledger.topic_in_cooldown("ai agents", date("2026-08-09"), 7).unwrap());
        // Unknown topic never cools
        assert!(!ledger.topic_in_cooldown("robotics", date("2026-08-07"), 7).unwrap());
    }

    #[test]
    fn test_topic_retention_prunes_old_records() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        ledger.mark_topic_written("old topic", date("2026-06-01"), 30).unwrap();
        ledger.mark_topic_written("new topic", date("2026-08-07"), 30).unwrap();

        // The old record was pruned by the second write's retention pass
        assert!(!ledger.topic_in_cooldown("old topic", date("2026-06-02"), 7).unwrap());
        assert!(ledger.topic_in_cooldown("new topic", date("2026-08-07"), 7).unwrap());
    }

    #[test]
    fn test_publish_counters() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        assert_eq!(ledger.publish_count(d, "free").unwrap(), 0);
        assert_eq!(ledger.increment_publish(d, "free").unwrap(), 1);
        assert_eq!(ledger.increment_publish(d, "free").unwrap(), 2);
        assert_eq!(ledger.increment_publish(d, "paid").unwrap(), 1);
        assert_eq!(ledger.publish_count(d, "free").unwrap(), 2);
        // Counters are per-date
        assert_eq!(ledger.publish_count(date("2026-08-08"), "free").unwrap(), 0);
    }

    #[test]
    fn test_paid_queue_at_most_once_dequeue() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        assert!(ledger.enqueue_paid("AI in logistics", "normal").unwrap());
        // Duplicate enqueue is a no-op
        assert!(!ledger.enqueue_paid("AI in logistics", "high").unwrap());

        let first = ledger.dequeue_paid().unwrap().unwrap();
        assert_eq!(first.topic, "AI in logistics");
        assert_eq!(first.status, PaidStatus::Processing);

        // Nothing pending remains
        assert!(ledger.dequeue_paid().unwrap().is_none());

        ledger.complete_paid("AI in logistics").unwrap();
        assert!(ledger.dequeue_paid().unwrap().is_none());
    }

    #[test]
    fn test_paid_queue_fifo_order() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        ledger.enqueue_paid("first", "normal").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        ledger.enqueue_paid("second", "normal").unwrap();

        assert_eq!(ledger.dequeue_paid().unwrap().unwrap().topic, "first");
        assert_eq!(ledger.dequeue_paid().unwrap().unwrap().topic, "second");
    }

    #[test]
    fn test_audit_log_is_append_only() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        let first = AuditRecord::new(d, vec![]);
        ledger.append_audit(&first).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = AuditRecord::new(
            d,
            vec![AuditFinding::new(d, Stage::Generate, FindingKind::MissingArtifact, "doc gone")],
        );
        ledger.append_audit(&second).unwrap();

        let audits = ledger.audits_for_date(d).unwrap();
        assert_eq!(audits.len(), 2);
        assert!(audits[0].is_clean());
        assert!(!audits[1].is_clean());
    }

    #[test]
    fn test_records_for_date_excludes_other_dates() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);

        ledger
            .try_begin(date("2026-08-07"), Stage::Ingest, None, HOUR_MS, false)
            .unwrap();
        ledger
            .try_begin(date("2026-08-08"), Stage::Ingest, None, HOUR_MS, false)
            .unwrap();

        let records = ledger.records_for_date(date("2026-08-07")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_date, date("2026-08-07"));
    }

    #[test]
    fn test_mode_is_persisted_on_run_record() {
        let temp = TempDir::new().unwrap();
        let mut ledger = open(&temp);
        let d = date("2026-08-07");

        ledger
            .try_begin(d, Stage::Select, Some(AnalysisMode::Full), HOUR_MS, false)
            .unwrap();
        let rec = ledger.latest_attempt(d, Stage::Select).unwrap().unwrap();
        assert_eq!(rec.mode, Some(AnalysisMode::Full));
    }
}

//! Item Store with JSONL append log and SQLite index.
//!
//! The store holds every candidate item ever sighted, keyed globally by
//! dedup_key. The JSONL file is the source of truth (one line per state
//! change, last record wins); the SQLite index is rebuilt from it whenever
//! the logged line count disagrees with the indexed one. The dedup_key
//! PRIMARY KEY is the backstop for the at-most-once sighting guarantee.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{Connection, params};

use crate::domain::item::{Item, ItemStatus};
use crate::error::{MillrunError, Result};

/// Durable record of ingested candidate items and their dedup keys.
pub struct ItemStore {
    jsonl_path: PathBuf,
    db: Connection,
}

impl ItemStore {
    /// Open or create an ItemStore at the given directory.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;

        let jsonl_path = base_dir.join("items.jsonl");
        let db_path = base_dir.join("items.db");

        let db = Connection::open(&db_path)?;
        Self::init_schema(&db)?;

        let mut store = Self { jsonl_path, db };
        store.rebuild_index_if_needed()?;

        Ok(store)
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                dedup_key TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                status TEXT NOT NULL,
                run_date TEXT NOT NULL,
                avg_score REAL NOT NULL,
                created_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
            CREATE INDEX IF NOT EXISTS idx_items_run_date ON items(run_date);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Rebuild the SQLite index when the JSONL line count does not match
    /// the count the index was last built from.
    fn rebuild_index_if_needed(&mut self) -> Result<()> {
        if !self.jsonl_path.exists() {
            return Ok(());
        }

        let jsonl_lines = self.count_jsonl_lines()?;
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

    fn count_jsonl_lines(&self) -> Result<usize> {
        let file = File::open(&self.jsonl_path)?;
        Ok(BufReader::new(file).lines().count())
    }

    /// Replay the whole log; the last record per dedup_key wins.
    fn rebuild_index(&mut self, jsonl_lines: usize) -> Result<()> {
        let mut latest: HashMap<String, Item> = HashMap::new();

        let file = File::open(&self.jsonl_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let item: Item = serde_json::from_str(&line)?;
            latest.insert(item.dedup_key.clone(), item);
        }

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM items", [])?;
        for item in latest.values() {
            Self::upsert_into_db(&tx, item)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('indexed_lines', ?1)",
            params![jsonl_lines.to_string()],
        )?;
        tx.commit()?;

        Ok(())
    }

    fn upsert_into_db(db: &Connection, item: &Item) -> Result<()> {
        let json_data = serde_json::to_string(item)?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO items
            (dedup_key, source_id, status, run_date, avg_score, created_at, json_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                item.dedup_key,
                item.source_id,
                item.status.as_str(),
                item.run_date.to_string(),
                item.avg_score(),
                item.created_at,
                json_data,
            ],
        )?;
        Ok(())
    }

    fn append_line(jsonl_path: &Path, json: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(jsonl_path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn bump_indexed_lines(db: &Connection) -> Result<()> {
        db.execute(
            r#"
            INSERT INTO meta (key, value) VALUES ('indexed_lines', '1')
            ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
            "#,
            [],
        )?;
        Ok(())
    }

    /// Atomic check-and-insert of a first sighting.
    ///
    /// Returns false when the dedup_key is already present (any status) -
    /// the caller's item is a duplicate and must not re-enter the pipeline.
    pub fn insert_new(&mut self, item: &Item) -> Result<bool> {
        let json_data = serde_json::to_string(item)?;
        let jsonl_path = self.jsonl_path.clone();

        let tx = self.db.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO items
            (dedup_key, source_id, status, run_date, avg_score, created_at, json_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
            params![
                item.dedup_key,
                item.source_id,
                item.status.as_str(),
                item.run_date.to_string(),
                item.avg_score(),
                item.created_at,
                json_data,
            ],
        )?;

        if inserted == 0 {
            // Key already claimed; dropping the transaction rolls back.
            return Ok(false);
        }

        // Log before committing the index; a failed commit leaves the line
        // counts disagreeing and the next open rebuilds from the log.
        Self::append_line(&jsonl_path, &json_data)?;
        Self::bump_indexed_lines(&tx)?;
        tx.commit()?;
        Ok(true)
    }

    /// Update an existing item (scoring, admission decision).
    ///
    /// Terminal records are immutable; updating one is a consistency bug
    /// in the caller.
    pub fn update(&mut self, item: &Item) -> Result<()> {
        let existing = self
            .get(&item.dedup_key)?
            .ok_or_else(|| MillrunError::Storage(format!("item not found: {}", item.dedup_key)))?;

        if existing.status.is_terminal() {
            return Err(MillrunError::Consistency(format!(
                "item {} is already {} and immutable",
                item.dedup_key,
                existing.status.as_str()
            )));
        }

        Self::append_line(&self.jsonl_path, &serde_json::to_string(item)?)?;
        Self::upsert_into_db(&self.db, item)?;
        Self::bump_indexed_lines(&self.db)?;
        Ok(())
    }

    /// Look up an item by dedup_key.
    pub fn get(&self, dedup_key: &str) -> Result<Option<Item>> {
        let mut stmt = self.db.prepare("SELECT json_data FROM items WHERE dedup_key = ?1")?;
        let mut rows = stmt.query(params![dedup_key])?;

        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// All items sighted under the given run date.
    pub fn items_for_date(&self, run_date: NaiveDate) -> Result<Vec<Item>> {
        self.query_items("SELECT json_data FROM items WHERE run_date = ?1 ORDER BY dedup_key", params![
            run_date.to_string()
        ])
    }

    /// Admitted items with run_date in [end - (days-1), end].
    ///
    /// Ingestion runs several times a day and SELECT may be configured to
    /// look back across a window of prior dates.
    pub fn admitted_in_window(&self, end: NaiveDate, days: u32) -> Result<Vec<Item>> {
        let start = end - chrono::Duration::days(days.saturating_sub(1) as i64);
        self.query_items(
            "SELECT json_data FROM items WHERE status = 'admitted' AND run_date >= ?1 AND run_date <= ?2 ORDER BY avg_score DESC, dedup_key",
            params![start.to_string(), end.to_string()],
        )
    }

    fn query_items(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Item>> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for json in rows {
            items.push(serde_json::from_str(&json?)?);
        }
        Ok(items)
    }

    /// Count items with the given status.
    pub fn count_by_status(&self, status: ItemStatus) -> Result<u64> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM items WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Total number of tracked dedup keys.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.db.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

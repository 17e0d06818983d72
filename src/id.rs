//! Timestamp and reference generation utilities
//!
//! Artifact references are deterministic for a given (kind, run date,
//! attempt) so that idempotent replay returns byte-identical refs.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// Build an opaque artifact reference.
///
/// Format: `{kind}/{run_date}-{attempt:02}`
/// Example: `draft/2026-08-07-01`
pub fn artifact_ref(kind: &str, run_date: NaiveDate, attempt_id: u32) -> String {
    format!("{}/{}-{:02}", kind, run_date, attempt_id)
}

/// Build an audit record id.
///
/// Audit history is append-only, so each record carries the wall-clock
/// time it was produced: `audit/{run_date}/{timestamp_ms}`.
pub fn audit_id(run_date: NaiveDate) -> String {
    format!("audit/{}/{}", run_date, now_ms())
}

/// Hash arbitrary text into a short hex digest.
///
/// Used for dedup keys and content-addressed references.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

//! Candidate item records and dedup keys
//!
//! An Item is a single unit of candidate content sighted by a source
//! connector. Its dedup key is global: once a key has been admitted or
//! rejected, any later sighting of the same key is a no-op.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::collab::RawItem;
use crate::id::{content_hash, now_ms};

/// Metrics every item must carry before it can pass the admission gate.
pub const REQUIRED_METRICS: [&str; 3] = ["relevance", "asymmetry", "potential"];

/// A candidate unit of content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// Normalized hash of the canonicalized URL (or title when the URL is
    /// missing); the global admission key
    pub dedup_key: String,

    /// Stable identifier from the origin connector
    pub source_id: String,

    pub title: String,
    pub url: String,
    pub summary: String,

    /// Connector tag, e.g. "rss/international"
    pub source: String,

    /// Publication date as reported by the connector, if any
    pub published_at: Option<String>,

    /// Search keyword that surfaced this item, if any
    pub keyword: Option<String>,

    /// Logical date the item was first sighted under
    pub run_date: NaiveDate,

    /// Named metric scores, each absent until the scorer has run
    pub scores: BTreeMap<String, f64>,

    pub status: ItemStatus,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

/// Item lifecycle states.
///
/// Admitted and Rejected are terminal: the record is immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    New,
    Scored,
    Admitted,
    Rejected,
}

impl ItemStatus {
    /// Returns true once the admission decision has been made
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Admitted | ItemStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Scored => "scored",
            ItemStatus::Admitted => "admitted",
            ItemStatus::Rejected => "rejected",
        }
    }
}

/// Compute the dedup key for a candidate.
///
/// The URL is canonicalized (scheme/host lowercased, tracking params and
/// fragments stripped, trailing slash dropped) and hashed; items without a
/// URL fall back to the normalized title.
pub fn dedup_key(url: &str, title: &str) -> String {
    let canonical = canonicalize_url(url);
    if canonical.is_empty() {
        content_hash(&title.trim().to_lowercase())
    } else {
        content_hash(&canonical)
    }
}

fn canonicalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    // Drop the fragment first, then the tracking query params.
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let (base, query) = match without_fragment.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (without_fragment, None),
    };

    // Scheme and host are case-insensitive; the path is not.
    let base = match base.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = rest.split_once('/').map_or((rest, ""), |(h, p)| (h, p));
            if path.is_empty() {
                format!("{}://{}", scheme.to_lowercase(), host.to_lowercase())
            } else {
                format!("{}://{}/{}", scheme.to_lowercase(), host.to_lowercase(), path)
            }
        }
        None => base.to_string(),
    };
    let base = base.trim_end_matches('/').to_string();

    let kept: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("utm_") && !p.starts_with("ref=") && !p.starts_with("fbclid="))
        .collect();

    if kept.is_empty() {
        base
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

impl Item {
    /// Build an item from a connector result, sighted under the given date.
    pub fn from_raw(raw: RawItem, run_date: NaiveDate) -> Self {
        Self {
            dedup_key: dedup_key(&raw.url, &raw.title),
            source_id: raw.source_id,
            title: raw.title,
            url: raw.url,
            summary: raw.summary,
            source: raw.source,
            published_at: raw.published_at,
            keyword: raw.keyword,
            run_date,
            scores: BTreeMap::new(),
            status: ItemStatus::New,
            created_at: now_ms(),
        }
    }

    /// Attach scorer output and move to Scored.
    pub fn apply_scores(&mut self, scores: BTreeMap<String, f64>) {
        self.scores = scores;
        self.status = ItemStatus::Scored;
    }

    /// Average across the required metrics; 0.0 while unscored.
    pub fn avg_score(&self) -> f64 {
        let present: Vec<f64> = REQUIRED_METRICS
            .iter()
            .filter_map(|m| self.scores.get(*m).copied())
            .collect();
        if present.is_empty() {
            return 0.0;
        }
        present.iter().sum::<f64>() / present.len() as f64
    }

    /// True when every required metric has been scored.
    pub fn fully_scored(&self) -> bool {
        REQUIRED_METRICS.iter().all(|m| self.scores.contains_key(*m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(url: &str, title: &str) -> RawItem {
        RawItem {
            source_id: "src-1".to_string(),
            title: title.to_string(),
            url: url.to_string(),
            summary: "summary".to_string(),
            source: "test".to_string(),
            published_at: None,
            keyword: None,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_item_status_is_terminal() {
        assert!(ItemStatus::Admitted.is_terminal());
        assert!(ItemStatus::Rejected.is_terminal());
        assert!(!ItemStatus::New.is_terminal());
        assert!(!ItemStatus::Scored.is_terminal());
    }

    #[test]
    fn test_dedup_key_strips_tracking_params() {
        let plain = dedup_key("https://example.com/story", "t");
        let tracked = dedup_key("https://example.com/story?utm_source=feed&utm_medium=rss", "t");
        assert_eq!(plain, tracked);
    }

    #[test]
    fn test_dedup_key_keeps_meaningful_params() {
        let a = dedup_key("https://example.com/story?id=1", "t");
        let b = dedup_key("https://example.com/story?id=2", "t");
        assert_ne!(a, b);
    }

    #[test]
    fn test_dedup_key_host_case_insensitive() {
        let a = dedup_key("https://Example.COM/Story", "t");
        let b = dedup_key("https://example.com/Story", "t");
        assert_eq!(a, b);
    }

    #[test]
    fn test_dedup_key_path_case_sensitive() {
        let a = dedup_key("https://example.com/Story", "t");
        let b = dedup_key("https://example.com/story", "t");
        assert_ne!(a, b);
    }

    #[test]
    fn test_dedup_key_ignores_fragment_and_trailing_slash() {
        let a = dedup_key("https://example.com/story/", "t");
        let b = dedup_key("https://example.com/story#section-2", "t");
        assert_eq!(a, b);
    }

    #[test]
    fn test_dedup_key_falls_back_to_title() {
        let a = dedup_key("", "  Big Launch  ");
        let b = dedup_key("", "big launch");
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_raw_starts_new_and_unscored() {
        let item = Item::from_raw(raw("https://example.com/a", "A"), date("2026-08-07"));
        assert_eq!(item.status, ItemStatus::New);
        assert!(item.scores.is_empty());
        assert!(!item.fully_scored());
        assert_eq!(item.avg_score(), 0.0);
    }

    #[test]
    fn test_apply_scores_moves_to_scored() {
        let mut item = Item::from_raw(raw("https://example.com/a", "A"), date("2026-08-07"));
        item.apply_scores(BTreeMap::from([
            ("relevance".to_string(), 8.0),
            ("asymmetry".to_string(), 7.0),
            ("potential".to_string(), 6.0),
        ]));
        assert_eq!(item.status, ItemStatus::Scored);
        assert!(item.fully_scored());
        assert!((item.avg_score() - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_avg_score_with_partial_metrics() {
        let mut item = Item::from_raw(raw("https://example.com/a", "A"), date("2026-08-07"));
        item.apply_scores(BTreeMap::from([("relevance".to_string(), 9.0)]));
        assert!(!item.fully_scored());
        assert!((item.avg_score() - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_item_serialization_roundtrip() {
        let mut item = Item::from_raw(raw("https://example.com/a", "A"), date("2026-08-07"));
        item.apply_scores(BTreeMap::from([("relevance".to_string(), 8.5)]));

        let json = serde_json::to_string(&item).expect("serialize");
        let parsed: Item = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_item_status_serialization() {
        assert_eq!(serde_json::to_string(&ItemStatus::Admitted).unwrap(), "\"admitted\"");
        assert_eq!(serde_json::to_string(&ItemStatus::Rejected).unwrap(), "\"rejected\"");
    }
}

//! Dedup & Admission Gate
//!
//! The gate makes the admission decision for a scored item: new keys above
//! the score threshold are admitted, new keys below it are rejected and
//! recorded so they are never rescored, and keys seen on any prior run
//! date bounce as duplicates. The whole decision runs under the item store
//! lock, so concurrent admissions of one dedup_key serialize and exactly
//! one wins.

use std::sync::{Arc, Mutex};

use crate::domain::item::{Item, ItemStatus, REQUIRED_METRICS};
use crate::error::{MillrunError, Result};
use crate::store::ItemStore;

/// Admission decision for a candidate item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The dedup_key was already admitted or rejected on this or any prior
    /// run date
    RejectedDuplicate,
    /// A required metric (or the average) is below the threshold; recorded
    /// so later sightings short-circuit as duplicates
    RejectedLowScore,
}

/// Admission policy knobs.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    /// Minimum average across the required metrics
    pub score_threshold: f64,
    /// Minimum value for any single required metric
    pub metric_floor: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            score_threshold: 6.5,
            metric_floor: 1.0,
        }
    }
}

/// Decides whether an incoming item is new, previously seen, or below
/// threshold.
pub struct AdmissionGate {
    store: Arc<Mutex<ItemStore>>,
    policy: GatePolicy,
}

impl AdmissionGate {
    pub fn new(store: Arc<Mutex<ItemStore>>, policy: GatePolicy) -> Self {
        Self { store, policy }
    }

    /// Admit or reject a scored item. Atomic per dedup_key: the lookup and
    /// the insert/finalize happen under one store lock.
    ///
    /// The item must carry a dedup_key and a full score set; anything else
    /// is a caller contract violation.
    pub fn admit(&self, item: &Item) -> Result<Admission> {
        if item.dedup_key.is_empty() {
            return Err(MillrunError::PermanentInput("item has no dedup_key".to_string()));
        }
        if !item.fully_scored() {
            return Err(MillrunError::PermanentInput(format!(
                "item {} missing required metrics {:?}",
                item.dedup_key, REQUIRED_METRICS
            )));
        }

        let decision = self.decide(item);

        let mut store = self.store.lock().map_err(|e| MillrunError::Storage(e.to_string()))?;

        match store.get(&item.dedup_key)? {
            // Terminal record from this or a prior run date: the admission
            // decision stands, re-sighting is a no-op
            Some(existing) if existing.status.is_terminal() => Ok(Admission::RejectedDuplicate),

            // Our own in-flight sighting record: finalize it
            Some(_) => {
                let mut finalized = item.clone();
                finalized.status = decision_status(decision);
                store.update(&finalized)?;
                Ok(decision)
            }

            // First sighting: the insert is the atomic claim; losing the
            // race means someone else owns the key now
            None => {
                let mut finalized = item.clone();
                finalized.status = decision_status(decision);
                if store.insert_new(&finalized)? {
                    Ok(decision)
                } else {
                    Ok(Admission::RejectedDuplicate)
                }
            }
        }
    }

    fn decide(&self, item: &Item) -> Admission {
        let below_floor = REQUIRED_METRICS
            .iter()
            .filter_map(|m| item.scores.get(*m))
            .any(|v| *v < self.policy.metric_floor);

        if below_floor || item.avg_score() < self.policy.score_threshold {
            Admission::RejectedLowScore
        } else {
            Admission::Admitted
        }
    }
}

fn decision_status(decision: Admission) -> ItemStatus {
    match decision {
        Admission::Admitted => ItemStatus::Admitted,
        Admission::RejectedLowScore | Admission::RejectedDuplicate => ItemStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::RawItem;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn scored_item(url: &str, run_date: &str, score: f64) -> Item {
        let mut item = Item::from_raw(
            RawItem {
                source_id: "src".to_string(),
                title: url.to_string(),
                url: url.to_string(),
                summary: String::new(),
                source: "test".to_string(),
                published_at: None,
                keyword: None,
            },
            date(run_date),
        );
        item.apply_scores(BTreeMap::from([
            ("relevance".to_string(), score),
            ("asymmetry".to_string(), score),
            ("potential".to_string(), score),
        ]));
        item
    }

    fn gate_with_store() -> (AdmissionGate, Arc<Mutex<ItemStore>>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(ItemStore::open_at(temp.path()).unwrap()));
        let gate = AdmissionGate::new(store.clone(), GatePolicy::default());
        (gate, store, temp)
    }

    #[test]
    fn test_admit_high_score_item() {
        let (gate, store, _temp) = gate_with_store();
        let item = scored_item("https://example.com/a", "2026-08-07", 8.0);

        assert_eq!(gate.admit(&item).unwrap(), Admission::Admitted);

        let stored = store.lock().unwrap().get(&item.dedup_key).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Admitted);
    }

    #[test]
    fn test_reject_low_score_item_and_record_it() {
        let (gate, store, _temp) = gate_with_store();
        let item = scored_item("https://example.com/low", "2026-08-07", 4.0);

        assert_eq!(gate.admit(&item).unwrap(), Admission::RejectedLowScore);

        // Recorded as rejected so it is never rescored
        let stored = store.lock().unwrap().get(&item.dedup_key).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Rejected);
    }

    #[test]
    fn test_resighting_admitted_key_is_duplicate() {
        let (gate, _store, _temp) = gate_with_store();
        let item = scored_item("https://example.com/a", "2026-08-07", 8.0);
        gate.admit(&item).unwrap();

        // Same URL sighted on a later day
        let resight = scored_item("https://example.com/a", "2026-08-08", 9.0);
        assert_eq!(gate.admit(&resight).unwrap(), Admission::RejectedDuplicate);
    }

    #[test]
    fn test_resighting_rejected_key_is_duplicate_not_rescored() {
        let (gate, store, _temp) = gate_with_store();
        let item = scored_item("https://example.com/low", "2026-08-07", 4.0);
        gate.admit(&item).unwrap();

        // A better score on re-sighting does not resurrect the item
        let resight = scored_item("https://example.com/low", "2026-08-08", 9.5);
        assert_eq!(gate.admit(&resight).unwrap(), Admission::RejectedDuplicate);

        let stored = store.lock().unwrap().get(&item.dedup_key).unwrap().unwrap();
        assert_eq!(stored.run_date, date("2026-08-07"));
    }

    #[test]
    fn test_finalizes_own_sighting_record() {
        let (gate, store, _temp) = gate_with_store();

        // Ingest already recorded the sighting before scoring
        let unsighted = {
            let mut item = scored_item("https://example.com/a", "2026-08-07", 8.0);
            item.status = ItemStatus::Scored;
            item
        };
        store.lock().unwrap().insert_new(&unsighted).unwrap();

        assert_eq!(gate.admit(&unsighted).unwrap(), Admission::Admitted);
        let stored = store.lock().unwrap().get(&unsighted.dedup_key).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Admitted);
    }

    #[test]
    fn test_metric_floor_rejects_despite_good_average() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(ItemStore::open_at(temp.path()).unwrap()));
        let gate = AdmissionGate::new(
            store,
            GatePolicy {
                score_threshold: 6.5,
                metric_floor: 3.0,
            },
        );

        // One metric under the floor, average comfortably above threshold
        let mut item = scored_item("https://example.com/a", "2026-08-07", 8.0);
        item.scores.insert("asymmetry".to_string(), 1.0);
        item.scores.insert("relevance".to_string(), 10.0);
        item.scores.insert("potential".to_string(), 10.0);
        assert!(item.avg_score() >= 6.5);

        assert_eq!(gate.admit(&item).unwrap(), Admission::RejectedLowScore);
    }

    #[test]
    fn test_unscored_item_is_contract_violation() {
        let (gate, _store, _temp) = gate_with_store();
        let mut item = scored_item("https://example.com/a", "2026-08-07", 8.0);
        item.scores.remove("potential");

        assert!(matches!(gate.admit(&item), Err(MillrunError::PermanentInput(_))));
    }

    #[test]
    fn test_missing_dedup_key_is_contract_violation() {
        let (gate, _store, _temp) = gate_with_store();
        let mut item = scored_item("https://example.com/a", "2026-08-07", 8.0);
        item.dedup_key = String::new();

        assert!(matches!(gate.admit(&item), Err(MillrunError::PermanentInput(_))));
    }

    #[test]
    fn test_concurrent_admissions_exactly_one_wins() {
        let (gate, store, _temp) = gate_with_store();
        let gate = Arc::new(gate);

        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = gate.clone();
            handles.push(std::thread::spawn(move || {
                // All threads admit the same URL, sighted on different days
                let item = scored_item("https://example.com/contested", &format!("2026-08-{:02}", i + 1), 8.0);
                gate.admit(&item).unwrap()
            }));
        }

        let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| **r == Admission::Admitted).count();
        let duplicates = results.iter().filter(|r| **r == Admission::RejectedDuplicate).count();

        assert_eq!(admitted, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(store.lock().unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_batch_with_prior_day_duplicates() {
        let (gate, _store, _temp) = gate_with_store();

        // Two items admitted yesterday
        gate.admit(&scored_item("https://example.com/seen-1", "2026-08-06", 8.0)).unwrap();
        gate.admit(&scored_item("https://example.com/seen-2", "2026-08-06", 8.0)).unwrap();

        // Today's batch of 5: two share keys with yesterday's admissions
        let batch = [
            scored_item("https://example.com/seen-1", "2026-08-07", 8.0),
            scored_item("https://example.com/seen-2", "2026-08-07", 8.0),
            scored_item("https://example.com/fresh-1", "2026-08-07", 8.0),
            scored_item("https://example.com/fresh-2", "2026-08-07", 8.0),
            scored_item("https://example.com/fresh-3", "2026-08-07", 8.0),
        ];

        let results: Vec<Admission> = batch.iter().map(|i| gate.admit(i).unwrap()).collect();
        let admitted = results.iter().filter(|r| **r == Admission::Admitted).count();
        let duplicates = results.iter().filter(|r| **r == Admission::RejectedDuplicate).count();

        assert_eq!(admitted, 3);
        assert_eq!(duplicates, 2);
    }
}

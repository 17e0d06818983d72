//! Durable stores
//!
//! Both stores use the same dual-storage layout: a JSONL append-only log
//! as the source of truth, plus a SQLite index for queries, rebuilt from
//! the log whenever the two disagree. The SQLite primary keys double as
//! the atomic check-and-insert / compare-and-set points.

pub mod item_store;
pub mod ledger;

pub use item_store::ItemStore;
pub use ledger::{BeginOutcome, DeliveryRecord, PaidRequest, PaidStatus, StageLedger};

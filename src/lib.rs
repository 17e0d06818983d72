//! Millrun - pipeline state & consistency engine
//!
//! Millrun tracks per-item and per-run state across the four stages of a
//! content pipeline (ingest, select, generate, audit), guaranteeing
//! idempotent re-execution, at-most-once admission of external items, and
//! reconciliation of stage outputs against persisted state.

pub mod audit;
pub mod cli;
pub mod collab;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod gate;
pub mod id;
pub mod schedule;
pub mod store;

pub use error::{MillrunError, Result};

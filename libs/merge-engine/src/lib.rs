//! Chronik merge engine
//!
//! Accumulates structured clinical facts extracted from many documents into
//! one cumulative per-subject [`Record`](chronik_models::Record) without
//! silently losing prior data. The engine:
//!
//! - detects semantic conflicts between incoming and existing facts
//!   ([`conflict`]),
//! - resolves them by policy ([`conflict::ConflictResolver`]),
//! - collapses exact and near-duplicate facts ([`dedup`]),
//! - applies the net change under per-subject mutual exclusion with
//!   snapshot-backed rollback ([`tx`]),
//! - and reports structured outcomes ([`merge::MergeResult`],
//!   [`tx::TransactionResult`]).
//!
//! Scheduling is synchronous per call: one `merge` runs to completion. An
//! outer orchestrator may merge different subjects concurrently; writers to
//! the same subject serialize on that subject's lock.

pub mod audit;
pub mod config;
pub mod conflict;
pub mod dedup;
pub mod error;
pub mod merge;
pub mod store;
pub mod tx;

pub use config::MergeConfig;
pub use error::{Error, Result};
pub use merge::{MergeContext, MergeEngine, MergeResult, MergeState};

//! Conflict detection and resolution
//!
//! Pairwise comparison of an incoming fact against the existing fact it
//! matched ([`ConflictDetector`]), and policy-driven resolution of whatever
//! disagreements were found ([`ConflictResolver`]). Both are pure and
//! synchronous; nothing here touches storage.

mod detector;
mod resolver;
mod types;

pub use detector::ConflictDetector;
pub use resolver::{ConflictResolver, OverallAction, ResolutionOutcome};
pub use types::{
    ConflictDetail, ConflictResult, ConflictType, Resolution, ResolutionAction, ReviewMetadata,
    ReviewPriority, Severity, StrategyKind,
};

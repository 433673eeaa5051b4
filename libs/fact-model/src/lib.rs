//! Clinical fact and record data model
//!
//! Pure data representation for the Chronik merge engine: typed clinical
//! facts (conditions, observations, medications, ...) and the cumulative
//! per-subject [`Record`] they accumulate into. No merge logic lives here —
//! just the value types, their identities, and structural validation.

mod fact;
mod record;

pub use fact::{Coding, Fact, FactIdentity, FactKind, Quantity};
pub use record::{Record, RecordError};

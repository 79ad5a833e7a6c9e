//! Application layer: the settlement engine and the services around it.
//!
//! [`engine::SettlementEngine`] is the single entry point for money movement.
//! It serializes work per subject with [`locks::SubjectLocks`] and persists
//! through the [`crate::domain::ports::LedgerStore`] port. The sweeper and the
//! reporting helpers build on top of it.

pub mod engine;
pub mod locks;
pub mod reporting;
pub mod requests;
pub mod sweeper;

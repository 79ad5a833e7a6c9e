//! Domain layer: value types, state machines and the storage port.
//!
//! Nothing in here performs I/O. The application layer loads records through
//! [`ports::LedgerStore`], mutates them with the rules defined here and hands
//! the result back as a single [`ports::Changeset`].

pub mod account;
pub mod ids;
pub mod payout;
pub mod ports;
pub mod session;
pub mod transaction;

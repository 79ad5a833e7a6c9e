//! Adapters between the outside world and the settlement engine.

pub mod csv;

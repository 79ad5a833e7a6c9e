//! Batch CSV surface used by the `process` command.

pub mod balance_writer;
pub mod command_reader;
pub mod dispatch;

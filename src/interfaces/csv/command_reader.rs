use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Open,
    Topup,
    Reserve,
    Capture,
    DirectCapture,
    Release,
    Refund,
    Sweep,
    Payout,
}

/// One row of a batch file. Which columns are required depends on `op`.
///
/// Amounts are in major units (`600.50`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Command {
    pub op: CommandType,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub student: Option<String>,
    #[serde(default)]
    pub mentor: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub mentor_share: Option<Decimal>,
    #[serde(default)]
    pub platform_share: Option<Decimal>,
    /// Gateway payment or transfer id.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Evaluation time for `sweep`; now when empty.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Reads commands from a CSV source.
///
/// Whitespace is trimmed and rows may omit trailing empty columns.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands, one `Result` per row.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}

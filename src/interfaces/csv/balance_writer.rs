use crate::application::reporting::LedgerSummary;
use crate::domain::account::{MentorEarnings, WalletBalance, from_minor_units};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct BalanceRecord<'a> {
    kind: &'static str,
    owner: &'a str,
    available: Decimal,
    locked: Decimal,
}

/// Writes final balances as CSV `kind,owner,available,locked`, in major units.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
    exponent: u32,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W, exponent: u32) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
            exponent,
        }
    }

    fn record(&mut self, kind: &'static str, owner: &str, available: i64, locked: i64) -> Result<()> {
        self.writer.serialize(BalanceRecord {
            kind,
            owner,
            available: from_minor_units(available, self.exponent),
            locked: from_minor_units(locked, self.exponent),
        })?;
        Ok(())
    }

    /// Student wallets, then mentor earnings, then the platform revenue line.
    pub fn write_balances(
        &mut self,
        wallets: &[WalletBalance],
        earnings: &[MentorEarnings],
        summary: &LedgerSummary,
    ) -> Result<()> {
        for wallet in wallets {
            self.record(
                "student",
                wallet.user_id.as_str(),
                wallet.available.value(),
                wallet.locked.value(),
            )?;
        }
        for mentor in earnings {
            self.record(
                "mentor",
                mentor.mentor_id.as_str(),
                mentor.available.value(),
                mentor.locked.value(),
            )?;
        }
        self.record("platform", "platform", summary.platform_revenue, 0)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{Amount, Balance};
    use crate::domain::ids::UserId;

    #[test]
    fn test_writes_major_units() {
        let mut wallet = WalletBalance::new(UserId::new("s1"), "INR");
        wallet.credit(Amount::new(40_050).unwrap()).unwrap();
        wallet.locked = Balance(60_000);
        let mut earnings = MentorEarnings::new(UserId::new("m1"), "INR");
        earnings.lock(Amount::new(48_000).unwrap()).unwrap();
        let summary = LedgerSummary {
            platform_revenue: 12_000,
            ..LedgerSummary::default()
        };

        let mut out = Vec::new();
        BalanceWriter::new(&mut out, 2)
            .write_balances(&[wallet], &[earnings], &summary)
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "kind,owner,available,locked\n\
             student,s1,400.5,600\n\
             mentor,m1,0,480\n\
             platform,platform,120,0\n"
        );
    }
}

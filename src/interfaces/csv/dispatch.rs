use super::command_reader::{Command, CommandType};
use crate::application::engine::SettlementEngine;
use crate::application::requests::{
    CaptureRequest, DirectCaptureRequest, RefundRequest, TopupRequest,
};
use crate::domain::account::to_minor_units;
use crate::domain::ids::{SessionId, UserId};
use crate::domain::session::SessionTerms;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;

/// What a batch row did, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Replayed,
    Swept(usize),
}

/// Gateway name recorded on direct captures arriving through batch files.
const BATCH_GATEWAY: &str = "batch";

fn required<T>(value: Option<T>, field: &str, op: CommandType) -> Result<T> {
    value.ok_or_else(|| {
        PaymentError::ValidationError(format!("{:?} row is missing `{}`", op, field))
    })
}

struct Row {
    cmd: Command,
    exponent: u32,
}

impl Row {
    fn session(&mut self) -> Result<SessionId> {
        required(self.cmd.session.take(), "session", self.cmd.op).map(SessionId::new)
    }

    fn student(&mut self) -> Result<UserId> {
        required(self.cmd.student.take(), "student", self.cmd.op).map(UserId::new)
    }

    fn mentor(&mut self) -> Result<UserId> {
        required(self.cmd.mentor.take(), "mentor", self.cmd.op).map(UserId::new)
    }

    fn minor(&self, value: Option<Decimal>, field: &str) -> Result<i64> {
        to_minor_units(required(value, field, self.cmd.op)?, self.exponent)
    }

    fn amount(&self) -> Result<i64> {
        self.minor(self.cmd.amount, "amount")
    }

    /// `(total, mentor_share, platform_share)` in minor units.
    fn split(&self) -> Result<(i64, i64, i64)> {
        Ok((
            self.amount()?,
            self.minor(self.cmd.mentor_share, "mentor_share")?,
            self.minor(self.cmd.platform_share, "platform_share")?,
        ))
    }
}

/// Applies one batch row to the engine.
///
/// `exponent` converts the row's major-unit amounts into minor units.
pub async fn apply_command(
    engine: &SettlementEngine,
    cmd: Command,
    exponent: u32,
) -> Result<Outcome> {
    let op = cmd.op;
    let mut row = Row { cmd, exponent };

    let receipt = match op {
        CommandType::Open => {
            let (total, mentor_share, platform_share) = row.split()?;
            engine
                .open_session(SessionTerms {
                    session_id: row.session()?,
                    student_id: row.student()?,
                    mentor_id: row.mentor()?,
                    total,
                    mentor_share,
                    platform_share,
                })
                .await?;
            return Ok(Outcome::Applied);
        }
        CommandType::Topup => {
            let amount = row.amount()?;
            engine
                .topup(TopupRequest {
                    user_id: row.student()?,
                    amount,
                    gateway_reference: row.cmd.reference.take(),
                    idempotency_key: row.cmd.key.take(),
                })
                .await?
        }
        CommandType::Reserve => {
            let amount = row.amount()?;
            engine
                .reserve(&row.student()?, amount, &row.session()?)
                .await?
        }
        CommandType::Capture => {
            let (total, mentor_share, platform_share) = row.split()?;
            engine
                .capture_wallet_mode(CaptureRequest {
                    session_id: row.session()?,
                    student_id: row.student()?,
                    mentor_id: row.mentor()?,
                    total,
                    mentor_share,
                    platform_share,
                })
                .await?
        }
        CommandType::DirectCapture => {
            let (total, mentor_share, platform_share) = row.split()?;
            engine
                .capture_direct_mode(DirectCaptureRequest {
                    session_id: row.session()?,
                    student_id: row.student()?,
                    mentor_id: row.mentor()?,
                    total,
                    mentor_share,
                    platform_share,
                    gateway: BATCH_GATEWAY.to_string(),
                    gateway_reference: required(row.cmd.reference.take(), "reference", op)?,
                })
                .await?
        }
        CommandType::Release => {
            let amount = row.amount()?;
            engine
                .release_reservation(&row.student()?, amount, &row.session()?)
                .await?
        }
        CommandType::Refund => {
            let (total, mentor_share, platform_share) = row.split()?;
            engine
                .refund(RefundRequest {
                    session_id: row.session()?,
                    student_id: row.student()?,
                    mentor_id: row.mentor()?,
                    refund_total: total,
                    refund_mentor_share: mentor_share,
                    refund_platform_share: platform_share,
                    idempotency_key: row.cmd.key.take(),
                })
                .await?
        }
        CommandType::Sweep => {
            let released = match row.cmd.at {
                Some(at) => engine.sweep_due_releases_at(at).await?,
                None => engine.sweep_due_releases().await?,
            };
            return Ok(Outcome::Swept(released));
        }
        CommandType::Payout => {
            let amount = row.amount()?;
            engine
                .request_payout(&row.mentor()?, amount, row.cmd.key.take())
                .await?
        }
    };

    Ok(if receipt.replayed {
        Outcome::Replayed
    } else {
        Outcome::Applied
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::account::Balance;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use crate::interfaces::csv::command_reader::CommandReader;
    use std::sync::Arc;

    const HEADER: &str = "op,session,student,mentor,amount,mentor_share,platform_share,reference,key,at";

    async fn run(engine: &SettlementEngine, rows: &[&str]) -> Vec<Result<Outcome>> {
        let data = format!("{}\n{}", HEADER, rows.join("\n"));
        let mut outcomes = Vec::new();
        for cmd in CommandReader::new(data.as_bytes()).commands() {
            outcomes.push(apply_command(engine, cmd.unwrap(), 2).await);
        }
        outcomes
    }

    fn engine() -> SettlementEngine {
        SettlementEngine::new(Arc::new(InMemoryLedgerStore::new()), &Config::default())
    }

    #[tokio::test]
    async fn test_wallet_rows_end_to_end() {
        let engine = engine();
        let outcomes = run(
            &engine,
            &[
                "topup,,s1,,1000,,,pay_1,evt_1",
                "topup,,s1,,1000,,,pay_1,evt_1",
                "open,sess1,s1,m1,600,480,120",
                "reserve,sess1,s1,,600",
                "capture,sess1,s1,m1,600,480,120",
                "refund,sess1,s1,m1,100,80,20,,rfnd_1",
                "sweep,,,,,,,,,2099-01-01T00:00:00Z",
                "payout,,,m1,400,,,,pout_1",
            ],
        )
        .await;

        assert_eq!(outcomes[0].as_ref().unwrap(), &Outcome::Applied);
        assert_eq!(outcomes[1].as_ref().unwrap(), &Outcome::Replayed);
        assert_eq!(outcomes[6].as_ref().unwrap(), &Outcome::Swept(1));
        assert!(outcomes.iter().all(|o| o.is_ok()));

        let wallet = engine.wallet(&UserId::new("s1")).await.unwrap().unwrap();
        assert_eq!(wallet.available, Balance(50_000));
        let earnings = engine
            .mentor_earnings(&UserId::new("m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(earnings.available, Balance(0));
        assert_eq!(earnings.locked, Balance(0));
    }

    #[tokio::test]
    async fn test_missing_column_is_rejected() {
        let engine = engine();
        let outcomes = run(&engine, &["reserve,sess1,,,600", "topup,,s1"]).await;
        assert!(matches!(outcomes[0], Err(PaymentError::ValidationError(_))));
        assert!(matches!(outcomes[1], Err(PaymentError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_sub_minor_precision_is_rejected() {
        let engine = engine();
        let outcomes = run(&engine, &["topup,,s1,,10.005"]).await;
        assert!(matches!(outcomes[0], Err(PaymentError::ValidationError(_))));
        assert!(engine.wallet(&UserId::new("s1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_direct_capture_requires_reference() {
        let engine = engine();
        let outcomes = run(
            &engine,
            &[
                "direct_capture,sess1,s1,m1,600,480,120",
                "direct_capture,sess1,s1,m1,600,480,120,ch_1",
                "direct_capture,sess1,s1,m1,600,480,120,ch_1",
            ],
        )
        .await;
        assert!(matches!(outcomes[0], Err(PaymentError::ValidationError(_))));
        assert_eq!(outcomes[1].as_ref().unwrap(), &Outcome::Applied);
        assert_eq!(outcomes[2].as_ref().unwrap(), &Outcome::Replayed);
    }
}

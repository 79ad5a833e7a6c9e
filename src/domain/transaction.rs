use super::account::Amount;
use super::ids::{SessionId, UserId};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical ledger accounts. Student and mentor buckets are scoped to the
/// transaction's subject; platform revenue and the gateway are global.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    StudentAvailable,
    StudentLocked,
    MentorAvailable,
    MentorLocked,
    PlatformRevenue,
    ExternalGateway,
}

impl Account {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StudentAvailable => "student_available",
            Self::StudentLocked => "student_locked",
            Self::MentorAvailable => "mentor_available",
            Self::MentorLocked => "mentor_locked",
            Self::PlatformRevenue => "platform_revenue",
            Self::ExternalGateway => "external_gateway",
        }
    }

    /// True for buckets owned by the transaction subject.
    pub fn is_subject_scoped(&self) -> bool {
        !matches!(self, Self::PlatformRevenue | Self::ExternalGateway)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Topup,
    Reserve,
    ReservationRelease,
    Capture,
    PlatformFee,
    MentorEarning,
    EarningsRelease,
    Refund,
    FeeReversal,
    EarningsReversal,
    Payout,
    PayoutReversal,
}

/// Immutable, append-only ledger row.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerTransaction {
    pub id: Uuid,
    /// Commit order, assigned by the store.
    pub sequence: u64,
    pub subject_user_id: UserId,
    pub r#type: TransactionType,
    pub direction: Direction,
    pub amount: i64,
    pub currency: String,
    pub from_account: Account,
    pub to_account: Account,
    pub session_id: Option<SessionId>,
    pub gateway_reference: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn transfer(
        subject: &UserId,
        r#type: TransactionType,
        direction: Direction,
        from_account: Account,
        to_account: Account,
        amount: Amount,
        currency: &str,
    ) -> Result<Self> {
        if from_account == to_account {
            return Err(PaymentError::ValidationError(format!(
                "Ledger transfer from {} to itself",
                from_account
            )));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            sequence: 0,
            subject_user_id: subject.clone(),
            r#type,
            direction,
            amount: amount.value(),
            currency: currency.to_string(),
            from_account,
            to_account,
            session_id: None,
            gateway_reference: None,
            idempotency_key: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        })
    }

    pub fn for_session(mut self, session_id: &SessionId) -> Self {
        self.session_id = Some(session_id.clone());
        self
    }

    pub fn with_gateway_reference(mut self, reference: Option<String>) -> Self {
        self.gateway_reference = reference;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of an applied operation, stored against its idempotency key so a
/// replayed external event can be answered with the original result.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Receipt {
    pub transaction_ids: Vec<Uuid>,
    pub payout_id: Option<Uuid>,
    #[serde(skip, default)]
    pub replayed: bool,
}

impl Receipt {
    pub fn new(transaction_ids: Vec<Uuid>) -> Self {
        Self {
            transaction_ids,
            payout_id: None,
            replayed: false,
        }
    }

    pub fn replayed(mut self) -> Self {
        self.replayed = true;
        self
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub receipt: Receipt,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_rejects_same_account() {
        let result = LedgerTransaction::transfer(
            &UserId::new("s1"),
            TransactionType::Reserve,
            Direction::Debit,
            Account::StudentLocked,
            Account::StudentLocked,
            Amount::new(10).unwrap(),
            "INR",
        );
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    }

    #[test]
    fn test_transfer_builder() {
        let tx = LedgerTransaction::transfer(
            &UserId::new("s1"),
            TransactionType::Topup,
            Direction::Credit,
            Account::ExternalGateway,
            Account::StudentAvailable,
            Amount::new(100_000).unwrap(),
            "INR",
        )
        .unwrap()
        .with_gateway_reference(Some("pay_123".into()))
        .with_idempotency_key(Some("evt_1".into()));

        assert_eq!(tx.amount, 100_000);
        assert_eq!(tx.session_id, None);
        assert_eq!(tx.gateway_reference.as_deref(), Some("pay_123"));
        assert_eq!(tx.idempotency_key.as_deref(), Some("evt_1"));
    }

    #[test]
    fn test_receipt_replay_flag_is_not_persisted() {
        let receipt = Receipt::new(vec![Uuid::now_v7()]).replayed();
        let json = serde_json::to_string(&receipt).unwrap();
        let restored: Receipt = serde_json::from_str(&json).unwrap();
        assert!(!restored.replayed);
        assert_eq!(restored.transaction_ids, receipt.transaction_ids);
    }

    #[test]
    fn test_subject_scoped_accounts() {
        assert!(Account::MentorLocked.is_subject_scoped());
        assert!(!Account::PlatformRevenue.is_subject_scoped());
        assert!(!Account::ExternalGateway.is_subject_scoped());
    }
}

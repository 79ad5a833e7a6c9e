use super::account::{MentorEarnings, WalletBalance};
use super::ids::{SessionId, UserId};
use super::payout::PayoutRequest;
use super::session::SessionPayment;
use super::transaction::{IdempotencyRecord, LedgerTransaction, Receipt};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::sync::Arc;
use uuid::Uuid;

/// Durable home of the ledger, the balance projections and session records.
///
/// Reads may be served from any snapshot; every write goes through
/// [`LedgerStore::commit`], which must apply a whole [`Changeset`] or nothing.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn wallet(&self, user_id: &UserId) -> Result<Option<WalletBalance>>;
    async fn mentor_earnings(&self, mentor_id: &UserId) -> Result<Option<MentorEarnings>>;
    async fn session(&self, session_id: &SessionId) -> Result<Option<SessionPayment>>;
    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>>;
    async fn idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    async fn sessions_due_for_release(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<SessionPayment>>;
    async fn all_wallets(&self) -> Result<Vec<WalletBalance>>;
    async fn all_mentor_earnings(&self) -> Result<Vec<MentorEarnings>>;
    /// Every ledger row, in commit order.
    async fn transactions(&self) -> Result<Vec<LedgerTransaction>>;

    async fn session_transactions(&self, session_id: &SessionId) -> Result<Vec<LedgerTransaction>> {
        let all = self.transactions().await?;
        Ok(all
            .into_iter()
            .filter(|tx| tx.session_id.as_ref() == Some(session_id))
            .collect())
    }

    /// Atomically applies `changes`.
    ///
    /// Fails with `ConcurrencyConflict` when a record's stored version is not
    /// exactly one behind the incoming one, and with `DuplicateIdempotencyKey`
    /// when the claimed key (or any row key) is already present.
    async fn commit(&self, changes: Changeset) -> Result<()>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;

/// Everything one operation writes.
#[derive(Debug, Default, Clone)]
pub struct Changeset {
    pub wallets: Vec<WalletBalance>,
    pub earnings: Vec<MentorEarnings>,
    pub sessions: Vec<SessionPayment>,
    pub payouts: Vec<PayoutRequest>,
    pub transactions: Vec<LedgerTransaction>,
    pub idempotency: Option<IdempotencyRecord>,
}

impl Changeset {
    pub fn put_wallet(&mut self, mut wallet: WalletBalance) {
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        self.wallets.push(wallet);
    }

    pub fn put_earnings(&mut self, mut earnings: MentorEarnings) {
        earnings.version += 1;
        earnings.updated_at = Utc::now();
        self.earnings.push(earnings);
    }

    pub fn put_session(&mut self, mut session: SessionPayment) {
        session.version += 1;
        session.updated_at = Utc::now();
        self.sessions.push(session);
    }

    pub fn put_payout(&mut self, mut payout: PayoutRequest) {
        payout.version += 1;
        payout.updated_at = Utc::now();
        self.payouts.push(payout);
    }

    pub fn append(&mut self, tx: LedgerTransaction) {
        self.transactions.push(tx);
    }

    pub fn claim(&mut self, key: Option<String>, receipt: &Receipt) {
        self.idempotency = key.map(|key| IdempotencyRecord {
            key,
            receipt: receipt.clone(),
            recorded_at: Utc::now(),
        });
    }

    pub fn transaction_ids(&self) -> Vec<Uuid> {
        self.transactions.iter().map(|tx| tx.id).collect()
    }

    /// Idempotency keys this changeset would make permanent.
    pub fn idempotency_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .transactions
            .iter()
            .filter_map(|tx| tx.idempotency_key.as_deref())
            .collect();
        if let Some(record) = &self.idempotency
            && !keys.contains(&record.key.as_str())
        {
            keys.push(record.key.as_str());
        }
        keys
    }

    /// Records to persist for [`Changeset::idempotency_keys`]. Row keys without
    /// an operation-level claim get an empty receipt so they still block replays.
    pub fn idempotency_records(&self) -> Vec<IdempotencyRecord> {
        let mut records: Vec<IdempotencyRecord> = self.idempotency.iter().cloned().collect();
        for key in self.idempotency_keys() {
            if records.iter().all(|r| r.key != key) {
                records.push(IdempotencyRecord {
                    key: key.to_string(),
                    receipt: Receipt::default(),
                    recorded_at: Utc::now(),
                });
            }
        }
        records
    }
}

/// Optimistic concurrency check shared by the store implementations.
pub fn check_version(
    kind: &str,
    id: &dyn Display,
    stored: Option<u64>,
    incoming: u64,
) -> Result<()> {
    let stored = stored.unwrap_or(0);
    if stored + 1 != incoming {
        return Err(PaymentError::ConcurrencyConflict(format!(
            "{} {} changed concurrently (stored version {}, writing {})",
            kind, id, stored, incoming
        )));
    }
    Ok(())
}

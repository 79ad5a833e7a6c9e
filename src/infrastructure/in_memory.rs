use crate::domain::account::{MentorEarnings, WalletBalance};
use crate::domain::ids::{SessionId, UserId};
use crate::domain::payout::PayoutRequest;
use crate::domain::ports::{Changeset, LedgerStore, check_version};
use crate::domain::session::SessionPayment;
use crate::domain::transaction::{IdempotencyRecord, LedgerTransaction};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    wallets: HashMap<UserId, WalletBalance>,
    earnings: HashMap<UserId, MentorEarnings>,
    sessions: HashMap<SessionId, SessionPayment>,
    payouts: HashMap<Uuid, PayoutRequest>,
    transactions: Vec<LedgerTransaction>,
    transaction_ids: HashSet<Uuid>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

impl LedgerState {
    fn validate(&self, changes: &Changeset) -> Result<()> {
        for key in changes.idempotency_keys() {
            if self.idempotency.contains_key(key) {
                return Err(PaymentError::DuplicateIdempotencyKey(key.to_string()));
            }
        }
        for wallet in &changes.wallets {
            let stored = self.wallets.get(&wallet.user_id).map(|w| w.version);
            check_version("wallet", &wallet.user_id, stored, wallet.version)?;
        }
        for earnings in &changes.earnings {
            let stored = self.earnings.get(&earnings.mentor_id).map(|e| e.version);
            check_version("earnings", &earnings.mentor_id, stored, earnings.version)?;
        }
        for session in &changes.sessions {
            let stored = self.sessions.get(&session.session_id).map(|s| s.version);
            check_version("session", &session.session_id, stored, session.version)?;
        }
        for payout in &changes.payouts {
            let stored = self.payouts.get(&payout.id).map(|p| p.version);
            check_version("payout", &payout.id, stored, payout.version)?;
        }
        for tx in &changes.transactions {
            if self.transaction_ids.contains(&tx.id) {
                return Err(PaymentError::ConcurrencyConflict(format!(
                    "transaction {} already recorded",
                    tx.id
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, changes: Changeset) {
        let records = changes.idempotency_records();
        for wallet in changes.wallets {
            self.wallets.insert(wallet.user_id.clone(), wallet);
        }
        for earnings in changes.earnings {
            self.earnings.insert(earnings.mentor_id.clone(), earnings);
        }
        for session in changes.sessions {
            self.sessions.insert(session.session_id.clone(), session);
        }
        for payout in changes.payouts {
            self.payouts.insert(payout.id, payout);
        }
        for record in records {
            self.idempotency.insert(record.key.clone(), record);
        }
        for mut tx in changes.transactions {
            tx.sequence = self.transactions.len() as u64 + 1;
            self.transaction_ids.insert(tx.id);
            self.transactions.push(tx);
        }
    }
}

/// A thread-safe in-memory ledger store.
///
/// All state sits behind one `Arc<RwLock<..>>`, so a commit validates and
/// applies under a single write guard. Ideal for tests and single-process runs
/// where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn wallet(&self, user_id: &UserId) -> Result<Option<WalletBalance>> {
        let state = self.state.read().await;
        Ok(state.wallets.get(user_id).cloned())
    }

    async fn mentor_earnings(&self, mentor_id: &UserId) -> Result<Option<MentorEarnings>> {
        let state = self.state.read().await;
        Ok(state.earnings.get(mentor_id).cloned())
    }

    async fn session(&self, session_id: &SessionId) -> Result<Option<SessionPayment>> {
        let state = self.state.read().await;
        Ok(state.sessions.get(session_id).cloned())
    }

    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>> {
        let state = self.state.read().await;
        Ok(state.payouts.get(&payout_id).cloned())
    }

    async fn idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let state = self.state.read().await;
        Ok(state.idempotency.get(key).cloned())
    }

    async fn sessions_due_for_release(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionPayment>> {
        let state = self.state.read().await;
        let mut due: Vec<SessionPayment> = state
            .sessions
            .values()
            .filter(|s| s.is_due_for_release(cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.captured_at);
        Ok(due)
    }

    async fn all_wallets(&self) -> Result<Vec<WalletBalance>> {
        let state = self.state.read().await;
        let mut wallets: Vec<WalletBalance> = state.wallets.values().cloned().collect();
        wallets.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(wallets)
    }

    async fn all_mentor_earnings(&self) -> Result<Vec<MentorEarnings>> {
        let state = self.state.read().await;
        let mut earnings: Vec<MentorEarnings> = state.earnings.values().cloned().collect();
        earnings.sort_by(|a, b| a.mentor_id.cmp(&b.mentor_id));
        Ok(earnings)
    }

    async fn transactions(&self) -> Result<Vec<LedgerTransaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.clone())
    }

    async fn commit(&self, changes: Changeset) -> Result<()> {
        let mut state = self.state.write().await;
        state.validate(&changes)?;
        state.apply(changes);
        Ok(())
    }
}

use crate::domain::account::{MentorEarnings, WalletBalance};
use crate::domain::ids::{SessionId, UserId};
use crate::domain::payout::PayoutRequest;
use crate::domain::ports::{Changeset, LedgerStore, check_version};
use crate::domain::session::SessionPayment;
use crate::domain::transaction::{IdempotencyRecord, LedgerTransaction};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Column Family for student wallet projections.
pub const CF_WALLETS: &str = "wallets";
/// Column Family for mentor earnings projections.
pub const CF_EARNINGS: &str = "earnings";
/// Column Family for session payment records.
pub const CF_SESSIONS: &str = "sessions";
/// Column Family for payout requests.
pub const CF_PAYOUTS: &str = "payouts";
/// Column Family for the append-only ledger, keyed by big-endian sequence.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for claimed idempotency keys.
pub const CF_IDEMPOTENCY: &str = "idempotency";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_WALLETS,
    CF_EARNINGS,
    CF_SESSIONS,
    CF_PAYOUTS,
    CF_TRANSACTIONS,
    CF_IDEMPOTENCY,
];

/// A persistent store implementation using RocksDB.
///
/// Each record kind lives in its own Column Family. A commit is validated and
/// written as one `WriteBatch` while holding the commit mutex, which makes the
/// balance mutation, the ledger append and the idempotency claim atomic.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
    sequence: Arc<AtomicU64>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures all column families exist and resumes the ledger sequence from
    /// the last committed row.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), descriptors)?;
        let store = Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
            sequence: Arc::new(AtomicU64::new(0)),
        };

        let last = store.last_sequence()?;
        store.sequence.store(last, Ordering::SeqCst);
        info!(path = ?path.as_ref(), last_sequence = last, "opened RocksDB ledger store");

        Ok(store)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn last_sequence(&self) -> Result<u64> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
                    PaymentError::InternalError(Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "Malformed transaction key",
                    )))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(cf_name)?;
        batch.put_cf(cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn validate(&self, changes: &Changeset) -> Result<()> {
        let cf_idempotency = self.cf(CF_IDEMPOTENCY)?;
        for key in changes.idempotency_keys() {
            if self.db.get_pinned_cf(cf_idempotency, key.as_bytes())?.is_some() {
                return Err(PaymentError::DuplicateIdempotencyKey(key.to_string()));
            }
        }
        for wallet in &changes.wallets {
            let stored: Option<WalletBalance> =
                self.get_json(CF_WALLETS, wallet.user_id.as_str().as_bytes())?;
            check_version(
                "wallet",
                &wallet.user_id,
                stored.map(|w| w.version),
                wallet.version,
            )?;
        }
        for earnings in &changes.earnings {
            let stored: Option<MentorEarnings> =
                self.get_json(CF_EARNINGS, earnings.mentor_id.as_str().as_bytes())?;
            check_version(
                "earnings",
                &earnings.mentor_id,
                stored.map(|e| e.version),
                earnings.version,
            )?;
        }
        for session in &changes.sessions {
            let stored: Option<SessionPayment> =
                self.get_json(CF_SESSIONS, session.session_id.as_str().as_bytes())?;
            check_version(
                "session",
                &session.session_id,
                stored.map(|s| s.version),
                session.version,
            )?;
        }
        for payout in &changes.payouts {
            let stored: Option<PayoutRequest> = self.get_json(CF_PAYOUTS, payout.id.as_bytes())?;
            check_version(
                "payout",
                &payout.id,
                stored.map(|p| p.version),
                payout.version,
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn wallet(&self, user_id: &UserId) -> Result<Option<WalletBalance>> {
        self.get_json(CF_WALLETS, user_id.as_str().as_bytes())
    }

    async fn mentor_earnings(&self, mentor_id: &UserId) -> Result<Option<MentorEarnings>> {
        self.get_json(CF_EARNINGS, mentor_id.as_str().as_bytes())
    }

    async fn session(&self, session_id: &SessionId) -> Result<Option<SessionPayment>> {
        self.get_json(CF_SESSIONS, session_id.as_str().as_bytes())
    }

    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>> {
        self.get_json(CF_PAYOUTS, payout_id.as_bytes())
    }

    async fn idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.get_json(CF_IDEMPOTENCY, key.as_bytes())
    }

    async fn sessions_due_for_release(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionPayment>> {
        let sessions: Vec<SessionPayment> = self.scan_json(CF_SESSIONS)?;
        let mut due: Vec<SessionPayment> = sessions
            .into_iter()
            .filter(|s| s.is_due_for_release(cutoff))
            .collect();
        due.sort_by_key(|s| s.captured_at);
        Ok(due)
    }

    async fn all_wallets(&self) -> Result<Vec<WalletBalance>> {
        self.scan_json(CF_WALLETS)
    }

    async fn all_mentor_earnings(&self) -> Result<Vec<MentorEarnings>> {
        self.scan_json(CF_EARNINGS)
    }

    async fn transactions(&self) -> Result<Vec<LedgerTransaction>> {
        self.scan_json(CF_TRANSACTIONS)
    }

    async fn commit(&self, changes: Changeset) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        self.validate(&changes)?;

        let mut batch = WriteBatch::default();
        for wallet in &changes.wallets {
            self.put_json(&mut batch, CF_WALLETS, wallet.user_id.as_str().as_bytes(), wallet)?;
        }
        for earnings in &changes.earnings {
            self.put_json(
                &mut batch,
                CF_EARNINGS,
                earnings.mentor_id.as_str().as_bytes(),
                earnings,
            )?;
        }
        for session in &changes.sessions {
            self.put_json(
                &mut batch,
                CF_SESSIONS,
                session.session_id.as_str().as_bytes(),
                session,
            )?;
        }
        for payout in &changes.payouts {
            self.put_json(&mut batch, CF_PAYOUTS, payout.id.as_bytes(), payout)?;
        }
        for record in changes.idempotency_records() {
            self.put_json(&mut batch, CF_IDEMPOTENCY, record.key.as_bytes(), &record)?;
        }

        let mut sequence = self.sequence.load(Ordering::SeqCst);
        for tx in &changes.transactions {
            sequence += 1;
            let mut row = tx.clone();
            row.sequence = sequence;
            self.put_json(&mut batch, CF_TRANSACTIONS, &sequence.to_be_bytes(), &row)?;
        }

        self.db.write(batch)?;
        self.sequence.store(sequence, Ordering::SeqCst);
        debug!(
            rows = changes.transactions.len(),
            last_sequence = sequence,
            "committed changeset"
        );

        Ok(())
    }
}

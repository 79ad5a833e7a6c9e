use super::locks::{LockKey, SubjectLocks};
use super::requests::{CaptureRequest, DirectCaptureRequest, RefundRequest, TopupRequest};
use crate::config::Config;
use crate::domain::account::{Amount, MentorEarnings, WalletBalance};
use crate::domain::ids::{SessionId, UserId};
use crate::domain::payout::{PayoutRequest, PayoutStatus};
use crate::domain::ports::{Changeset, LedgerStoreRef};
use crate::domain::session::{PaymentMode, SessionPayment, SessionStatus, SessionTerms, Split};
use crate::domain::transaction::{Account, Direction, LedgerTransaction, Receipt, TransactionType};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// The operation engine moving money between student wallets, mentor earnings
/// and platform revenue.
///
/// Every operation loads the records it touches under per-subject locks,
/// validates, and hands one [`Changeset`] to the store. A failing operation
/// writes nothing; undoing a committed one takes a compensating operation.
pub struct SettlementEngine {
    store: LedgerStoreRef,
    locks: SubjectLocks,
    currency: String,
    maturation_window: Duration,
}

impl SettlementEngine {
    /// Creates a new `SettlementEngine` over the given store.
    ///
    /// # Arguments
    ///
    /// * `store` - The ledger store shared with readers such as reporting.
    /// * `config` - Provides the settlement currency and the maturation window.
    pub fn new(store: LedgerStoreRef, config: &Config) -> Self {
        Self {
            store,
            locks: SubjectLocks::new(),
            currency: config.currency.clone(),
            maturation_window: config.maturation_window(),
        }
    }

    pub fn store(&self) -> &LedgerStoreRef {
        &self.store
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    async fn load_wallet(&self, user_id: &UserId) -> Result<WalletBalance> {
        Ok(self
            .store
            .wallet(user_id)
            .await?
            .unwrap_or_else(|| WalletBalance::new(user_id.clone(), &self.currency)))
    }

    async fn load_earnings(&self, mentor_id: &UserId) -> Result<MentorEarnings> {
        Ok(self
            .store
            .mentor_earnings(mentor_id)
            .await?
            .unwrap_or_else(|| MentorEarnings::new(mentor_id.clone(), &self.currency)))
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionPayment> {
        self.store
            .session(session_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("session {}", session_id)))
    }

    async fn load_payout(&self, payout_id: Uuid) -> Result<PayoutRequest> {
        self.store
            .payout(payout_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payout {}", payout_id)))
    }

    async fn prior_receipt(&self, key: Option<&str>) -> Result<Option<Receipt>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let record = self.store.idempotency_record(key).await?;
        if record.is_some() {
            info!(key, "idempotency key already applied, returning prior result");
        }
        Ok(record.map(|r| r.receipt.replayed()))
    }

    async fn commit(&self, changes: Changeset, receipt: Receipt) -> Result<Receipt> {
        match self.store.commit(changes).await {
            Ok(()) => Ok(receipt),
            Err(PaymentError::DuplicateIdempotencyKey(key)) => {
                // Lost a race against another writer applying the same event.
                match self.store.idempotency_record(&key).await? {
                    Some(record) => Ok(record.receipt.replayed()),
                    None => Err(PaymentError::DuplicateIdempotencyKey(key)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn row(
        &self,
        subject: &UserId,
        r#type: TransactionType,
        direction: Direction,
        from: Account,
        to: Account,
        amount: Amount,
    ) -> Result<LedgerTransaction> {
        LedgerTransaction::transfer(subject, r#type, direction, from, to, amount, &self.currency)
    }

    /// Platform fee and mentor share rows booked against an external charge.
    fn split_rows(
        &self,
        session: &SessionPayment,
        split: &Split,
        gateway_reference: Option<&String>,
    ) -> Result<Vec<LedgerTransaction>> {
        let mut rows = Vec::with_capacity(2);
        if let Some(fee) = split.platform_amount() {
            rows.push(
                self.row(
                    &session.student_id,
                    TransactionType::PlatformFee,
                    Direction::Credit,
                    Account::ExternalGateway,
                    Account::PlatformRevenue,
                    fee,
                )?
                .for_session(&session.session_id)
                .with_gateway_reference(gateway_reference.cloned()),
            );
        }
        if let Some(share) = split.mentor_amount() {
            rows.push(
                self.row(
                    &session.mentor_id,
                    TransactionType::MentorEarning,
                    Direction::Credit,
                    Account::ExternalGateway,
                    Account::MentorLocked,
                    share,
                )?
                .for_session(&session.session_id)
                .with_gateway_reference(gateway_reference.cloned()),
            );
        }
        Ok(rows)
    }

    pub async fn create_or_get_wallet(&self, user_id: &UserId) -> Result<WalletBalance> {
        let _locks = self
            .locks
            .acquire(vec![LockKey::Wallet(user_id.clone())])
            .await;
        if let Some(wallet) = self.store.wallet(user_id).await? {
            return Ok(wallet);
        }
        let mut changes = Changeset::default();
        changes.put_wallet(WalletBalance::new(user_id.clone(), &self.currency));
        let wallet = changes.wallets[0].clone();
        match self.store.commit(changes).await {
            Ok(()) => Ok(wallet),
            // Another process created it first.
            Err(PaymentError::ConcurrencyConflict(_)) => self
                .store
                .wallet(user_id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("wallet {}", user_id))),
            Err(e) => Err(e),
        }
    }

    pub async fn create_or_get_mentor_earnings(&self, mentor_id: &UserId) -> Result<MentorEarnings> {
        let _locks = self
            .locks
            .acquire(vec![LockKey::Earnings(mentor_id.clone())])
            .await;
        if let Some(earnings) = self.store.mentor_earnings(mentor_id).await? {
            return Ok(earnings);
        }
        let mut changes = Changeset::default();
        changes.put_earnings(MentorEarnings::new(mentor_id.clone(), &self.currency));
        let earnings = changes.earnings[0].clone();
        match self.store.commit(changes).await {
            Ok(()) => Ok(earnings),
            Err(PaymentError::ConcurrencyConflict(_)) => self
                .store
                .mentor_earnings(mentor_id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("earnings {}", mentor_id))),
            Err(e) => Err(e),
        }
    }

    /// Registers a booked session and its agreed split.
    #[instrument(skip_all, fields(session = %terms.session_id))]
    pub async fn open_session(&self, terms: SessionTerms) -> Result<SessionPayment> {
        let split = Split::new(terms.total, terms.mentor_share, terms.platform_share)?;
        let _locks = self
            .locks
            .acquire(vec![LockKey::Session(terms.session_id.clone())])
            .await;

        if let Some(existing) = self.store.session(&terms.session_id).await? {
            if existing.student_id == terms.student_id
                && existing.mentor_id == terms.mentor_id
                && existing.amount_total == terms.total
            {
                return Ok(existing);
            }
            return Err(PaymentError::ValidationError(format!(
                "session {} is already open with different terms",
                terms.session_id
            )));
        }

        let session = SessionPayment::open(
            terms.session_id,
            terms.student_id,
            terms.mentor_id,
            split,
            PaymentMode::Wallet,
            &self.currency,
        );
        let mut changes = Changeset::default();
        changes.put_session(session);
        let opened = changes.sessions[0].clone();
        self.store.commit(changes).await?;
        debug!(total = opened.amount_total, "session opened");
        Ok(opened)
    }

    /// Credits a student's wallet with funds confirmed by the gateway.
    #[instrument(skip_all, fields(user = %request.user_id, amount = request.amount))]
    pub async fn topup(&self, request: TopupRequest) -> Result<Receipt> {
        let amount = Amount::new(request.amount)?;
        let _locks = self
            .locks
            .acquire(vec![LockKey::Wallet(request.user_id.clone())])
            .await;
        if let Some(prior) = self.prior_receipt(request.idempotency_key.as_deref()).await? {
            return Ok(prior);
        }

        let mut wallet = self.load_wallet(&request.user_id).await?;
        wallet.credit(amount)?;

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                &request.user_id,
                TransactionType::Topup,
                Direction::Credit,
                Account::ExternalGateway,
                Account::StudentAvailable,
                amount,
            )?
            .with_gateway_reference(request.gateway_reference)
            .with_idempotency_key(request.idempotency_key.clone()),
        );
        changes.put_wallet(wallet);
        let receipt = Receipt::new(changes.transaction_ids());
        changes.claim(request.idempotency_key, &receipt);

        let receipt = self.commit(changes, receipt).await?;
        if !receipt.replayed {
            info!("wallet topped up");
        }
        Ok(receipt)
    }

    /// Locks wallet funds against a session.
    ///
    /// Fails with `InsufficientFunds` when `available < amount`; the balance
    /// check and the mutation happen under the wallet lock.
    #[instrument(skip_all, fields(user = %user_id, session = %session_id, amount = amount))]
    pub async fn reserve(
        &self,
        user_id: &UserId,
        amount: i64,
        session_id: &SessionId,
    ) -> Result<Receipt> {
        let amount = Amount::new(amount)?;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Wallet(user_id.clone()),
                LockKey::Session(session_id.clone()),
            ])
            .await;

        let mut session = self.load_session(session_id).await?;
        session.expect_parties(user_id, None)?;
        session.expect_total(amount.value())?;
        session.transition(SessionStatus::Reserved)?;

        let mut wallet = self.load_wallet(user_id).await?;
        if let Err(e) = wallet.reserve(amount) {
            warn!(error = %e, "reservation rejected");
            return Err(e);
        }
        session.reserved_at = Some(Utc::now());

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                user_id,
                TransactionType::Reserve,
                Direction::Debit,
                Account::StudentAvailable,
                Account::StudentLocked,
                amount,
            )?
            .for_session(session_id),
        );
        changes.put_wallet(wallet);
        changes.put_session(session);
        let receipt = Receipt::new(changes.transaction_ids());

        let receipt = self.commit(changes, receipt).await?;
        info!("funds reserved");
        Ok(receipt)
    }

    /// Captures a reserved wallet payment and splits it between mentor and platform.
    #[instrument(skip_all, fields(session = %request.session_id, total = request.total))]
    pub async fn capture_wallet_mode(&self, request: CaptureRequest) -> Result<Receipt> {
        let split = Split::new(request.total, request.mentor_share, request.platform_share)?;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Wallet(request.student_id.clone()),
                LockKey::Earnings(request.mentor_id.clone()),
                LockKey::Session(request.session_id.clone()),
            ])
            .await;

        let mut session = self.load_session(&request.session_id).await?;
        session.expect_parties(&request.student_id, Some(&request.mentor_id))?;
        session.expect_total(split.total.value())?;
        session.transition(SessionStatus::Captured)?;

        let mut wallet = self.load_wallet(&request.student_id).await?;
        wallet.settle_locked(split.total)?;
        session.apply_split(&split);
        session.captured_at = Some(Utc::now());

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                &request.student_id,
                TransactionType::Capture,
                Direction::Debit,
                Account::StudentLocked,
                Account::ExternalGateway,
                split.total,
            )?
            .for_session(&request.session_id),
        );
        for row in self.split_rows(&session, &split, None)? {
            changes.append(row);
        }
        if let Some(share) = split.mentor_amount() {
            let mut earnings = self.load_earnings(&request.mentor_id).await?;
            earnings.lock(share)?;
            changes.put_earnings(earnings);
        }
        changes.put_wallet(wallet);
        changes.put_session(session);
        let receipt = Receipt::new(changes.transaction_ids());

        let receipt = self.commit(changes, receipt).await?;
        info!(
            mentor_share = split.mentor,
            platform_share = split.platform,
            "wallet payment captured"
        );
        Ok(receipt)
    }

    /// Books a gateway-charged payment. Upserts by session id, so replays of
    /// the same webhook converge on the first capture.
    #[instrument(
        skip_all,
        fields(session = %request.session_id, total = request.total, reference = %request.gateway_reference)
    )]
    pub async fn capture_direct_mode(&self, request: DirectCaptureRequest) -> Result<Receipt> {
        let split = Split::new(request.total, request.mentor_share, request.platform_share)?;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Earnings(request.mentor_id.clone()),
                LockKey::Session(request.session_id.clone()),
            ])
            .await;

        let mut session = match self.store.session(&request.session_id).await? {
            Some(existing) => {
                existing.expect_parties(&request.student_id, Some(&request.mentor_id))?;
                if existing.mode == PaymentMode::Direct && existing.captured_at.is_some() {
                    let original = self
                        .store
                        .session_transactions(&request.session_id)
                        .await?
                        .into_iter()
                        .filter(|tx| {
                            matches!(
                                tx.r#type,
                                TransactionType::PlatformFee | TransactionType::MentorEarning
                            )
                        })
                        .map(|tx| tx.id)
                        .collect();
                    info!("direct capture already applied");
                    return Ok(Receipt::new(original).replayed());
                }
                if existing.status != SessionStatus::Created {
                    return Err(PaymentError::session_transition(
                        existing.session_id.as_str(),
                        existing.status,
                        SessionStatus::Captured,
                    ));
                }
                existing.expect_total(split.total.value())?;
                let mut session = existing;
                session.mode = PaymentMode::Direct;
                session
            }
            None => SessionPayment::open(
                request.session_id.clone(),
                request.student_id.clone(),
                request.mentor_id.clone(),
                split,
                PaymentMode::Direct,
                &self.currency,
            ),
        };

        session.transition(SessionStatus::Captured)?;
        session.apply_split(&split);
        session.captured_at = Some(Utc::now());
        session.gateway_reference = Some(request.gateway_reference.clone());

        let mut changes = Changeset::default();
        let metadata = json!({ "gateway": request.gateway });
        for row in self.split_rows(&session, &split, Some(&request.gateway_reference))? {
            changes.append(row.with_metadata(metadata.clone()));
        }
        if let Some(share) = split.mentor_amount() {
            let mut earnings = self.load_earnings(&request.mentor_id).await?;
            earnings.lock(share)?;
            changes.put_earnings(earnings);
        }
        changes.put_session(session);
        let receipt = Receipt::new(changes.transaction_ids());

        let receipt = self.commit(changes, receipt).await?;
        info!("direct payment captured");
        Ok(receipt)
    }

    /// Returns reserved funds to the student before the session starts.
    /// Moves at most the session's own reservation, and never more than is
    /// currently locked.
    #[instrument(skip_all, fields(user = %user_id, session = %session_id, amount = amount))]
    pub async fn release_reservation(
        &self,
        user_id: &UserId,
        amount: i64,
        session_id: &SessionId,
    ) -> Result<Receipt> {
        let amount = Amount::new(amount)?;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Wallet(user_id.clone()),
                LockKey::Session(session_id.clone()),
            ])
            .await;

        let mut session = self.load_session(session_id).await?;
        session.expect_parties(user_id, None)?;
        session.transition(SessionStatus::ReservationReleased)?;

        // Locked funds of other sessions stay put.
        let requested = Amount::new(amount.value().min(session.amount_total))?;
        let mut wallet = self.load_wallet(user_id).await?;
        let moved = wallet.release(requested);
        if moved < amount.value() {
            warn!(
                requested = amount.value(),
                reserved = session.amount_total,
                moved, "release clamped to session reservation"
            );
        }
        session.released_at = Some(Utc::now());

        let mut changes = Changeset::default();
        if let Ok(moved) = Amount::new(moved) {
            changes.append(
                self.row(
                    user_id,
                    TransactionType::ReservationRelease,
                    Direction::Credit,
                    Account::StudentLocked,
                    Account::StudentAvailable,
                    moved,
                )?
                .for_session(session_id),
            );
        }
        changes.put_wallet(wallet);
        changes.put_session(session);
        let receipt = Receipt::new(changes.transaction_ids());

        let receipt = self.commit(changes, receipt).await?;
        info!("reservation released");
        Ok(receipt)
    }

    /// Refunds part or all of a captured session.
    ///
    /// The mentor share is debited from locked earnings first and from
    /// available earnings for the remainder, one ledger row per bucket.
    /// Cumulative refunds can never exceed what was captured.
    #[instrument(skip_all, fields(session = %request.session_id, total = request.refund_total))]
    pub async fn refund(&self, request: RefundRequest) -> Result<Receipt> {
        let split = Split::new(
            request.refund_total,
            request.refund_mentor_share,
            request.refund_platform_share,
        )?;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Wallet(request.student_id.clone()),
                LockKey::Earnings(request.mentor_id.clone()),
                LockKey::Session(request.session_id.clone()),
            ])
            .await;
        if let Some(prior) = self.prior_receipt(request.idempotency_key.as_deref()).await? {
            return Ok(prior);
        }

        let mut session = self.load_session(&request.session_id).await?;
        session.expect_parties(&request.student_id, Some(&request.mentor_id))?;
        session.record_refund(&split)?;

        let mut wallet = self.load_wallet(&request.student_id).await?;
        wallet.credit(split.total)?;

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                &request.student_id,
                TransactionType::Refund,
                Direction::Credit,
                Account::ExternalGateway,
                Account::StudentAvailable,
                split.total,
            )?
            .for_session(&request.session_id)
            .with_idempotency_key(request.idempotency_key.clone()),
        );
        if let Some(fee) = split.platform_amount() {
            changes.append(
                self.row(
                    &request.student_id,
                    TransactionType::FeeReversal,
                    Direction::Debit,
                    Account::PlatformRevenue,
                    Account::ExternalGateway,
                    fee,
                )?
                .for_session(&request.session_id),
            );
        }
        if let Some(share) = split.mentor_amount() {
            let mut earnings = self.load_earnings(&request.mentor_id).await?;
            let reversal = earnings.reverse(share);
            let buckets = [
                (Account::MentorLocked, reversal.from_locked),
                (Account::MentorAvailable, reversal.from_available),
            ];
            for (bucket, debited) in buckets {
                if let Ok(debited) = Amount::new(debited) {
                    changes.append(
                        self.row(
                            &request.mentor_id,
                            TransactionType::EarningsReversal,
                            Direction::Debit,
                            bucket,
                            Account::ExternalGateway,
                            debited,
                        )?
                        .for_session(&request.session_id),
                    );
                }
            }
            if reversal.total() < share.value() {
                warn!(
                    requested = share.value(),
                    recovered = reversal.total(),
                    "mentor earnings could not cover the refund share"
                );
            }
            changes.put_earnings(earnings);
        }
        changes.put_wallet(wallet);
        changes.put_session(session);
        let receipt = Receipt::new(changes.transaction_ids());
        changes.claim(request.idempotency_key, &receipt);

        let receipt = self.commit(changes, receipt).await?;
        if !receipt.replayed {
            info!(
                mentor_share = split.mentor,
                platform_share = split.platform,
                "session refunded"
            );
        }
        Ok(receipt)
    }

    /// Releases every mentor share whose maturation window has elapsed.
    pub async fn sweep_due_releases(&self) -> Result<usize> {
        self.sweep_due_releases_at(Utc::now()).await
    }

    /// Same as [`Self::sweep_due_releases`], evaluated at `now`.
    ///
    /// Safe under overlapping runs: each session is re-checked under its own
    /// lock and skipped once another sweep has released it.
    pub async fn sweep_due_releases_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(self.maturation_window) else {
            debug!(%now, "maturation window reaches before the earliest timestamp");
            return Ok(0);
        };
        let due = self.store.sessions_due_for_release(cutoff).await?;
        let candidates = due.len();
        let mut released = 0;

        for session in due {
            match self
                .release_matured(&session.session_id, &session.mentor_id, cutoff, now)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => debug!(session = %session.session_id, "already released"),
                Err(e) if e.is_retryable() => {
                    warn!(session = %session.session_id, error = %e, "release deferred to next sweep")
                }
                Err(e) => {
                    error!(session = %session.session_id, error = %e, "failed to release earnings")
                }
            }
        }

        if candidates > 0 {
            info!(candidates, released, "earnings sweep finished");
        }
        Ok(released)
    }

    async fn release_matured(
        &self,
        session_id: &SessionId,
        mentor_id: &UserId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Earnings(mentor_id.clone()),
                LockKey::Session(session_id.clone()),
            ])
            .await;

        let mut session = self.load_session(session_id).await?;
        if !session.is_due_for_release(cutoff) {
            return Ok(false);
        }

        let residual = session.unreleased_mentor_share();
        let mut earnings = self.load_earnings(&session.mentor_id).await?;
        let moved = earnings.mature(residual);
        if moved < residual {
            warn!(
                session = %session_id,
                expected = residual,
                moved,
                "mentor locked balance below session share"
            );
        }
        session.released_at = Some(now);
        if session.status == SessionStatus::Captured {
            session.transition(SessionStatus::EarningsReleased)?;
        }

        let mut changes = Changeset::default();
        if let Ok(moved) = Amount::new(moved) {
            changes.append(
                self.row(
                    &session.mentor_id,
                    TransactionType::EarningsRelease,
                    Direction::Credit,
                    Account::MentorLocked,
                    Account::MentorAvailable,
                    moved,
                )?
                .for_session(session_id),
            );
        }
        changes.put_earnings(earnings);
        changes.put_session(session);
        self.store.commit(changes).await?;
        debug!(session = %session_id, moved, "mentor earnings matured");
        Ok(true)
    }

    /// Debits matured earnings for a mentor withdrawal.
    #[instrument(skip_all, fields(mentor = %mentor_id, amount = amount))]
    pub async fn request_payout(
        &self,
        mentor_id: &UserId,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Result<Receipt> {
        let amount = Amount::new(amount)?;
        let _locks = self
            .locks
            .acquire(vec![LockKey::Earnings(mentor_id.clone())])
            .await;
        if let Some(prior) = self.prior_receipt(idempotency_key.as_deref()).await? {
            return Ok(prior);
        }

        let mut earnings = self.load_earnings(mentor_id).await?;
        earnings.withdraw(amount)?;
        let payout = PayoutRequest::new(mentor_id.clone(), amount, &self.currency);

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                mentor_id,
                TransactionType::Payout,
                Direction::Debit,
                Account::MentorAvailable,
                Account::ExternalGateway,
                amount,
            )?
            .with_metadata(json!({ "payout_id": payout.id }))
            .with_idempotency_key(idempotency_key.clone()),
        );
        let mut receipt = Receipt::new(changes.transaction_ids());
        receipt.payout_id = Some(payout.id);
        changes.put_earnings(earnings);
        changes.put_payout(payout);
        changes.claim(idempotency_key, &receipt);

        let receipt = self.commit(changes, receipt).await?;
        info!(payout = ?receipt.payout_id, "payout requested");
        Ok(receipt)
    }

    async fn set_payout_status(
        &self,
        payout_id: Uuid,
        to: PayoutStatus,
        gateway_reference: Option<String>,
    ) -> Result<PayoutRequest> {
        let _locks = self.locks.acquire(vec![LockKey::Payout(payout_id)]).await;
        let mut payout = self.load_payout(payout_id).await?;
        payout.transition(to)?;
        if gateway_reference.is_some() {
            payout.gateway_reference = gateway_reference;
        }
        let mut changes = Changeset::default();
        changes.put_payout(payout);
        let updated = changes.payouts[0].clone();
        self.store.commit(changes).await?;
        info!(payout = %payout_id, status = %to, "payout updated");
        Ok(updated)
    }

    /// Marks a payout as submitted to the gateway.
    pub async fn mark_payout_pending(
        &self,
        payout_id: Uuid,
        gateway_reference: String,
    ) -> Result<PayoutRequest> {
        self.set_payout_status(payout_id, PayoutStatus::Pending, Some(gateway_reference))
            .await
    }

    pub async fn complete_payout(&self, payout_id: Uuid) -> Result<PayoutRequest> {
        self.set_payout_status(payout_id, PayoutStatus::Paid, None)
            .await
    }

    /// Marks a payout failed and returns its amount to the mentor's available earnings.
    pub async fn fail_payout(&self, payout_id: Uuid, reason: &str) -> Result<PayoutRequest> {
        let mentor_id = self.load_payout(payout_id).await?.mentor_id;
        let _locks = self
            .locks
            .acquire(vec![
                LockKey::Payout(payout_id),
                LockKey::Earnings(mentor_id.clone()),
            ])
            .await;

        let mut payout = self.load_payout(payout_id).await?;
        payout.transition(PayoutStatus::Failed)?;
        payout.failure_reason = Some(reason.to_string());
        let amount = Amount::new(payout.amount)?;

        let mut earnings = self.load_earnings(&mentor_id).await?;
        earnings.credit_available(amount)?;

        let mut changes = Changeset::default();
        changes.append(
            self.row(
                &mentor_id,
                TransactionType::PayoutReversal,
                Direction::Credit,
                Account::ExternalGateway,
                Account::MentorAvailable,
                amount,
            )?
            .with_metadata(json!({ "payout_id": payout_id, "reason": reason })),
        );
        changes.put_earnings(earnings);
        changes.put_payout(payout);
        let updated = changes.payouts[0].clone();
        self.store.commit(changes).await?;
        warn!(payout = %payout_id, reason, "payout failed, earnings restored");
        Ok(updated)
    }

    pub async fn wallet(&self, user_id: &UserId) -> Result<Option<WalletBalance>> {
        self.store.wallet(user_id).await
    }

    pub async fn mentor_earnings(&self, mentor_id: &UserId) -> Result<Option<MentorEarnings>> {
        self.store.mentor_earnings(mentor_id).await
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<Option<SessionPayment>> {
        self.store.session(session_id).await
    }

    pub async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>> {
        self.store.payout(payout_id).await
    }

    pub async fn transactions(&self) -> Result<Vec<LedgerTransaction>> {
        self.store.transactions().await
    }

    pub async fn session_transactions(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerTransaction>> {
        self.store.session_transactions(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Balance;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use std::sync::Arc;

    fn engine() -> SettlementEngine {
        SettlementEngine::new(Arc::new(InMemoryLedgerStore::new()), &Config::default())
    }

    fn student() -> UserId {
        UserId::new("student-1")
    }

    fn mentor() -> UserId {
        UserId::new("mentor-1")
    }

    fn topup(user: &UserId, amount: i64, key: Option<&str>) -> TopupRequest {
        TopupRequest {
            user_id: user.clone(),
            amount,
            gateway_reference: Some("pay_ref".into()),
            idempotency_key: key.map(String::from),
        }
    }

    fn terms(session: &str, total: i64, mentor_share: i64) -> SessionTerms {
        SessionTerms {
            session_id: SessionId::new(session),
            student_id: student(),
            mentor_id: mentor(),
            total,
            mentor_share,
            platform_share: total - mentor_share,
        }
    }

    fn capture(session: &str, total: i64, mentor_share: i64) -> CaptureRequest {
        CaptureRequest {
            session_id: SessionId::new(session),
            student_id: student(),
            mentor_id: mentor(),
            total,
            mentor_share,
            platform_share: total - mentor_share,
        }
    }

    fn refund(session: &str, total: i64, mentor_share: i64, key: Option<&str>) -> RefundRequest {
        RefundRequest {
            session_id: SessionId::new(session),
            student_id: student(),
            mentor_id: mentor(),
            refund_total: total,
            refund_mentor_share: mentor_share,
            refund_platform_share: total - mentor_share,
            idempotency_key: key.map(String::from),
        }
    }

    async fn wallet_of(engine: &SettlementEngine, user: &UserId) -> WalletBalance {
        engine.wallet(user).await.unwrap().unwrap()
    }

    async fn earnings_of(engine: &SettlementEngine, user: &UserId) -> MentorEarnings {
        engine.mentor_earnings(user).await.unwrap().unwrap()
    }

    async fn platform_revenue(engine: &SettlementEngine) -> i64 {
        engine
            .transactions()
            .await
            .unwrap()
            .iter()
            .map(|tx| match (tx.from_account, tx.to_account) {
                (_, Account::PlatformRevenue) => tx.amount,
                (Account::PlatformRevenue, _) => -tx.amount,
                _ => 0,
            })
            .sum()
    }

    /// Tops up, opens and reserves `session` for the default student.
    async fn reserved(engine: &SettlementEngine, session: &str, total: i64, mentor_share: i64) {
        engine.open_session(terms(session, total, mentor_share)).await.unwrap();
        engine
            .reserve(&student(), total, &SessionId::new(session))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_wallet_flow() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();

        reserved(&engine, "sess1", 60_000, 48_000).await;
        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.available, Balance(40_000));
        assert_eq!(wallet.locked, Balance(60_000));

        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();
        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.available, Balance(40_000));
        assert_eq!(wallet.locked, Balance(0));
        assert_eq!(earnings_of(&engine, &mentor()).await.locked, Balance(48_000));
        assert_eq!(platform_revenue(&engine).await, 12_000);

        engine
            .refund(refund("sess1", 10_000, 8_000, None))
            .await
            .unwrap();
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(50_000));
        assert_eq!(earnings_of(&engine, &mentor()).await.locked, Balance(40_000));
        assert_eq!(platform_revenue(&engine).await, 10_000);

        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Refunded);
        assert_eq!(
            session.amount_total,
            session.amount_mentor + session.amount_platform
        );
    }

    #[tokio::test]
    async fn test_reserve_rejection_leaves_no_trace() {
        let engine = engine();
        engine.topup(topup(&student(), 500, None)).await.unwrap();
        engine.open_session(terms("sess1", 600, 480)).await.unwrap();

        let result = engine
            .reserve(&student(), 600, &SessionId::new("sess1"))
            .await;
        assert!(matches!(
            result,
            Err(PaymentError::InsufficientFunds {
                available: 500,
                requested: 600
            })
        ));

        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.available, Balance(500));
        assert_eq!(wallet.locked, Balance(0));
        assert_eq!(engine.transactions().await.unwrap().len(), 1);
        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn test_reserve_unknown_session() {
        let engine = engine();
        engine.topup(topup(&student(), 500, None)).await.unwrap();
        let result = engine
            .reserve(&student(), 100, &SessionId::new("missing"))
            .await;
        assert!(matches!(result, Err(PaymentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_idempotent_topup() {
        let engine = engine();
        let first = engine
            .topup(topup(&student(), 100_000, Some("evt_1")))
            .await
            .unwrap();
        let second = engine
            .topup(topup(&student(), 100_000, Some("evt_1")))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transaction_ids, second.transaction_ids);
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(100_000));
        assert_eq!(engine.transactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_topup_without_key_applies_twice() {
        let engine = engine();
        engine.topup(topup(&student(), 100, None)).await.unwrap();
        engine.topup(topup(&student(), 100, None)).await.unwrap();
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(200));
    }

    #[tokio::test]
    async fn test_release_reservation_clamps_at_locked() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;

        engine
            .release_reservation(&student(), 800, &SessionId::new("sess1"))
            .await
            .unwrap();

        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.locked, Balance(0));
        assert_eq!(wallet.available, Balance(1_000));

        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::ReservationReleased);
        assert!(session.released_at.is_some());

        let release = engine
            .transactions()
            .await
            .unwrap()
            .into_iter()
            .find(|tx| tx.r#type == TransactionType::ReservationRelease)
            .unwrap();
        assert_eq!(release.amount, 500);
    }

    #[tokio::test]
    async fn test_release_is_capped_at_session_reservation() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sessA", 500, 400).await;
        reserved(&engine, "sessB", 500, 400).await;

        engine
            .release_reservation(&student(), 800, &SessionId::new("sessA"))
            .await
            .unwrap();

        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.available, Balance(500));
        assert_eq!(wallet.locked, Balance(500));
        let release = engine
            .transactions()
            .await
            .unwrap()
            .into_iter()
            .find(|tx| tx.r#type == TransactionType::ReservationRelease)
            .unwrap();
        assert_eq!(release.amount, 500);

        engine
            .capture_wallet_mode(capture("sessB", 500, 400))
            .await
            .unwrap();
        let wallet = wallet_of(&engine, &student()).await;
        assert_eq!(wallet.available, Balance(500));
        assert_eq!(wallet.locked, Balance(0));
        assert_eq!(earnings_of(&engine, &mentor()).await.locked, Balance(400));
    }

    #[tokio::test]
    async fn test_topup_overflow_is_rejected() {
        let engine = engine();
        engine.topup(topup(&student(), i64::MAX, None)).await.unwrap();

        let result = engine.topup(topup(&student(), 1, None)).await;
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(i64::MAX));
        assert_eq!(engine.transactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_after_release_is_rejected() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        engine
            .release_reservation(&student(), 500, &SessionId::new("sess1"))
            .await
            .unwrap();

        let result = engine.capture_wallet_mode(capture("sess1", 500, 400)).await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
        assert!(engine.mentor_earnings(&mentor()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_requires_reservation() {
        let engine = engine();
        engine.open_session(terms("sess1", 500, 400)).await.unwrap();
        let result = engine.capture_wallet_mode(capture("sess1", 500, 400)).await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_invalid_split_is_rejected_before_any_write() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        let before = engine.transactions().await.unwrap().len();

        let mut bad = capture("sess1", 500, 400);
        bad.platform_share = 50;
        let result = engine.capture_wallet_mode(bad).await;
        assert!(matches!(
            result,
            Err(PaymentError::InvalidSplit {
                total: 500,
                mentor: 400,
                platform: 50
            })
        ));
        assert_eq!(engine.transactions().await.unwrap().len(), before);
        assert_eq!(wallet_of(&engine, &student()).await.locked, Balance(500));
    }

    #[tokio::test]
    async fn test_capture_with_mismatched_total() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        let result = engine.capture_wallet_mode(capture("sess1", 600, 480)).await;
        assert!(matches!(result, Err(PaymentError::AmountMismatch { .. })));
    }

    #[tokio::test]
    async fn test_capture_with_wrong_mentor() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        let mut request = capture("sess1", 500, 400);
        request.mentor_id = UserId::new("someone-else");
        let result = engine.capture_wallet_mode(request).await;
        assert!(matches!(result, Err(PaymentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_refund_bucket_preference() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();

        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();
        engine
            .sweep_due_releases_at(Utc::now() + Duration::hours(25))
            .await
            .unwrap();

        // A second session leaves only 5_000 locked for the mentor.
        reserved(&engine, "sess2", 6_000, 5_000).await;
        engine
            .capture_wallet_mode(capture("sess2", 6_000, 5_000))
            .await
            .unwrap();
        let earnings = earnings_of(&engine, &mentor()).await;
        assert_eq!(earnings.available, Balance(48_000));
        assert_eq!(earnings.locked, Balance(5_000));

        let receipt = engine
            .refund(refund("sess1", 10_000, 8_000, None))
            .await
            .unwrap();

        let earnings = earnings_of(&engine, &mentor()).await;
        assert_eq!(earnings.locked, Balance(0));
        assert_eq!(earnings.available, Balance(45_000));

        let reversals: Vec<LedgerTransaction> = engine
            .transactions()
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| {
                tx.r#type == TransactionType::EarningsReversal
                    && receipt.transaction_ids.contains(&tx.id)
            })
            .collect();
        assert_eq!(reversals.len(), 2);
        assert_eq!(reversals[0].from_account, Account::MentorLocked);
        assert_eq!(reversals[0].amount, 5_000);
        assert_eq!(reversals[1].from_account, Account::MentorAvailable);
        assert_eq!(reversals[1].amount, 3_000);
    }

    #[tokio::test]
    async fn test_refund_cannot_exceed_capture() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();

        engine
            .refund(refund("sess1", 40_000, 32_000, None))
            .await
            .unwrap();
        let again = engine.refund(refund("sess1", 40_000, 32_000, None)).await;
        assert!(matches!(
            again,
            Err(PaymentError::RefundExceedsCapture { .. })
        ));
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(80_000));
    }

    #[tokio::test]
    async fn test_refund_replay_with_key_is_noop() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();

        let first = engine
            .refund(refund("sess1", 10_000, 8_000, Some("rfnd_1")))
            .await
            .unwrap();
        let second = engine
            .refund(refund("sess1", 10_000, 8_000, Some("rfnd_1")))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(first.transaction_ids, second.transaction_ids);
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(50_000));
    }

    #[tokio::test]
    async fn test_refund_before_capture_is_rejected() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        let result = engine.refund(refund("sess1", 100, 80, None)).await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
        assert_eq!(wallet_of(&engine, &student()).await.available, Balance(500));
    }

    #[tokio::test]
    async fn test_direct_capture_replay_converges() {
        let engine = engine();
        let request = DirectCaptureRequest {
            session_id: SessionId::new("sess-d"),
            student_id: student(),
            mentor_id: mentor(),
            total: 60_000,
            mentor_share: 48_000,
            platform_share: 12_000,
            gateway: "razorpay".into(),
            gateway_reference: "pay_abc".into(),
        };

        let first = engine.capture_direct_mode(request.clone()).await.unwrap();
        let second = engine.capture_direct_mode(request).await.unwrap();

        assert_eq!(first.transaction_ids.len(), 2);
        assert!(second.replayed);
        assert_eq!(first.transaction_ids, second.transaction_ids);
        assert_eq!(earnings_of(&engine, &mentor()).await.locked, Balance(48_000));
        assert_eq!(platform_revenue(&engine).await, 12_000);
        assert!(engine.wallet(&student()).await.unwrap().is_none());

        let session = engine
            .session(&SessionId::new("sess-d"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.mode, PaymentMode::Direct);
        assert_eq!(session.status, SessionStatus::Captured);
        assert_eq!(session.gateway_reference.as_deref(), Some("pay_abc"));
    }

    #[tokio::test]
    async fn test_direct_capture_of_opened_session() {
        let engine = engine();
        engine.open_session(terms("sess1", 500, 400)).await.unwrap();
        engine
            .capture_direct_mode(DirectCaptureRequest {
                session_id: SessionId::new("sess1"),
                student_id: student(),
                mentor_id: mentor(),
                total: 500,
                mentor_share: 400,
                platform_share: 100,
                gateway: "stripe".into(),
                gateway_reference: "ch_1".into(),
            })
            .await
            .unwrap();
        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.mode, PaymentMode::Direct);
        assert_eq!(session.status, SessionStatus::Captured);
    }

    #[tokio::test]
    async fn test_direct_capture_rejects_reserved_session() {
        let engine = engine();
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        let result = engine
            .capture_direct_mode(DirectCaptureRequest {
                session_id: SessionId::new("sess1"),
                student_id: student(),
                mentor_id: mentor(),
                total: 500,
                mentor_share: 400,
                platform_share: 100,
                gateway: "stripe".into(),
                gateway_reference: "ch_1".into(),
            })
            .await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_sweep_matures_earnings_once() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();

        // Still inside the maturation window.
        assert_eq!(engine.sweep_due_releases().await.unwrap(), 0);

        let later = Utc::now() + Duration::hours(25);
        assert_eq!(engine.sweep_due_releases_at(later).await.unwrap(), 1);
        let earnings = earnings_of(&engine, &mentor()).await;
        assert_eq!(earnings.available, Balance(48_000));
        assert_eq!(earnings.locked, Balance(0));
        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::EarningsReleased);

        assert_eq!(engine.sweep_due_releases_at(later).await.unwrap(), 0);
        assert_eq!(earnings_of(&engine, &mentor()).await.available, Balance(48_000));
    }

    #[tokio::test]
    async fn test_sweep_releases_residual_of_partially_refunded_session() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();
        engine
            .refund(refund("sess1", 10_000, 8_000, None))
            .await
            .unwrap();

        let later = Utc::now() + Duration::hours(25);
        assert_eq!(engine.sweep_due_releases_at(later).await.unwrap(), 1);
        let earnings = earnings_of(&engine, &mentor()).await;
        assert_eq!(earnings.available, Balance(40_000));
        assert_eq!(earnings.locked, Balance(0));

        let session = engine
            .session(&SessionId::new("sess1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Refunded);
        assert!(session.released_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_with_unbounded_window_releases_nothing() {
        let config = Config {
            maturation_window_hours: i64::MAX,
            ..Config::default()
        };
        let engine = SettlementEngine::new(Arc::new(InMemoryLedgerStore::new()), &config);
        engine.topup(topup(&student(), 1_000, None)).await.unwrap();
        reserved(&engine, "sess1", 500, 400).await;
        engine
            .capture_wallet_mode(capture("sess1", 500, 400))
            .await
            .unwrap();

        let released = engine
            .sweep_due_releases_at(Utc::now() + Duration::days(365))
            .await
            .unwrap();
        assert_eq!(released, 0);
        assert_eq!(earnings_of(&engine, &mentor()).await.locked, Balance(400));
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_release_once() {
        let engine = Arc::new(engine());
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        for (i, total) in [10_000, 20_000, 30_000].into_iter().enumerate() {
            let session = format!("sess{}", i);
            reserved(&engine, &session, total, total * 4 / 5).await;
            engine
                .capture_wallet_mode(capture(&session, total, total * 4 / 5))
                .await
                .unwrap();
        }

        let later = Utc::now() + Duration::hours(25);
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.sweep_due_releases_at(later).await.unwrap() })
            })
            .collect();
        let mut total_released = 0;
        for run in runs {
            total_released += run.await.unwrap();
        }

        assert_eq!(total_released, 3);
        let earnings = earnings_of(&engine, &mentor()).await;
        assert_eq!(earnings.available, Balance(48_000));
        assert_eq!(earnings.locked, Balance(0));
    }

    #[tokio::test]
    async fn test_payout_lifecycle() {
        let engine = engine();
        engine.topup(topup(&student(), 100_000, None)).await.unwrap();
        reserved(&engine, "sess1", 60_000, 48_000).await;
        engine
            .capture_wallet_mode(capture("sess1", 60_000, 48_000))
            .await
            .unwrap();

        // Locked earnings are not withdrawable.
        let early = engine.request_payout(&mentor(), 10_000, None).await;
        assert!(matches!(early, Err(PaymentError::InsufficientFunds { .. })));

        engine
            .sweep_due_releases_at(Utc::now() + Duration::hours(25))
            .await
            .unwrap();
        let receipt = engine
            .request_payout(&mentor(), 30_000, Some("payout_1".into()))
            .await
            .unwrap();
        let payout_id = receipt.payout_id.unwrap();
        assert_eq!(earnings_of(&engine, &mentor()).await.available, Balance(18_000));

        let replay = engine
            .request_payout(&mentor(), 30_000, Some("payout_1".into()))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.payout_id, Some(payout_id));
        assert_eq!(earnings_of(&engine, &mentor()).await.available, Balance(18_000));

        let pending = engine
            .mark_payout_pending(payout_id, "pout_1".into())
            .await
            .unwrap();
        assert_eq!(pending.status, PayoutStatus::Pending);
        let paid = engine.complete_payout(payout_id).await.unwrap();
        assert_eq!(paid.status, PayoutStatus::Paid);
        assert!(engine.fail_payout(payout_id, "late bounce").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_payout_restores_earnings() {
        let engine = engine();
        engine
            .capture_direct_mode(DirectCaptureRequest {
                session_id: SessionId::new("sess1"),
                student_id: student(),
                mentor_id: mentor(),
                total: 10_000,
                mentor_share: 8_000,
                platform_share: 2_000,
                gateway: "stripe".into(),
                gateway_reference: "ch_1".into(),
            })
            .await
            .unwrap();
        engine
            .sweep_due_releases_at(Utc::now() + Duration::hours(25))
            .await
            .unwrap();

        let receipt = engine.request_payout(&mentor(), 8_000, None).await.unwrap();
        let payout_id = receipt.payout_id.unwrap();
        assert_eq!(earnings_of(&engine, &mentor()).await.available, Balance(0));

        let failed = engine.fail_payout(payout_id, "account closed").await.unwrap();
        assert_eq!(failed.status, PayoutStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("account closed"));
        assert_eq!(earnings_of(&engine, &mentor()).await.available, Balance(8_000));
    }

    #[tokio::test]
    async fn test_create_or_get_is_stable() {
        let engine = engine();
        let created = engine.create_or_get_wallet(&student()).await.unwrap();
        assert_eq!(created.available, Balance(0));
        engine.topup(topup(&student(), 700, None)).await.unwrap();
        let fetched = engine.create_or_get_wallet(&student()).await.unwrap();
        assert_eq!(fetched.available, Balance(700));

        let earnings = engine.create_or_get_mentor_earnings(&mentor()).await.unwrap();
        assert_eq!(earnings.total(), Balance(0));
        assert_eq!(earnings.currency, "INR");
    }

    #[tokio::test]
    async fn test_open_session_is_idempotent_for_same_terms() {
        let engine = engine();
        let first = engine.open_session(terms("sess1", 500, 400)).await.unwrap();
        let again = engine.open_session(terms("sess1", 500, 400)).await.unwrap();
        assert_eq!(first, again);

        let conflicting = engine.open_session(terms("sess1", 900, 400)).await;
        assert!(matches!(conflicting, Err(PaymentError::ValidationError(_))));
    }
}

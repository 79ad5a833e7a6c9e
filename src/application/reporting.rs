//! Read-only views over a ledger store: money totals and a replay check of
//! the balance projections against the append-only ledger.

use crate::domain::ids::UserId;
use crate::domain::ports::LedgerStore;
use crate::domain::transaction::{Account, LedgerTransaction, TransactionType};
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Money totals across every bucket, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LedgerSummary {
    pub student_available: i64,
    pub student_locked: i64,
    pub mentor_available: i64,
    pub mentor_locked: i64,
    pub platform_revenue: i64,
    /// Money that entered through the gateway (topups, direct charges, payout reversals).
    pub gateway_inflow: i64,
    /// Money that left through the gateway (captures, refunds, payouts).
    pub gateway_outflow: i64,
    pub transaction_count: usize,
    pub refund_count: usize,
    pub payout_count: usize,
}

impl LedgerSummary {
    /// Money currently held inside the platform.
    pub fn internal_total(&self) -> i64 {
        self.student_available
            + self.student_locked
            + self.mentor_available
            + self.mentor_locked
            + self.platform_revenue
    }

    pub fn net_gateway_inflow(&self) -> i64 {
        self.gateway_inflow - self.gateway_outflow
    }

    /// No money was created or destroyed inside the platform.
    pub fn is_conserved(&self) -> bool {
        self.internal_total() == self.net_gateway_inflow()
    }
}

/// Totals the projections and the platform/gateway flows recorded in the ledger.
pub async fn summarize(store: &dyn LedgerStore) -> Result<LedgerSummary> {
    let mut summary = LedgerSummary::default();

    for wallet in store.all_wallets().await? {
        summary.student_available += wallet.available.value();
        summary.student_locked += wallet.locked.value();
    }
    for earnings in store.all_mentor_earnings().await? {
        summary.mentor_available += earnings.available.value();
        summary.mentor_locked += earnings.locked.value();
    }

    for tx in store.transactions().await? {
        summary.transaction_count += 1;
        match tx.r#type {
            TransactionType::Refund => summary.refund_count += 1,
            TransactionType::Payout => summary.payout_count += 1,
            _ => {}
        }
        if tx.to_account == Account::PlatformRevenue {
            summary.platform_revenue += tx.amount;
        }
        if tx.from_account == Account::PlatformRevenue {
            summary.platform_revenue -= tx.amount;
        }
        if tx.from_account == Account::ExternalGateway {
            summary.gateway_inflow += tx.amount;
        }
        if tx.to_account == Account::ExternalGateway {
            summary.gateway_outflow += tx.amount;
        }
    }

    Ok(summary)
}

/// Balances per `(owner, account)` obtained by replaying ledger rows in order.
/// Global accounts are keyed by an empty owner.
pub fn replay(transactions: &[LedgerTransaction]) -> BTreeMap<(String, Account), i64> {
    let mut balances = BTreeMap::new();
    for tx in transactions {
        let owner = |account: Account| {
            if account.is_subject_scoped() {
                tx.subject_user_id.to_string()
            } else {
                String::new()
            }
        };
        *balances
            .entry((owner(tx.from_account), tx.from_account))
            .or_insert(0) -= tx.amount;
        *balances
            .entry((owner(tx.to_account), tx.to_account))
            .or_insert(0) += tx.amount;
    }
    balances
}

/// A projection bucket disagreeing with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub owner: UserId,
    pub account: Account,
    pub projected: i64,
    pub replayed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Reconciliation {
    pub transactions_replayed: usize,
    pub mismatches: Vec<Mismatch>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Replays the full ledger and compares the result with every wallet and
/// earnings projection.
pub async fn reconcile(store: &dyn LedgerStore) -> Result<Reconciliation> {
    let transactions = store.transactions().await?;
    let mut replayed = replay(&transactions);

    let mut projected: Vec<(UserId, Account, i64)> = Vec::new();
    for wallet in store.all_wallets().await? {
        projected.push((wallet.user_id.clone(), Account::StudentAvailable, wallet.available.value()));
        projected.push((wallet.user_id, Account::StudentLocked, wallet.locked.value()));
    }
    for earnings in store.all_mentor_earnings().await? {
        projected.push((earnings.mentor_id.clone(), Account::MentorAvailable, earnings.available.value()));
        projected.push((earnings.mentor_id, Account::MentorLocked, earnings.locked.value()));
    }

    let mut mismatches = Vec::new();
    for (owner, account, balance) in projected {
        let from_ledger = replayed
            .remove(&(owner.to_string(), account))
            .unwrap_or(0);
        if from_ledger != balance {
            mismatches.push(Mismatch {
                owner,
                account,
                projected: balance,
                replayed: from_ledger,
            });
        }
    }
    // Ledger activity on subject buckets with no projection at all.
    for ((owner, account), balance) in replayed {
        if account.is_subject_scoped() && balance != 0 {
            mismatches.push(Mismatch {
                owner: UserId::new(owner),
                account,
                projected: 0,
                replayed: balance,
            });
        }
    }

    for mismatch in &mismatches {
        warn!(
            owner = %mismatch.owner,
            account = %mismatch.account,
            projected = mismatch.projected,
            replayed = mismatch.replayed,
            "projection disagrees with ledger"
        );
    }

    Ok(Reconciliation {
        transactions_replayed: transactions.len(),
        mismatches,
    })
}

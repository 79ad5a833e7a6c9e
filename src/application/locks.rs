use crate::domain::ids::{SessionId, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// A serialization domain: one subject within one account family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Wallet(UserId),
    Earnings(UserId),
    Session(SessionId),
    Payout(Uuid),
}

/// Guards held for the duration of one operation.
pub struct LockSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Per-subject async mutexes.
///
/// Operations touching the same wallet, earnings account, session or payout
/// run one at a time; everything else proceeds in parallel. Keys are always
/// acquired in sorted order so two operations can never wait on each other.
#[derive(Default)]
pub struct SubjectLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, mut keys: Vec<LockKey>) -> LockSet {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.locks.entry(key).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }
        LockSet { _guards: guards }
    }
}

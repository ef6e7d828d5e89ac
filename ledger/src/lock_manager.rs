//! Per-account locks serializing writers inside one process.
//!
//! Every write path locks all the accounts it touches before opening its
//! database transaction. Locks are taken in ascending account-id order, so two
//! operations over overlapping accounts can never wait on each other in a cycle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use aurapay_common::AccountId;

/// Locks held for the duration of one operation. Dropping releases them.
#[derive(Debug)]
pub struct AccountLocks {
    accounts: Vec<AccountId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AccountLocks {
    /// Accounts held, in acquisition order.
    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }
}

/// Table of per-account async mutexes.
#[derive(Debug)]
pub struct AccountLockManager {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    soft_limit: usize,
}

impl AccountLockManager {
    /// Create a lock table that prunes idle entries once it holds more than `soft_limit`.
    pub fn new(soft_limit: usize) -> Self {
        Self {
            locks: DashMap::new(),
            soft_limit,
        }
    }

    fn handle(&self, account: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock every listed account. Duplicates are locked once.
    pub async fn acquire(&self, accounts: &[&AccountId]) -> AccountLocks {
        let mut ordered: Vec<AccountId> = accounts.iter().map(|a| (*a).clone()).collect();
        ordered.sort();
        ordered.dedup();

        if self.locks.len() > self.soft_limit {
            self.prune_idle();
        }

        let mut guards = Vec::with_capacity(ordered.len());
        for account in &ordered {
            // The map shard guard is released before awaiting.
            let mutex = self.handle(account);
            guards.push(mutex.lock_owned().await);
        }

        AccountLocks {
            accounts: ordered,
            _guards: guards,
        }
    }

    /// Drop table entries nobody holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let pruned = before.saturating_sub(self.locks.len());
        if pruned > 0 {
            debug!(pruned, remaining = self.locks.len(), "Pruned idle account locks");
        }
        pruned
    }

    /// Number of accounts currently in the table.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for AccountLockManager {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn account(id: &str) -> AccountId {
        AccountId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_sorts_and_dedups() {
        let manager = AccountLockManager::default();
        let (b, a) = (account("bob"), account("alice"));

        let held = manager.acquire(&[&b, &a, &b]).await;
        let ids: Vec<_> = held.accounts().iter().map(|a| a.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let manager = Arc::new(AccountLockManager::default());
        let alice = account("alice");

        let held = manager.acquire(&[&alice]).await;

        let contender = {
            let manager = manager.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let _held = manager.acquire(&[&alice]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_accounts_do_not_block() {
        let manager = AccountLockManager::default();
        let (alice, bob) = (account("alice"), account("bob"));

        let _first = manager.acquire(&[&alice]).await;
        let second = tokio::time::timeout(Duration::from_millis(100), manager.acquire(&[&bob])).await;
        tokio_test::assert_ok!(second);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let manager = AccountLockManager::new(1);
        let (alice, bob) = (account("alice"), account("bob"));

        let held = manager.acquire(&[&alice]).await;
        drop(manager.acquire(&[&bob]).await);
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.prune_idle(), 1);
        assert_eq!(manager.len(), 1);

        drop(held);
        manager.prune_idle();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_opposing_order_does_not_deadlock() {
        let manager = Arc::new(AccountLockManager::default());
        let (alice, bob) = (account("alice"), account("bob"));

        let mut tasks = Vec::new();
        for i in 0..50 {
            let manager = manager.clone();
            let (x, y) = if i % 2 == 0 {
                (alice.clone(), bob.clone())
            } else {
                (bob.clone(), alice.clone())
            };
            tasks.push(tokio::spawn(async move {
                let _held = manager.acquire(&[&x, &y]).await;
                tokio::task::yield_now().await;
            }));
        }

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(Duration::from_secs(5), all).await.unwrap();
        assert!(results.into_iter().all(|r| r.is_ok()));
    }
}

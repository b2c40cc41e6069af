//! Per-client transactions under strict two-phase locking.
//!
//! Each client runs at most one transaction at a time, so the client id
//! doubles as the transaction id. Locks accumulate over the transaction's
//! life and are released together at commit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::lock_manager::{LockMode, Resource, ResourceLockManager, WaitsForGraph};
use crate::{Error, Result};

/// One client's running transaction: the resources it currently holds and
/// the mode each is held in.
pub struct Transaction {
    client_id: Uuid,
    resources: RwLock<HashMap<Resource, LockMode>>,
}

impl Transaction {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// A snapshot of the locks the transaction currently holds.
    pub fn held_locks(&self) -> HashMap<Resource, LockMode> {
        self.resources.read().clone()
    }
}

/// Tracks every running transaction and mediates lock acquisition,
/// refusing requests that would close a waits-for cycle.
pub struct TransactionManager {
    lock_manager: Arc<ResourceLockManager>,
    waits_for: WaitsForGraph,
    transactions: RwLock<HashMap<Uuid, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<ResourceLockManager>) -> Self {
        TransactionManager {
            lock_manager,
            waits_for: WaitsForGraph::new(),
            transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<ResourceLockManager> {
        &self.lock_manager
    }

    /// The client's running transaction, if any.
    pub fn transaction(&self, client_id: Uuid) -> Option<Arc<Transaction>> {
        self.transactions.read().get(&client_id).cloned()
    }

    /// Starts a transaction for the client.
    pub fn begin(&self, client_id: Uuid) -> Result<()> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&client_id) {
            return Err(Error::TransactionInProgress);
        }
        transactions.insert(
            client_id,
            Arc::new(Transaction {
                client_id,
                resources: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    /// Acquires a lock on `(table, key)` for the client's transaction.
    ///
    /// Re-locking a held resource in the same mode is a no-op; asking to
    /// write a resource held for reading is refused (no upgrades). Before
    /// blocking, a waits-for edge is added towards every conflicting
    /// holder; if that closes a cycle the edges are withdrawn and the
    /// request fails with [`Error::Deadlock`] instead of waiting.
    pub fn lock(&self, client_id: Uuid, table: &str, key: i64, mode: LockMode) -> Result<()> {
        let tx = self.transaction(client_id).ok_or(Error::NoTransaction)?;
        let resource = Resource {
            table: table.to_string(),
            key,
        };
        {
            let held = tx.resources.read();
            if let Some(&current) = held.get(&resource) {
                if current == LockMode::Shared && mode == LockMode::Exclusive {
                    return Err(Error::CannotUpgrade);
                }
                return Ok(());
            }
        }

        let conflicts = self.conflicting_transactions(&resource, mode, client_id);
        for &holder in &conflicts {
            self.waits_for.add_edge(client_id, holder);
        }
        if self.waits_for.has_cycle() {
            for &holder in &conflicts {
                self.waits_for.remove_edge(client_id, holder);
            }
            debug!(%client_id, table, key, "lock request refused: deadlock");
            return Err(Error::Deadlock);
        }

        self.lock_manager.lock(&resource, mode);
        for &holder in &conflicts {
            self.waits_for.remove_edge(client_id, holder);
        }
        tx.resources.write().insert(resource, mode);
        Ok(())
    }

    /// Transactions whose hold on `resource` conflicts with a request in
    /// `mode` (either side exclusive).
    fn conflicting_transactions(
        &self,
        resource: &Resource,
        mode: LockMode,
        requester: Uuid,
    ) -> Vec<Uuid> {
        let transactions = self.transactions.read();
        transactions
            .values()
            .filter(|tx| tx.client_id != requester)
            .filter(|tx| match tx.resources.read().get(resource) {
                Some(&held) => held == LockMode::Exclusive || mode == LockMode::Exclusive,
                None => false,
            })
            .map(|tx| tx.client_id)
            .collect()
    }

    /// Releases one lock. The resource and the mode must both match what
    /// the transaction holds.
    pub fn unlock(&self, client_id: Uuid, table: &str, key: i64, mode: LockMode) -> Result<()> {
        let tx = self.transaction(client_id).ok_or(Error::NoTransaction)?;
        let resource = Resource {
            table: table.to_string(),
            key,
        };
        {
            let mut held = tx.resources.write();
            match held.get(&resource) {
                Some(&current) if current == mode => {
                    held.remove(&resource);
                }
                _ => return Err(Error::InvalidUnlock),
            }
        }
        self.lock_manager.unlock(&resource, mode)
    }

    /// Commits the client's transaction: releases every held resource and
    /// forgets the transaction. This is the release phase of strict 2PL.
    pub fn commit(&self, client_id: Uuid) -> Result<()> {
        let mut transactions = self.transactions.write();
        let Some(tx) = transactions.get(&client_id) else {
            return Err(Error::NoTransaction);
        };
        for (resource, mode) in tx.resources.read().iter() {
            self.lock_manager.unlock(resource, *mode)?;
        }
        transactions.remove(&client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(Arc::new(ResourceLockManager::new()))
    }

    #[test]
    fn begin_twice_is_rejected() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();
        assert!(matches!(tm.begin(client), Err(Error::TransactionInProgress)));
    }

    #[test]
    fn lock_without_transaction_fails() {
        let tm = manager();
        let client = Uuid::new_v4();
        assert!(matches!(
            tm.lock(client, "t", 0, LockMode::Shared),
            Err(Error::NoTransaction)
        ));
    }

    #[test]
    fn relock_is_idempotent_but_upgrade_is_refused() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();
        tm.lock(client, "t", 0, LockMode::Shared).unwrap();
        tm.lock(client, "t", 0, LockMode::Shared).unwrap();
        assert!(matches!(
            tm.lock(client, "t", 0, LockMode::Exclusive),
            Err(Error::CannotUpgrade)
        ));
        let tx = tm.transaction(client).unwrap();
        assert_eq!(tx.held_locks().len(), 1);
    }

    #[test]
    fn unlock_requires_exact_mode() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();
        tm.lock(client, "t", 0, LockMode::Exclusive).unwrap();
        assert!(matches!(
            tm.unlock(client, "t", 0, LockMode::Shared),
            Err(Error::InvalidUnlock)
        ));
        tm.unlock(client, "t", 0, LockMode::Exclusive).unwrap();
        assert!(tm.transaction(client).unwrap().held_locks().is_empty());
    }

    #[test]
    fn commit_releases_everything() {
        let tm = manager();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        tm.begin(first).unwrap();
        tm.lock(first, "t", 0, LockMode::Exclusive).unwrap();
        tm.lock(first, "t", 1, LockMode::Shared).unwrap();
        tm.commit(first).unwrap();
        assert!(tm.transaction(first).is_none());

        // A second transaction can now write-lock both keys without blocking.
        tm.begin(second).unwrap();
        tm.lock(second, "t", 0, LockMode::Exclusive).unwrap();
        tm.lock(second, "t", 1, LockMode::Exclusive).unwrap();
        tm.commit(second).unwrap();
    }

    #[test]
    fn commit_without_transaction_fails() {
        let tm = manager();
        assert!(matches!(tm.commit(Uuid::new_v4()), Err(Error::NoTransaction)));
    }
}

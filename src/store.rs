// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Transactional ledger store.
//!
//! The engine talks to durable state only through [`Store`] and
//! [`StoreTransaction`]. A transaction reads and writes balance rows, appends
//! journal entries, and then either commits everything or nothing.
//!
//! [`MemoryStore`] implements the contract in process:
//!
//! - Each balance row sits behind its own mutex. A transaction locks a row on
//!   first access and keeps it until it finishes (strict two-phase locking),
//!   which makes transactions touching the same user serializable.
//! - Writes are staged inside the transaction and applied on commit while
//!   holding the journal lock, so balance and journal change together.
//! - Dropping an uncommitted transaction discards its staged writes.
//! - Lock waits are bounded by a timeout and surface as
//!   [`StoreError::LockTimeout`], which callers may retry.

use crate::balance::Balance;
use crate::base::{OperationId, UserId};
use crate::error::StoreError;
use crate::journal::{JournalEntry, PendingEntry};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Source of serializable transactions.
pub trait Store: Send + Sync {
    type Transaction<'a>: StoreTransaction
    where
        Self: 'a;

    /// Starts a transaction.
    fn begin(&self) -> Result<Self::Transaction<'_>, StoreError>;
}

/// Unit of work against a [`Store`].
///
/// Implementations must roll back on drop when neither [`commit`] nor
/// [`rollback`] was called.
///
/// [`commit`]: StoreTransaction::commit
/// [`rollback`]: StoreTransaction::rollback
pub trait StoreTransaction {
    /// Reads the balance of `user_id`, `None` if the user has no row.
    fn read_balance(&mut self, user_id: UserId) -> Result<Option<Balance>, StoreError>;

    /// Inserts or replaces the balance row of `balance.user_id()`.
    fn upsert_balance(&mut self, balance: Balance) -> Result<(), StoreError>;

    fn append_journal(&mut self, entry: PendingEntry) -> Result<(), StoreError>;

    /// Looks up the entry recorded for `operation_id`, if any.
    fn find_operation(
        &mut self,
        operation_id: OperationId,
    ) -> Result<Option<JournalEntry>, StoreError>;

    /// Committed journal entries of `user_id`, in journal order.
    fn journal(&mut self, user_id: UserId) -> Result<Vec<JournalEntry>, StoreError>;

    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Discards all staged writes. Calling it on a finished transaction is a
    /// no-op.
    fn rollback(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

type Slot = Arc<Mutex<Option<Balance>>>;
type SlotGuard = ArcMutexGuard<RawMutex, Option<Balance>>;

#[derive(Debug, Default)]
struct Journal {
    entries: Vec<JournalEntry>,
    /// Index into `entries` by operation ID.
    operations: HashMap<OperationId, usize>,
}

/// In-memory [`Store`] with row-level locking.
#[derive(Debug)]
pub struct MemoryStore {
    /// Row slots indexed by user ID. A slot holding `None` is a user without
    /// a balance; it exists only while some transaction locks the absent row
    /// and is evicted once the last one lets go.
    rows: DashMap<UserId, Slot>,
    journal: Mutex<Journal>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a store whose transactions wait at most `lock_timeout` for a
    /// row lock.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            rows: DashMap::new(),
            journal: Mutex::new(Journal::default()),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn slot(&self, user_id: UserId) -> Slot {
        // Clone the Arc so the shard lock is released before the row is locked.
        Arc::clone(&self.rows.entry(user_id).or_default())
    }

    /// Removes the slot of `user_id` if it holds no balance and nothing else
    /// references it.
    fn evict_vacant(&self, user_id: UserId) {
        // `remove_if` holds the shard lock, so no new reference can appear
        // while the slot is inspected.
        self.rows.remove_if(&user_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_some_and(|row| row.is_none())
        });
    }

    /// Number of row slots, including vacant ones still locked by a
    /// transaction.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Snapshot of all existing balances, ordered by user ID.
    pub fn balances(&self) -> Vec<Balance> {
        let slots: Vec<(UserId, Slot)> = self
            .rows
            .iter()
            .map(|row| (*row.key(), Arc::clone(row.value())))
            .collect();

        let mut balances = Vec::with_capacity(slots.len());
        for (user_id, slot) in slots {
            let balance = slot.lock().clone();
            drop(slot);
            match balance {
                Some(balance) => balances.push(balance),
                None => self.evict_vacant(user_id),
            }
        }
        balances.sort_by_key(Balance::user_id);
        balances
    }

    /// Snapshot of the whole journal, in commit order.
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        self.journal.lock().entries.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Transaction<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> Result<Self::Transaction<'_>, StoreError> {
        Ok(MemoryTransaction {
            store: self,
            locks: HashMap::new(),
            staged: HashMap::new(),
            pending: Vec::new(),
            finished: false,
        })
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    /// Row locks held until the transaction ends.
    locks: HashMap<UserId, SlotGuard>,
    staged: HashMap<UserId, Balance>,
    pending: Vec<PendingEntry>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn lock_row(&mut self, user_id: UserId) -> Result<&mut SlotGuard, StoreError> {
        match self.locks.entry(user_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let slot = self.store.slot(user_id);
                let guard = slot
                    .try_lock_arc_for(self.store.lock_timeout)
                    .ok_or(StoreError::LockTimeout(user_id))?;
                Ok(entry.insert(guard))
            }
        }
    }

    fn discard(&mut self) {
        if !self.finished && !(self.staged.is_empty() && self.pending.is_empty()) {
            debug!(
                staged = self.staged.len(),
                pending = self.pending.len(),
                "Rolling back transaction"
            );
        }
        self.staged.clear();
        self.pending.clear();
        self.finished = true;
        self.release_rows();
    }

    /// Unlocks every row, evicting slots of users that still have no balance.
    fn release_rows(&mut self) {
        for (user_id, guard) in self.locks.drain() {
            let vacant = guard.is_none();
            drop(guard);
            if vacant {
                self.store.evict_vacant(user_id);
            }
        }
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn read_balance(&mut self, user_id: UserId) -> Result<Option<Balance>, StoreError> {
        if let Some(balance) = self.staged.get(&user_id) {
            return Ok(Some(balance.clone()));
        }
        let row = self.lock_row(user_id)?;
        Ok((**row).clone())
    }

    fn upsert_balance(&mut self, balance: Balance) -> Result<(), StoreError> {
        let user_id = balance.user_id();
        self.lock_row(user_id)?;
        self.staged.insert(user_id, balance);
        Ok(())
    }

    fn append_journal(&mut self, entry: PendingEntry) -> Result<(), StoreError> {
        self.pending.push(entry);
        Ok(())
    }

    fn find_operation(
        &mut self,
        operation_id: OperationId,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let journal = self.store.journal.lock();
        Ok(journal
            .operations
            .get(&operation_id)
            .and_then(|&index| journal.entries.get(index))
            .cloned())
    }

    fn journal(&mut self, user_id: UserId) -> Result<Vec<JournalEntry>, StoreError> {
        // Holding the row lock keeps the user's journal stable until we finish.
        self.lock_row(user_id)?;
        let journal = self.store.journal.lock();
        Ok(journal
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let mut journal = self.store.journal.lock();

        for (index, entry) in self.pending.iter().enumerate() {
            let reused = journal.operations.contains_key(&entry.operation_id)
                || self.pending[..index]
                    .iter()
                    .any(|other| other.operation_id == entry.operation_id);
            if reused {
                return Err(StoreError::Conflict(format!(
                    "operation {} committed concurrently",
                    entry.operation_id
                )));
            }
        }
        debug_assert!(
            self.staged.keys().all(|id| self.locks.contains_key(id)),
            "balance staged without its row lock"
        );

        for (user_id, balance) in self.staged.drain() {
            if let Some(row) = self.locks.get_mut(&user_id) {
                **row = Some(balance);
            }
        }

        let created_at = Utc::now();
        for entry in self.pending.drain(..) {
            let index = journal.entries.len();
            journal.operations.insert(entry.operation_id, index);
            journal
                .entries
                .push(entry.into_entry(index as u64 + 1, created_at));
        }
        drop(journal);

        self.finished = true;
        self.release_rows();
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.discard();
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}

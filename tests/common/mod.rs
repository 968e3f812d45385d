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

//! Store wrapper that injects failures into the [`MemoryStore`].

#![allow(dead_code)]

use balance_ledger::{
    Balance, JournalEntry, MemoryStore, MemoryTransaction, OperationId, PendingEntry, Store,
    StoreError, StoreTransaction, UserId,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Where an injected failure is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Append,
    Commit,
    Rollback,
}

/// [`MemoryStore`] that fails the next `n` calls at a [`FaultPoint`] once armed.
pub struct FaultyStore {
    inner: MemoryStore,
    point: FaultPoint,
    error: StoreError,
    remaining: AtomicU32,
}

impl FaultyStore {
    pub fn new(point: FaultPoint, error: StoreError) -> Self {
        Self {
            inner: MemoryStore::new(),
            point,
            error,
            remaining: AtomicU32::new(0),
        }
    }

    /// Fails the next `times` calls at the configured point.
    pub fn arm(&self, times: u32) {
        self.remaining.store(times, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn fault(&self, point: FaultPoint) -> Option<StoreError> {
        if point != self.point {
            return None;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| self.error.clone())
    }
}

impl Store for FaultyStore {
    type Transaction<'a> = FaultyTransaction<'a>;

    fn begin(&self) -> Result<Self::Transaction<'_>, StoreError> {
        Ok(FaultyTransaction {
            inner: self.inner.begin()?,
            store: self,
        })
    }
}

pub struct FaultyTransaction<'a> {
    inner: MemoryTransaction<'a>,
    store: &'a FaultyStore,
}

impl StoreTransaction for FaultyTransaction<'_> {
    fn read_balance(&mut self, user_id: UserId) -> Result<Option<Balance>, StoreError> {
        self.inner.read_balance(user_id)
    }

    fn upsert_balance(&mut self, balance: Balance) -> Result<(), StoreError> {
        self.inner.upsert_balance(balance)
    }

    fn append_journal(&mut self, entry: PendingEntry) -> Result<(), StoreError> {
        if let Some(err) = self.store.fault(FaultPoint::Append) {
            return Err(err);
        }
        self.inner.append_journal(entry)
    }

    fn find_operation(
        &mut self,
        operation_id: OperationId,
    ) -> Result<Option<JournalEntry>, StoreError> {
        self.inner.find_operation(operation_id)
    }

    fn journal(&mut self, user_id: UserId) -> Result<Vec<JournalEntry>, StoreError> {
        self.inner.journal(user_id)
    }

    fn commit(self) -> Result<(), StoreError> {
        let FaultyTransaction { inner, store } = self;
        if let Some(err) = store.fault(FaultPoint::Commit) {
            inner.rollback()?;
            return Err(err);
        }
        inner.commit()
    }

    fn rollback(self) -> Result<(), StoreError> {
        let FaultyTransaction { inner, store } = self;
        if let Some(err) = store.fault(FaultPoint::Rollback) {
            // Dropping the inner transaction still discards its writes.
            drop(inner);
            return Err(err);
        }
        inner.rollback()
    }
}

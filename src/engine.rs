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

//! Ledger engine.
//!
//! The [`Engine`] executes balance operations against a [`Store`]. Each
//! operation runs in exactly one store transaction:
//!
//! - **Income**: credits spendable balance, creating the balance if needed.
//! - **Hold** (create order): moves funds from spendable to the order's hold.
//! - **Capture** (finish order): removes the order's held funds for good.
//! - **Release** (cancel order): returns the order's held funds to spendable.
//!
//! A successful operation writes one balance row and one journal entry and
//! commits both; any failure rolls the transaction back, so nothing is
//! partially applied.
//!
//! # Concurrency
//!
//! The engine keeps no mutable state of its own. Operations on the same user
//! are serialized by the store's row locks; a lock wait that times out or a
//! conflicting commit surfaces as a retryable [`LedgerError::Store`]. The
//! engine never retries by itself.
//!
//! # Idempotency
//!
//! Every operation carries an [`OperationId`]. Submitting the same request
//! again returns the balance recorded when it was first applied, with
//! [`Receipt::replayed`] set, instead of applying it twice.

use crate::balance::Balance;
use crate::base::{OperationId, OrderRef, UserId};
use crate::error::LedgerError;
use crate::journal::{EntryKind, JournalEntry, OrderState, PendingEntry};
use crate::money::MinorUnits;
use crate::store::{MemoryStore, Store, StoreTransaction};
use crate::validator::Intent;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Balance right after the operation. For a replay this is the balance
    /// recorded when the operation was first applied, rebuilt from the
    /// journal.
    pub balance: Balance,
    /// `true` if the operation had already been applied earlier.
    pub replayed: bool,
}

/// Comparison of a stored balance with the balance implied by its journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub user_id: UserId,
    pub recorded_spendable: MinorUnits,
    pub recorded_held: MinorUnits,
    pub journal_spendable: MinorUnits,
    pub journal_held: MinorUnits,
    /// Whether every open hold matches the journal's per-order sum.
    pub holds_match: bool,
    pub entries: usize,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.recorded_spendable == self.journal_spendable
            && self.recorded_held == self.journal_held
            && self.holds_match
    }
}

/// Balance operation engine over a [`Store`].
///
/// # Invariants
///
/// - `spendable >= 0` and `held >= 0` for every committed balance.
/// - `held` equals the sum of the per-order holds.
/// - Every committed balance change has exactly one journal entry.
/// - An operation ID is applied at most once.
pub struct Engine<S = MemoryStore> {
    store: S,
}

impl<S: Store> Engine<S> {
    /// Creates an engine that owns `store`.
    pub fn new(store: S) -> Self {
        Engine { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Credits `amount` minor units to `user_id`.
    ///
    /// # Errors
    ///
    /// Fails only on invalid amounts, overflow, or store errors.
    pub fn income(
        &self,
        operation_id: OperationId,
        user_id: UserId,
        amount: MinorUnits,
    ) -> Result<Receipt, LedgerError> {
        self.execute(&intent(operation_id, user_id, EntryKind::Transfer, None, amount))
    }

    /// Holds `amount` minor units of spendable balance for `order`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UserNotFound`] - user has no balance.
    /// - [`LedgerError::InsufficientFunds`] - spendable balance is smaller than `amount`.
    pub fn hold(
        &self,
        operation_id: OperationId,
        user_id: UserId,
        order: OrderRef,
        amount: MinorUnits,
    ) -> Result<Receipt, LedgerError> {
        self.execute(&intent(
            operation_id,
            user_id,
            EntryKind::Capture,
            Some(order),
            amount,
        ))
    }

    /// Permanently debits `amount` minor units held for `order`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UserNotFound`] - user has no balance.
    /// - [`LedgerError::InsufficientFunds`] - the order's hold is smaller than `amount`.
    pub fn capture(
        &self,
        operation_id: OperationId,
        user_id: UserId,
        order: OrderRef,
        amount: MinorUnits,
    ) -> Result<Receipt, LedgerError> {
        self.execute(&intent(
            operation_id,
            user_id,
            EntryKind::WriteOff,
            Some(order),
            amount,
        ))
    }

    /// Returns `amount` minor units held for `order` to spendable balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UserNotFound`] - user has no balance.
    /// - [`LedgerError::InsufficientFunds`] - the order's hold is smaller than `amount`.
    pub fn release(
        &self,
        operation_id: OperationId,
        user_id: UserId,
        order: OrderRef,
        amount: MinorUnits,
    ) -> Result<Receipt, LedgerError> {
        self.execute(&intent(
            operation_id,
            user_id,
            EntryKind::Cancel,
            Some(order),
            amount,
        ))
    }

    /// Executes a validated intent in one transaction.
    pub fn execute(&self, intent: &Intent) -> Result<Receipt, LedgerError> {
        let mut tx = self.store.begin()?;
        let result = apply(&mut tx, intent);
        let receipt = finish(tx, result)?;

        debug!(
            operation_id = %intent.operation_id,
            user_id = %intent.user_id,
            kind = %intent.kind,
            amount = intent.amount_minor,
            spendable = receipt.balance.spendable(),
            held = receipt.balance.held(),
            replayed = receipt.replayed,
            "Applied operation"
        );
        Ok(receipt)
    }

    /// Returns the current balance of `user_id`.
    pub fn balance(&self, user_id: UserId) -> Result<Balance, LedgerError> {
        let mut tx = self.store.begin()?;
        let result = tx
            .read_balance(user_id)
            .map_err(LedgerError::from)
            .and_then(|balance| balance.ok_or(LedgerError::UserNotFound(user_id)));
        finish(tx, result)
    }

    /// Returns the journal entries of `user_id`, oldest first.
    pub fn journal(&self, user_id: UserId) -> Result<Vec<JournalEntry>, LedgerError> {
        let mut tx = self.store.begin()?;
        let result = tx.journal(user_id).map_err(LedgerError::from);
        finish(tx, result)
    }

    /// Derives the lifecycle state of `order` from the journal.
    pub fn order_state(&self, user_id: UserId, order: OrderRef) -> Result<OrderState, LedgerError> {
        let entries = self.journal(user_id)?;
        Ok(OrderState::from_entries(
            entries.iter().filter(|entry| entry.order() == Some(order)),
        ))
    }

    /// Recomputes the balance of `user_id` from its journal and compares it
    /// with the stored balance.
    ///
    /// Both are read in one transaction, so the comparison never observes a
    /// half-applied operation.
    pub fn reconcile(&self, user_id: UserId) -> Result<Reconciliation, LedgerError> {
        let mut tx = self.store.begin()?;
        let result = reconcile_in(&mut tx, user_id);
        let reconciliation = finish(tx, result)?;
        if !reconciliation.is_consistent() {
            warn!(user_id = %user_id, ?reconciliation, "Balance does not match journal");
        }
        Ok(reconciliation)
    }
}

impl Default for Engine<MemoryStore> {
    fn default() -> Self {
        Self::new(MemoryStore::new())
    }
}

fn intent(
    operation_id: OperationId,
    user_id: UserId,
    kind: EntryKind,
    order: Option<OrderRef>,
    amount: MinorUnits,
) -> Intent {
    Intent {
        operation_id,
        user_id,
        kind,
        order,
        amount_major: Decimal::new(amount, 2),
        amount_minor: amount,
    }
}

/// Commits `tx` if `result` is a success, rolls it back otherwise.
///
/// A failed rollback is logged; the original error is returned.
fn finish<T: StoreTransaction, R>(
    tx: T,
    result: Result<R, LedgerError>,
) -> Result<R, LedgerError> {
    match result {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, cause = %err, "Failed to roll back transaction");
            }
            Err(err)
        }
    }
}

fn apply<T: StoreTransaction>(tx: &mut T, intent: &Intent) -> Result<Receipt, LedgerError> {
    let user_id = intent.user_id;
    let pending = PendingEntry {
        operation_id: intent.operation_id,
        user_id,
        kind: intent.kind,
        order: intent.order,
        amount: intent.kind.signed(intent.amount_minor),
    };

    // Reading first takes the row lock, so an earlier attempt of the same
    // operation on this user is either fully visible or not started.
    let current = tx.read_balance(user_id)?;

    if let Some(prior) = tx.find_operation(intent.operation_id)? {
        if !prior.matches(&pending) {
            return Err(LedgerError::OperationReused(intent.operation_id));
        }
        return Ok(Receipt {
            balance: balance_at(tx, &prior)?,
            replayed: true,
        });
    }

    let mut balance = match (current, intent.kind) {
        (Some(balance), _) => balance,
        (None, EntryKind::Transfer) => Balance::new(user_id),
        (None, _) => return Err(LedgerError::UserNotFound(user_id)),
    };

    let amount = intent.amount_minor;
    match (intent.kind, intent.order) {
        (EntryKind::Transfer, _) => balance.credit(amount)?,
        (EntryKind::Capture, Some(order)) => balance.hold(order, amount)?,
        (EntryKind::WriteOff, Some(order)) => balance.capture(order, amount)?,
        (EntryKind::Cancel, Some(order)) => balance.release(order, amount)?,
        (_, None) => return Err(LedgerError::MissingField("order_id")),
    }

    tx.upsert_balance(balance.clone())?;
    tx.append_journal(pending)?;
    Ok(Receipt {
        balance,
        replayed: false,
    })
}

/// Rebuilds the balance of `entry.user_id` as it stood right after `entry`
/// was committed.
fn balance_at<T: StoreTransaction>(
    tx: &mut T,
    entry: &JournalEntry,
) -> Result<Balance, LedgerError> {
    let mut balance = Balance::new(entry.user_id);
    let history = tx.journal(entry.user_id)?;
    for past in history.iter().take_while(|past| past.sequence <= entry.sequence) {
        let amount = past.amount.abs();
        match (past.kind, past.order()) {
            (EntryKind::Transfer, _) => balance.credit(amount)?,
            (EntryKind::Capture, Some(order)) => balance.hold(order, amount)?,
            (EntryKind::WriteOff, Some(order)) => balance.capture(order, amount)?,
            (EntryKind::Cancel, Some(order)) => balance.release(order, amount)?,
            (_, None) => return Err(LedgerError::MissingField("order_id")),
        }
    }
    Ok(balance)
}

fn reconcile_in<T: StoreTransaction>(
    tx: &mut T,
    user_id: UserId,
) -> Result<Reconciliation, LedgerError> {
    let balance = tx
        .read_balance(user_id)?
        .ok_or(LedgerError::UserNotFound(user_id))?;
    let entries = tx.journal(user_id)?;

    let mut spendable: MinorUnits = 0;
    let mut held: MinorUnits = 0;
    let mut holds: BTreeMap<OrderRef, MinorUnits> = BTreeMap::new();
    for entry in &entries {
        let amount = entry.amount.abs();
        match (entry.kind, entry.order()) {
            (EntryKind::Transfer, _) => spendable += amount,
            (EntryKind::Capture, order) => {
                spendable -= amount;
                held += amount;
                if let Some(order) = order {
                    *holds.entry(order).or_insert(0) += amount;
                }
            }
            (EntryKind::WriteOff, order) => {
                held -= amount;
                if let Some(order) = order {
                    *holds.entry(order).or_insert(0) -= amount;
                }
            }
            (EntryKind::Cancel, order) => {
                held -= amount;
                spendable += amount;
                if let Some(order) = order {
                    *holds.entry(order).or_insert(0) -= amount;
                }
            }
        }
    }
    holds.retain(|_, amount| *amount != 0);
    let recorded: BTreeMap<OrderRef, MinorUnits> = balance
        .holds()
        .map(|(order, amount)| (*order, *amount))
        .collect();

    Ok(Reconciliation {
        user_id,
        recorded_spendable: balance.spendable(),
        recorded_held: balance.held(),
        journal_spendable: spendable,
        journal_held: held,
        holds_match: recorded == holds,
        entries: entries.len(),
    })
}

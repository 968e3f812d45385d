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

//! Balance aggregate.
//!
//! A balance splits a user's funds into `spendable` and `held`. Holds are
//! tracked per order so that finishing or cancelling one order can never
//! consume funds held for another:
//!
//! ```text
//!  spendable ──hold──► held[order] ──capture──► (leaves the ledger)
//!      ▲                    │
//!      └──────release───────┘
//! ```
//!
//! # Example
//!
//! ```
//! use balance_ledger::{Balance, OrderId, OrderRef, ServiceId, UserId};
//!
//! let order = OrderRef::new(ServiceId(1), OrderId(1));
//! let mut balance = Balance::new(UserId(1));
//! balance.credit(1000).unwrap();
//! balance.hold(order, 400).unwrap();
//! assert_eq!(balance.spendable(), 600);
//! assert_eq!(balance.held_for(&order), 400);
//! ```

use crate::base::{OrderRef, UserId};
use crate::error::LedgerError;
use crate::money::{MinorUnits, to_major};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Funds of one user, in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    user_id: UserId,
    spendable: MinorUnits,
    held: MinorUnits,
    /// Open holds. Entries are removed once fully captured or released.
    holds: BTreeMap<OrderRef, MinorUnits>,
}

impl Balance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            spendable: 0,
            held: 0,
            holds: BTreeMap::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn spendable(&self) -> MinorUnits {
        self.spendable
    }

    pub fn held(&self) -> MinorUnits {
        self.held
    }

    /// Returns `spendable + held`.
    pub fn total(&self) -> MinorUnits {
        self.spendable + self.held
    }

    /// Amount currently held for `order`.
    pub fn held_for(&self, order: &OrderRef) -> MinorUnits {
        self.holds.get(order).copied().unwrap_or(0)
    }

    pub fn holds(&self) -> impl Iterator<Item = (&OrderRef, &MinorUnits)> {
        self.holds.iter()
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.spendable >= 0,
            "Invariant violated: spendable balance went negative: {}",
            self.spendable
        );
        debug_assert!(
            self.held >= 0,
            "Invariant violated: held balance went negative: {}",
            self.held
        );
        debug_assert_eq!(
            self.held,
            self.holds.values().sum::<MinorUnits>(),
            "Invariant violated: held differs from the sum of order holds"
        );
    }

    fn checked_add(&self, a: MinorUnits, b: MinorUnits) -> Result<MinorUnits, LedgerError> {
        a.checked_add(b)
            .ok_or(LedgerError::BalanceOverflow(self.user_id))
    }

    /// Increases spendable balance (income).
    pub fn credit(&mut self, amount: MinorUnits) -> Result<(), LedgerError> {
        ensure_positive(amount)?;
        let spendable = self.checked_add(self.spendable, amount)?;
        self.checked_add(spendable, self.held)?;
        self.spendable = spendable;
        self.assert_invariants();
        Ok(())
    }

    /// Moves funds from spendable to the hold of `order`.
    pub fn hold(&mut self, order: OrderRef, amount: MinorUnits) -> Result<(), LedgerError> {
        ensure_positive(amount)?;
        if self.spendable < amount {
            return Err(LedgerError::InsufficientFunds {
                current: self.spendable,
                needed: amount,
            });
        }
        self.spendable -= amount;
        self.held += amount;
        *self.holds.entry(order).or_insert(0) += amount;
        self.assert_invariants();
        Ok(())
    }

    /// Removes held funds of `order` from the ledger (finish).
    pub fn capture(&mut self, order: OrderRef, amount: MinorUnits) -> Result<(), LedgerError> {
        self.take_hold(order, amount)?;
        self.assert_invariants();
        Ok(())
    }

    /// Returns held funds of `order` to spendable (cancel).
    pub fn release(&mut self, order: OrderRef, amount: MinorUnits) -> Result<(), LedgerError> {
        self.take_hold(order, amount)?;
        self.spendable += amount;
        self.assert_invariants();
        Ok(())
    }

    fn take_hold(&mut self, order: OrderRef, amount: MinorUnits) -> Result<(), LedgerError> {
        ensure_positive(amount)?;
        let current = self.held_for(&order);
        if current < amount {
            return Err(LedgerError::InsufficientFunds {
                current,
                needed: amount,
            });
        }
        if current == amount {
            self.holds.remove(&order);
        } else {
            self.holds.insert(order, current - amount);
        }
        self.held -= amount;
        Ok(())
    }
}

fn ensure_positive(amount: MinorUnits) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "amount should be greater than 0, got {amount} minor units"
        )));
    }
    Ok(())
}

/// Display form of a balance.
///
/// Major-unit fields are rounded to whole units; the exact values are kept
/// alongside in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub user_id: UserId,
    pub balance: Decimal,
    pub held: Decimal,
    pub spendable_minor: MinorUnits,
    pub held_minor: MinorUnits,
}

impl From<&Balance> for BalanceView {
    fn from(balance: &Balance) -> Self {
        Self {
            user_id: balance.user_id,
            balance: to_major(balance.spendable),
            held: to_major(balance.held),
            spendable_minor: balance.spendable,
            held_minor: balance.held,
        }
    }
}

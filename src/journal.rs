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

//! Journal entries.
//!
//! Every committed operation appends exactly one entry. Entries are never
//! updated or removed; the per-order lifecycle is derived from them:
//!
//! - `None` → [`Held`] (via a `capture` entry)
//! - [`Held`] → [`Captured`] (via `write-off`) or [`Released`] (via `cancel`)
//!
//! [`Held`]: OrderState::Held
//! [`Captured`]: OrderState::Captured
//! [`Released`]: OrderState::Released

use crate::base::{OperationId, OrderId, OrderRef, ServiceId, UserId};
use crate::money::MinorUnits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Income credited to spendable balance.
    #[serde(rename = "transfer")]
    Transfer,
    /// Funds moved from spendable to held for an order.
    #[serde(rename = "capture")]
    Capture,
    /// Held funds permanently debited when an order finishes.
    #[serde(rename = "write-off")]
    WriteOff,
    /// Held funds returned to spendable when an order is cancelled.
    #[serde(rename = "cancel")]
    Cancel,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Capture => "capture",
            Self::WriteOff => "write-off",
            Self::Cancel => "cancel",
        }
    }

    /// Signed journal amount for an operation of `amount` minor units.
    ///
    /// Only income is recorded as a credit.
    pub fn signed(&self, amount: MinorUnits) -> MinorUnits {
        match self {
            Self::Transfer => amount,
            Self::Capture | Self::WriteOff | Self::Cancel => -amount,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry built by the engine, not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub operation_id: OperationId,
    pub user_id: UserId,
    pub kind: EntryKind,
    pub order: Option<OrderRef>,
    /// Signed amount: negative for holds and debits.
    pub amount: MinorUnits,
}

impl PendingEntry {
    /// Stamps the entry with its journal position.
    pub fn into_entry(self, sequence: u64, created_at: DateTime<Utc>) -> JournalEntry {
        JournalEntry {
            sequence,
            operation_id: self.operation_id,
            user_id: self.user_id,
            kind: self.kind,
            service_id: self.order.map(|order| order.service_id),
            order_id: self.order.map(|order| order.order_id),
            amount: self.amount,
            created_at,
        }
    }
}

/// Committed journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, strictly increasing in commit order.
    pub sequence: u64,
    pub operation_id: OperationId,
    pub user_id: UserId,
    pub kind: EntryKind,
    pub service_id: Option<ServiceId>,
    pub order_id: Option<OrderId>,
    pub amount: MinorUnits,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn order(&self) -> Option<OrderRef> {
        Some(OrderRef::new(self.service_id?, self.order_id?))
    }

    /// Returns `true` if this entry records the same request as `pending`.
    pub fn matches(&self, pending: &PendingEntry) -> bool {
        self.operation_id == pending.operation_id
            && self.user_id == pending.user_id
            && self.kind == pending.kind
            && self.order() == pending.order
            && self.amount == pending.amount
    }
}

/// Lifecycle of an order, derived from journal history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    /// No hold was ever placed.
    None,
    /// Funds are currently held.
    Held { amount: MinorUnits },
    /// Hold fully consumed by a finish.
    Captured,
    /// Hold fully returned by a cancellation.
    Released,
}

impl OrderState {
    /// Folds the entries of one order, in journal order, into its state.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a JournalEntry>) -> Self {
        let mut held: MinorUnits = 0;
        let mut last = None;
        for entry in entries {
            match entry.kind {
                EntryKind::Capture => held += entry.amount.abs(),
                EntryKind::WriteOff | EntryKind::Cancel => held -= entry.amount.abs(),
                EntryKind::Transfer => continue,
            }
            last = Some(entry.kind);
        }

        match last {
            None => Self::None,
            Some(_) if held > 0 => Self::Held { amount: held },
            Some(EntryKind::WriteOff) => Self::Captured,
            Some(EntryKind::Cancel) => Self::Released,
            Some(_) => Self::None,
        }
    }
}

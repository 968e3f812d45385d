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

//! Error types for ledger operations.

use crate::base::{OperationId, UserId};
use crate::money::MinorUnits;
use thiserror::Error;

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amount is zero, negative or not representable in minor units
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Order operation without service or order ID
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Operation ID already recorded for a different request
    #[error("operation {0} was already used for a different request")]
    OperationReused(OperationId),

    /// User has no balance record
    #[error("user not found: userID={0}")]
    UserNotFound(UserId),

    /// Spendable (hold) or held (capture, release) amount is too small
    #[error("not enough balance: current={current}, needed={needed}")]
    InsufficientFunds {
        current: MinorUnits,
        needed: MinorUnits,
    },

    /// Balance would exceed the representable range
    #[error("balance overflow for user {0}")]
    BalanceOverflow(UserId),

    /// Infrastructure failure in the store
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse classification of [`LedgerError`] used at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request, never retried.
    Input,
    /// Referenced user does not exist.
    NotFound,
    /// Well-formed request declined by a business rule.
    Declined,
    /// Store failure, possibly transient.
    Store,
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidAmount(_)
            | Self::MissingField(_)
            | Self::OperationReused(_)
            | Self::BalanceOverflow(_) => ErrorCategory::Input,
            Self::UserNotFound(_) => ErrorCategory::NotFound,
            Self::InsufficientFunds { .. } => ErrorCategory::Declined,
            Self::Store(_) => ErrorCategory::Store,
        }
    }

    /// Returns `true` if the same request may succeed when submitted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Concurrent transaction committed a conflicting write
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Row lock was not acquired within the configured timeout
    #[error("timed out waiting for balance lock of user {0}")]
    LockTimeout(UserId),

    /// Store is not reachable or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::LockTimeout(_))
    }
}

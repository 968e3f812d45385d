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

//! Service facade.
//!
//! [`LedgerService`] is what a boundary layer (HTTP, RPC, batch files) talks
//! to. It validates requests, hands them to the [`Engine`], and folds every
//! result into an [`Outcome`]:
//!
//! | Engine result | Outcome |
//! |---------------|---------|
//! | success | [`Outcome::Success`] |
//! | invalid input, unknown user | [`Outcome::BadRequest`] |
//! | insufficient funds | [`Outcome::Declined`] |
//! | store failure | [`Outcome::Fault`] (details are only logged) |
//!
//! Balance queries report an unknown user as [`Outcome::NotFound`].

use crate::balance::BalanceView;
use crate::base::UserId;
use crate::engine::Engine;
use crate::error::{ErrorCategory, LedgerError};
use crate::store::{MemoryStore, Store};
use crate::validator::{Request, RequestKind, validate};
use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Status reported for declined order creation and completion.
pub const NOT_ENOUGH_BALANCE: &str = "Not enough balance";

/// Status reported for a declined cancellation.
pub const NO_ORDER_TO_CANCEL: &str = "No order to cancel";

/// Base delay before the first retry of a transient store failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Result of a request, as seen by the boundary layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// Operation applied (or already applied); carries the resulting balance.
    Success(BalanceView),
    /// Well-formed request refused by a business rule.
    Declined(&'static str),
    /// Malformed request or unknown user.
    BadRequest(String),
    /// Queried user does not exist.
    NotFound(String),
    /// Infrastructure failure.
    Fault,
}

impl Outcome {
    /// Short status text for the caller.
    pub fn status(&self) -> &str {
        match self {
            Self::Success(_) => "success",
            Self::Declined(status) => *status,
            Self::BadRequest(message) | Self::NotFound(message) => message.as_str(),
            Self::Fault => "server error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Facade over an [`Engine`].
pub struct LedgerService<S = MemoryStore> {
    engine: Engine<S>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<S: Store> LedgerService<S> {
    /// Creates a service that reports retryable failures without retrying.
    pub fn new(engine: Engine<S>) -> Self {
        Self {
            engine,
            max_retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Retries requests failing with a retryable store error up to
    /// `max_retries` times.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Waits `backoff` times the attempt number before each retry.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub fn income(&self, request: &Request) -> Outcome {
        self.handle(RequestKind::Income, request)
    }

    pub fn create_order(&self, request: &Request) -> Outcome {
        self.handle(RequestKind::CreateOrder, request)
    }

    pub fn finish_order(&self, request: &Request) -> Outcome {
        self.handle(RequestKind::FinishOrder, request)
    }

    pub fn cancel_order(&self, request: &Request) -> Outcome {
        self.handle(RequestKind::CancelOrder, request)
    }

    /// Validates and executes `request` as the operation `kind`.
    pub fn handle(&self, kind: RequestKind, request: &Request) -> Outcome {
        let intent = match validate(kind, request) {
            Ok(intent) => intent,
            Err(err) => {
                info!(operation_id = %request.operation_id, ?kind, error = %err, "Rejected request");
                return Outcome::BadRequest(err.to_string());
            }
        };

        let mut attempt = 0;
        let result = loop {
            match self.engine.execute(&intent) {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_backoff.saturating_mul(attempt);
                    warn!(
                        operation_id = %intent.operation_id,
                        attempt,
                        ?delay,
                        error = %err,
                        "Retrying operation"
                    );
                    thread::sleep(delay);
                }
                result => break result,
            }
        };

        match result {
            Ok(receipt) => Outcome::Success(BalanceView::from(&receipt.balance)),
            Err(err) => {
                let outcome = operation_failure(kind, &err);
                if outcome == Outcome::Fault {
                    error!(operation_id = %intent.operation_id, ?kind, error = %err, "Operation failed");
                } else {
                    info!(operation_id = %intent.operation_id, ?kind, error = %err, "Operation not applied");
                }
                outcome
            }
        }
    }

    /// Returns the balance of `user_id`.
    pub fn balance(&self, user_id: UserId) -> Outcome {
        match self.engine.balance(user_id) {
            Ok(balance) => Outcome::Success(BalanceView::from(&balance)),
            Err(LedgerError::UserNotFound(_)) => {
                Outcome::NotFound(LedgerError::UserNotFound(user_id).to_string())
            }
            Err(err) => {
                error!(user_id = %user_id, error = %err, "Balance query failed");
                Outcome::Fault
            }
        }
    }
}

fn operation_failure(kind: RequestKind, err: &LedgerError) -> Outcome {
    match err.category() {
        ErrorCategory::Input | ErrorCategory::NotFound => Outcome::BadRequest(err.to_string()),
        ErrorCategory::Declined => match kind {
            RequestKind::CancelOrder => Outcome::Declined(NO_ORDER_TO_CANCEL),
            _ => Outcome::Declined(NOT_ENOUGH_BALANCE),
        },
        ErrorCategory::Store => Outcome::Fault,
    }
}

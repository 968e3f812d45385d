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

//! # Balance Ledger
//!
//! This library tracks per-user balances and the lifecycle of funds held
//! against orders: income, hold (create order), capture (finish order) and
//! release (cancel order). Every change is recorded in an append-only journal.
//!
//! ## Core Components
//!
//! - [`Engine`]: executes operations, one store transaction each
//! - [`Store`]: transactional storage contract, implemented by [`MemoryStore`]
//! - [`Balance`]: spendable and held funds of a user, with per-order holds
//! - [`LedgerService`]: validates requests and maps results to an [`Outcome`]
//! - [`LedgerError`]: error types for ledger operations
//!
//! ## Example
//!
//! ```
//! use balance_ledger::{
//!     Engine, LedgerService, MemoryStore, OperationId, OrderId, OrderRef, Outcome, Request,
//!     ServiceId, UserId,
//! };
//! use rust_decimal_macros::dec;
//!
//! let service = LedgerService::new(Engine::new(MemoryStore::new()));
//! let user = UserId(1);
//! let order = OrderRef::new(ServiceId(1), OrderId(1));
//!
//! service.income(&Request::income(OperationId(1), user, dec!(10.00)));
//! service.create_order(&Request::order(OperationId(2), user, order, dec!(4.00)));
//! let outcome = service.finish_order(&Request::order(OperationId(3), user, order, dec!(4.00)));
//!
//! let Outcome::Success(view) = outcome else { panic!("finish failed") };
//! assert_eq!(view.spendable_minor, 600);
//! assert_eq!(view.held_minor, 0);
//! ```
//!
//! ## Thread Safety
//!
//! The engine holds no locks of its own. Operations may run concurrently from
//! any number of threads; those touching the same user are serialized by the
//! store.

pub mod balance;
mod base;
mod engine;
pub mod error;
pub mod journal;
pub mod money;
pub mod service;
pub mod store;
pub mod validator;

pub use balance::{Balance, BalanceView};
pub use base::{OperationId, OrderId, OrderRef, ServiceId, UserId};
pub use engine::{Engine, Receipt, Reconciliation};
pub use error::{ErrorCategory, LedgerError, StoreError};
pub use journal::{EntryKind, JournalEntry, OrderState, PendingEntry};
pub use money::MinorUnits;
pub use service::{LedgerService, Outcome};
pub use store::{MemoryStore, MemoryTransaction, Store, StoreTransaction};
pub use validator::{Intent, Request, RequestKind};

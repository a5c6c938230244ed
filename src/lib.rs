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

//! # Bank Ledger
//!
//! This library provides a double-entry banking ledger: accounts with
//! balances, and money transfers between them that either apply completely
//! or not at all.
//!
//! ## Core Components
//!
//! - [`Engine`]: Transfer orchestrator running each transfer as one unit of work
//! - [`Store`]: Ledger storage, with [`MemoryStore`] and [`SqliteStore`] backends
//! - [`EntryLedger`]: Append-only entry history and balance reconciliation
//! - [`TransferError`]: Error types for transfer processing failures
//!
//! ## Example
//!
//! ```
//! use bank_ledger_rs::{Currency, Engine, NewAccount, TransferRequest};
//!
//! let engine = Engine::default();
//! let alice = engine
//!     .open_account(NewAccount::new("alice", Currency::Usd).with_opening_balance(500))
//!     .unwrap();
//! let bob = engine
//!     .open_account(NewAccount::new("bob", Currency::Usd).with_opening_balance(300))
//!     .unwrap();
//!
//! let result = engine.transfer(TransferRequest::new(alice.id, bob.id, 5)).unwrap();
//! assert_eq!(result.from_account.balance, 495);
//! assert_eq!(result.to_account.balance, 305);
//! assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
//! ```
//!
//! ## Thread Safety
//!
//! Transfers run concurrently from any number of threads. Account row locks
//! are always taken lower account id first, so concurrent transfers between
//! the same accounts, in either direction, cannot deadlock.

pub mod account;
mod base;
pub mod config;
mod context;
mod engine;
pub mod entry;
pub mod error;
pub mod guard;
pub mod store;
mod transfer;

pub use account::{Account, NewAccount};
pub use base::{AccountId, Currency, EntryId, Page, TransferId};
pub use config::LedgerConfig;
pub use context::{CancelToken, TransferContext};
pub use engine::Engine;
pub use entry::{Entry, EntryLedger, Reconciliation};
pub use error::{CurrencyError, StoreError, TransferError};
pub use store::{MemoryStore, SqliteStore, Store, UnitOfWork};
pub use transfer::{Transfer, TransferFilter, TransferRequest, TransferResult};

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

//! Ledger storage.
//!
//! A [`Store`] hands out [`UnitOfWork`]s: transaction contexts in which every
//! read and write is isolated from other units and either committed as a
//! whole or discarded. Row primitives are only available on a unit of work;
//! the store itself exposes account creation and standalone reads, which
//! only ever observe committed state.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: in-process tables with a `parking_lot` mutex per
//!   account row.
//! - [`SqliteStore`]: persistent SQLite database.

mod memory;
mod sqlite;

pub use memory::{MemoryStore, MemoryUnitOfWork};
pub use sqlite::{SqliteStore, SqliteUnitOfWork};

use crate::account::{Account, NewAccount};
use crate::base::{AccountId, EntryId, Page, TransferId};
use crate::context::TransferContext;
use crate::entry::Entry;
use crate::error::StoreError;
use crate::transfer::{Transfer, TransferFilter};
use std::time::{Duration, Instant};

/// Longest single park on a lock before cancellation is checked again.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Transactional primitives bound to one unit of work.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls it
/// back.
pub trait UnitOfWork {
    /// Reads an account and holds its row lock until the unit ends.
    ///
    /// Calling this again for an account already locked by this unit returns
    /// the unit's current view of the row without blocking.
    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError>;

    fn insert_transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<Transfer, StoreError>;

    fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError>;

    /// Adds a signed `delta` to an account balance and returns the updated row.
    ///
    /// The update is conditional: it fails with
    /// [`StoreError::NegativeBalance`] instead of driving the balance below
    /// zero.
    fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account, StoreError>;

    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self) -> Result<(), StoreError>;
}

/// A ledger store.
pub trait Store: Send + Sync {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    /// Opens a unit of work bound to `context`.
    ///
    /// Lock waits inside the unit never extend past the context deadline and
    /// end with [`StoreError::Cancelled`] soon after its token is cancelled.
    fn begin(&self, context: &TransferContext) -> Result<Self::Unit<'_>, StoreError>;

    /// Opens an account, recording a non-zero opening balance as an entry
    /// in the same atomic step.
    fn create_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    fn get_account(&self, id: AccountId) -> Result<Account, StoreError>;

    fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError>;

    fn list_accounts_by_owner(&self, owner: &str, page: Page) -> Result<Vec<Account>, StoreError>;

    fn get_entry(&self, id: EntryId) -> Result<Entry, StoreError>;

    /// Entries of one account, oldest first.
    fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>, StoreError>;

    fn get_transfer(&self, id: TransferId) -> Result<Transfer, StoreError>;

    fn list_transfers(&self, filter: TransferFilter, page: Page) -> Result<Vec<Transfer>, StoreError>;

    /// An account and all of its entries, read at one consistent point.
    fn ledger_snapshot(&self, account_id: AccountId) -> Result<(Account, Vec<Entry>), StoreError>;
}

/// Applies an offset/limit window to an iterator already in creation order.
pub(crate) fn paginate<T>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

/// Earliest of the context deadline and `timeout` from now.
pub(crate) fn wait_deadline(context: &TransferContext, timeout: Duration) -> Instant {
    let timeout = Instant::now() + timeout;
    match context.deadline() {
        Some(deadline) => deadline.min(timeout),
        None => timeout,
    }
}

/// Repeats a timed lock attempt in short slices until it succeeds, `until`
/// passes (`Ok(None)`) or the context is cancelled.
pub(crate) fn wait_until<T>(
    context: &TransferContext,
    until: Instant,
    mut try_until: impl FnMut(Instant) -> Option<T>,
) -> Result<Option<T>, StoreError> {
    loop {
        if context.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let slice = (Instant::now() + WAIT_SLICE).min(until);
        if let Some(acquired) = try_until(slice) {
            return Ok(Some(acquired));
        }
        if Instant::now() >= until {
            return Ok(None);
        }
    }
}

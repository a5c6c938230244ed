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

//! Entry ledger.
//!
//! Every balance movement is recorded as an immutable, signed [`Entry`]. The
//! ledger is append-only: stores expose no way to update or delete an entry.
//! Replaying an account's entries from zero reconstructs its balance
//! independently of the stored `balance` column, which is what
//! [`EntryLedger::reconcile`] checks.

use crate::base::{AccountId, EntryId, Page};
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One account's side of a balance movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Signed amount in minor units; negative for debits.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Sums entry amounts starting from zero.
///
/// Returns `None` if the sum overflows.
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Option<i64> {
    entries
        .into_iter()
        .try_fold(0i64, |balance, entry| balance.checked_add(entry.amount))
}

/// Outcome of replaying an account's entries against its stored balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: AccountId,
    pub stored_balance: i64,
    /// `None` when the replay overflowed.
    pub replayed_balance: Option<i64>,
    pub entry_count: usize,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.replayed_balance == Some(self.stored_balance)
    }
}

/// Read-only view of a store's entries.
pub struct EntryLedger<'s, S: Store> {
    store: &'s S,
}

impl<'s, S: Store> EntryLedger<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Entries of one account in creation order.
    pub fn history(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>, StoreError> {
        // Surface a missing account rather than an empty history.
        self.store.get_account(account_id)?;
        self.store.list_entries(account_id, page)
    }

    /// Replays an account's entries and compares the sum with its balance.
    pub fn reconcile(&self, account_id: AccountId) -> Result<Reconciliation, StoreError> {
        let (account, entries) = self.store.ledger_snapshot(account_id)?;
        let reconciliation = Reconciliation {
            account_id,
            stored_balance: account.balance,
            replayed_balance: replay(&entries),
            entry_count: entries.len(),
        };
        if !reconciliation.is_balanced() {
            tracing::warn!(
                account_id = %account_id,
                stored = reconciliation.stored_balance,
                replayed = ?reconciliation.replayed_balance,
                "Ledger out of balance"
            );
        }
        Ok(reconciliation)
    }

    /// Reconciles every account, walking the account list page by page.
    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>, StoreError> {
        let mut page = Page::new(0, 100);
        let mut results = Vec::new();
        loop {
            let accounts = self.store.list_accounts(page)?;
            for account in &accounts {
                results.push(self.reconcile(account.id)?);
            }
            if accounts.len() < page.limit as usize {
                break;
            }
            page = page.next();
        }
        Ok(results)
    }
}

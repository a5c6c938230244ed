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

//! In-memory ledger store.
//!
//! Each account row carries its own `parking_lot` mutex, which plays the part
//! of a database row lock: a unit of work holds it from
//! [`UnitOfWork::get_account_for_update`] until commit or rollback. Writes
//! are staged inside the unit and published at commit under a store-wide
//! commit gate, so standalone reads see either all of a unit's effects or
//! none of them.
//!
//! ```text
//!  unit A:  lock(1)  lock(2)  stage writes  commit  release
//!  unit B:  lock(1) waits ...............................  acquired  lock(2)
//! ```

use super::{Store, UnitOfWork, paginate, wait_deadline, wait_until};
use crate::account::{Account, NewAccount};
use crate::base::{AccountId, EntryId, Page, TransferId};
use crate::context::TransferContext;
use crate::entry::Entry;
use crate::error::StoreError;
use crate::transfer::{Transfer, TransferFilter};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::trace;

/// A committed account row and the lock guarding writes to it.
#[derive(Debug)]
struct AccountRow {
    lock: Arc<Mutex<()>>,
    committed: RwLock<Account>,
}

/// A row locked by a unit of work, with the unit's pending version of it.
struct HeldRow {
    row: Arc<AccountRow>,
    staged: Account,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

/// Ledger tables kept in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Arc<AccountRow>>,
    entries: DashMap<EntryId, Entry>,
    transfers: DashMap<TransferId, Transfer>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    /// Held exclusively while a commit publishes its writes.
    commit_gate: RwLock<()>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a store whose row-lock waits give up after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            entries: DashMap::new(),
            transfers: DashMap::new(),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            commit_gate: RwLock::new(()),
            lock_timeout,
        }
    }

    fn row(&self, id: AccountId) -> Result<Arc<AccountRow>, StoreError> {
        // Clone the Arc out so the shard lock is released before any row lock wait.
        self.accounts
            .get(&id)
            .map(|row| Arc::clone(row.value()))
            .ok_or(StoreError::AccountNotFound(id))
    }

    fn next_entry(&self, account_id: AccountId, amount: i64) -> Entry {
        Entry {
            id: EntryId(self.entry_seq.fetch_add(1, Ordering::SeqCst)),
            account_id,
            amount,
            created_at: Utc::now(),
        }
    }

    fn sorted_entries(&self, account_id: AccountId) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .entries
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    fn sorted_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|row| row.committed.read().clone())
            .collect();
        accounts.sort_by_key(|account| account.id);
        accounts
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Unit<'a> = MemoryUnitOfWork<'a>;

    fn begin(&self, context: &TransferContext) -> Result<Self::Unit<'_>, StoreError> {
        Ok(MemoryUnitOfWork {
            store: self,
            context: context.clone(),
            held: BTreeMap::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
        })
    }

    fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        account.validate()?;
        let _gate = self.commit_gate.write();

        let id = AccountId(self.account_seq.fetch_add(1, Ordering::SeqCst));
        let created = Account {
            id,
            owner: account.owner,
            balance: account.opening_balance,
            currency: account.currency,
            created_at: Utc::now(),
        };
        if account.opening_balance != 0 {
            let entry = self.next_entry(id, account.opening_balance);
            self.entries.insert(entry.id, entry);
        }
        self.accounts.insert(
            id,
            Arc::new(AccountRow {
                lock: Arc::new(Mutex::new(())),
                committed: RwLock::new(created.clone()),
            }),
        );
        Ok(created)
    }

    fn get_account(&self, id: AccountId) -> Result<Account, StoreError> {
        let _gate = self.commit_gate.read();
        let row = self.row(id)?;
        let account = row.committed.read().clone();
        Ok(account)
    }

    fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(paginate(self.sorted_accounts().into_iter(), page))
    }

    fn list_accounts_by_owner(&self, owner: &str, page: Page) -> Result<Vec<Account>, StoreError> {
        let _gate = self.commit_gate.read();
        let owned = self
            .sorted_accounts()
            .into_iter()
            .filter(|account| account.owner == owner);
        Ok(paginate(owned, page))
    }

    fn get_entry(&self, id: EntryId) -> Result<Entry, StoreError> {
        let _gate = self.commit_gate.read();
        self.entries
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::EntryNotFound(id))
    }

    fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(paginate(self.sorted_entries(account_id).into_iter(), page))
    }

    fn get_transfer(&self, id: TransferId) -> Result<Transfer, StoreError> {
        let _gate = self.commit_gate.read();
        self.transfers
            .get(&id)
            .map(|transfer| transfer.value().clone())
            .ok_or(StoreError::TransferNotFound(id))
    }

    fn list_transfers(&self, filter: TransferFilter, page: Page) -> Result<Vec<Transfer>, StoreError> {
        let _gate = self.commit_gate.read();
        let mut transfers: Vec<Transfer> = self
            .transfers
            .iter()
            .filter(|transfer| filter.matches(transfer.value()))
            .map(|transfer| transfer.value().clone())
            .collect();
        transfers.sort_by_key(|transfer| transfer.id);
        Ok(paginate(transfers.into_iter(), page))
    }

    fn ledger_snapshot(&self, account_id: AccountId) -> Result<(Account, Vec<Entry>), StoreError> {
        let _gate = self.commit_gate.read();
        let row = self.row(account_id)?;
        let account = row.committed.read().clone();
        Ok((account, self.sorted_entries(account_id)))
    }
}

/// A unit of work against a [`MemoryStore`].
///
/// Row locks are released and staged writes discarded when the unit is
/// dropped without committing.
pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    context: TransferContext,
    held: BTreeMap<AccountId, HeldRow>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
}

impl MemoryUnitOfWork<'_> {
    fn hold(&mut self, id: AccountId) -> Result<&mut HeldRow, StoreError> {
        if !self.held.contains_key(&id) {
            let row = self.store.row(id)?;
            let until = wait_deadline(&self.context, self.store.lock_timeout);
            let guard = wait_until(&self.context, until, |slice| {
                row.lock.try_lock_arc_until(slice)
            })?
            .ok_or(StoreError::LockTimeout(id))?;
            let staged = row.committed.read().clone();
            trace!(account_id = %id, "Row lock acquired");
            self.held.insert(
                id,
                HeldRow {
                    row,
                    staged,
                    _guard: guard,
                },
            );
        }
        self.held
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend(format!("row {id} vanished from unit of work")))
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        Ok(self.hold(id)?.staged.clone())
    }

    fn insert_transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<Transfer, StoreError> {
        if amount <= 0 {
            return Err(StoreError::Constraint(format!(
                "transfer amount {amount} must be positive"
            )));
        }
        for id in [from, to] {
            if !self.store.accounts.contains_key(&id) {
                return Err(StoreError::AccountNotFound(id));
            }
        }
        let transfer = Transfer {
            id: TransferId(self.store.transfer_seq.fetch_add(1, Ordering::SeqCst)),
            from_account_id: from,
            to_account_id: to,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        if !self.store.accounts.contains_key(&account_id) {
            return Err(StoreError::AccountNotFound(account_id));
        }
        let entry = self.store.next_entry(account_id, amount);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account, StoreError> {
        let held = self.hold(id)?;
        held.staged.balance = held.staged.adjusted_balance(delta)?;
        Ok(held.staged.clone())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let store = self.store;
        // Dropped before `self`, so row locks outlive the gate.
        let _gate = store.commit_gate.write();
        for held in self.held.values() {
            *held.row.committed.write() = held.staged.clone();
        }
        for transfer in self.transfers.drain(..) {
            store.transfers.insert(transfer.id, transfer);
        }
        for entry in self.entries.drain(..) {
            store.entries.insert(entry.id, entry);
        }
        Ok(())
    }

    fn rollback(self) -> Result<(), StoreError> {
        trace!(
            rows = self.held.len(),
            entries = self.entries.len(),
            "Discarding unit of work"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Currency;
    use crate::context::CancelToken;
    use std::thread;
    use std::time::Instant;

    fn store_with(balances: &[i64]) -> (MemoryStore, Vec<AccountId>) {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
        let ids = balances
            .iter()
            .enumerate()
            .map(|(i, &balance)| {
                store
                    .create_account(
                        NewAccount::new(format!("owner-{i}"), Currency::Usd).with_opening_balance(balance),
                    )
                    .unwrap()
                    .id
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn account_ids_start_at_one() {
        let (_, ids) = store_with(&[0, 0]);
        assert_eq!(ids, vec![AccountId(1), AccountId(2)]);
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let (store, ids) = store_with(&[100]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        unit.add_account_balance(ids[0], -40).unwrap();
        unit.insert_entry(ids[0], -40).unwrap();

        assert_eq!(store.get_account(ids[0]).unwrap().balance, 100);
        assert_eq!(store.list_entries(ids[0], Page::default()).unwrap().len(), 1);

        unit.commit().unwrap();
        assert_eq!(store.get_account(ids[0]).unwrap().balance, 60);
        assert_eq!(store.list_entries(ids[0], Page::default()).unwrap().len(), 2);
    }

    #[test]
    fn rollback_discards_everything() {
        let (store, ids) = store_with(&[100, 0]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        unit.insert_transfer(ids[0], ids[1], 10).unwrap();
        unit.insert_entry(ids[0], -10).unwrap();
        unit.add_account_balance(ids[0], -10).unwrap();
        unit.rollback().unwrap();

        assert_eq!(store.get_account(ids[0]).unwrap().balance, 100);
        assert!(store.list_transfers(TransferFilter::default(), Page::default()).unwrap().is_empty());
        assert_eq!(store.list_entries(ids[0], Page::default()).unwrap().len(), 1);
    }

    #[test]
    fn dropping_a_unit_rolls_back_and_releases_locks() {
        let (store, ids) = store_with(&[100]);
        {
            let mut unit = store.begin(&TransferContext::background()).unwrap();
            unit.add_account_balance(ids[0], -10).unwrap();
        }
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        assert_eq!(unit.get_account_for_update(ids[0]).unwrap().balance, 100);
    }

    #[test]
    fn get_account_for_update_is_reentrant() {
        let (store, ids) = store_with(&[100]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        unit.get_account_for_update(ids[0]).unwrap();
        unit.add_account_balance(ids[0], 5).unwrap();
        assert_eq!(unit.get_account_for_update(ids[0]).unwrap().balance, 105);
    }

    #[test]
    fn held_row_blocks_other_units_until_timeout() {
        let (store, ids) = store_with(&[100]);
        let mut holder = store.begin(&TransferContext::background()).unwrap();
        holder.get_account_for_update(ids[0]).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let mut unit = store.begin(&TransferContext::background()).unwrap();
                unit.get_account_for_update(ids[0]).map(|_| ())
            });
            assert_eq!(
                waiter.join().unwrap(),
                Err(StoreError::LockTimeout(ids[0]))
            );
        });
    }

    #[test]
    fn expired_deadline_fails_lock_wait_immediately() {
        let (store, ids) = store_with(&[100]);
        let mut holder = store.begin(&TransferContext::background()).unwrap();
        holder.get_account_for_update(ids[0]).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let context = TransferContext::background().with_deadline(Instant::now());
                let mut unit = store.begin(&context).unwrap();
                unit.get_account_for_update(ids[0]).map(|_| ())
            });
            assert_eq!(
                waiter.join().unwrap(),
                Err(StoreError::LockTimeout(ids[0]))
            );
        });
    }

    #[test]
    fn cancelling_ends_a_lock_wait_early() {
        let store = MemoryStore::with_lock_timeout(Duration::from_secs(5));
        let id = store
            .create_account(NewAccount::new("owner", Currency::Usd).with_opening_balance(100))
            .unwrap()
            .id;
        let mut holder = store.begin(&TransferContext::background()).unwrap();
        holder.get_account_for_update(id).unwrap();

        let token = CancelToken::new();
        let context = TransferContext::background().with_cancel_token(token.clone());
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let started = Instant::now();
                let mut unit = store.begin(&context).unwrap();
                let result = unit.get_account_for_update(id).map(|_| ());
                (result, started.elapsed())
            });
            thread::sleep(Duration::from_millis(50));
            token.cancel();
            let (result, elapsed) = waiter.join().unwrap();
            assert_eq!(result, Err(StoreError::Cancelled));
            assert!(elapsed < Duration::from_secs(1), "waited {elapsed:?}");
        });
    }

    #[test]
    fn conditional_update_refuses_negative_balance() {
        let (store, ids) = store_with(&[10]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        assert_eq!(
            unit.add_account_balance(ids[0], -11),
            Err(StoreError::NegativeBalance(ids[0]))
        );
        assert_eq!(unit.get_account_for_update(ids[0]).unwrap().balance, 10);
    }

    #[test]
    fn writes_against_missing_accounts_fail() {
        let (store, ids) = store_with(&[10]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        let missing = AccountId(99);
        assert_eq!(unit.insert_entry(missing, 1), Err(StoreError::AccountNotFound(missing)));
        assert_eq!(
            unit.insert_transfer(ids[0], missing, 1),
            Err(StoreError::AccountNotFound(missing))
        );
        assert_eq!(
            unit.get_account_for_update(missing),
            Err(StoreError::AccountNotFound(missing))
        );
    }

    #[test]
    fn transfer_amount_must_be_positive() {
        let (store, ids) = store_with(&[10, 10]);
        let mut unit = store.begin(&TransferContext::background()).unwrap();
        assert!(matches!(
            unit.insert_transfer(ids[0], ids[1], 0),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn list_accounts_by_owner_and_pages() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.create_account(NewAccount::new("alice", Currency::Usd)).unwrap();
        }
        store.create_account(NewAccount::new("bob", Currency::Usd)).unwrap();

        let alice = store.list_accounts_by_owner("alice", Page::new(1, 5)).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|account| account.owner == "alice"));
        assert_eq!(store.list_accounts(Page::new(0, 2)).unwrap().len(), 2);
        assert_eq!(store.list_accounts(Page::new(3, 2)).unwrap().len(), 1);
    }

    #[test]
    fn get_missing_rows() {
        let store = MemoryStore::new();
        assert_eq!(store.get_entry(EntryId(1)), Err(StoreError::EntryNotFound(EntryId(1))));
        assert_eq!(
            store.get_transfer(TransferId(1)),
            Err(StoreError::TransferNotFound(TransferId(1)))
        );
    }
}

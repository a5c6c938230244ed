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

//! SQLite backend integration tests against a database file.

use bank_ledger_rs::{
    Currency, Engine, LedgerConfig, NewAccount, Page, SqliteStore, Store, StoreError,
    TransferFilter, TransferRequest,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

// === Helper Functions ===

/// A database path unique to this test, removed again on drop.
struct TestDatabase {
    path: PathBuf,
}

impl TestDatabase {
    fn new(name: &str) -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "bank-ledger-{}-{}-{}.db",
            name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_file(&path);
        Self { path }
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn open_account(engine: &Engine<SqliteStore>, owner: &str, balance: i64) -> bank_ledger_rs::Account {
    engine
        .open_account(NewAccount::new(owner, Currency::Usd).with_opening_balance(balance))
        .unwrap()
}

// === Tests ===

#[test]
fn ledger_survives_reopen() {
    let database = TestDatabase::new("reopen");

    let (a, b, transfer_id) = {
        let engine = Engine::sqlite(&database.path, LedgerConfig::default()).unwrap();
        let a = open_account(&engine, "alice", 500).id;
        let b = open_account(&engine, "bob", 300).id;
        let result = engine.transfer(TransferRequest::new(a, b, 5)).unwrap();
        (a, b, result.transfer.id)
    };

    let engine = Engine::sqlite(&database.path, LedgerConfig::default()).unwrap();
    assert_eq!(engine.get_account(a).unwrap().balance, 495);
    assert_eq!(engine.get_account(b).unwrap().balance, 305);
    assert_eq!(engine.store().get_transfer(transfer_id).unwrap().amount, 5);
    for reconciliation in engine.entry_ledger().reconcile_all().unwrap() {
        assert!(reconciliation.is_balanced());
    }

    // Ids keep counting after reopen.
    let c = open_account(&engine, "carol", 0).id;
    assert!(c > b);
}

#[test]
fn failed_transfer_leaves_file_untouched() {
    let database = TestDatabase::new("rejected");

    let (a, b) = {
        let engine = Engine::sqlite(&database.path, LedgerConfig::default()).unwrap();
        let a = open_account(&engine, "alice", 10).id;
        let b = open_account(&engine, "bob", 0).id;
        assert!(engine.transfer(TransferRequest::new(a, b, 11)).is_err());
        (a, b)
    };

    let store = SqliteStore::open(&database.path).unwrap();
    assert_eq!(store.get_account(a).unwrap().balance, 10);
    assert_eq!(store.get_account(b).unwrap().balance, 0);
    assert!(
        store
            .list_transfers(TransferFilter::default(), Page::default())
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.list_entries(a, Page::default()).unwrap().len(), 1);
}

#[test]
fn accounts_page_in_creation_order() {
    let engine = Engine::new(SqliteStore::open_in_memory().unwrap());
    let ids: Vec<_> = (0..7)
        .map(|i| open_account(&engine, if i % 2 == 0 { "even" } else { "odd" }, i).id)
        .collect();

    let first = engine.store().list_accounts(Page::numbered(1, 3)).unwrap();
    let second = engine.store().list_accounts(Page::numbered(2, 3)).unwrap();
    let third = engine.store().list_accounts(Page::numbered(3, 3)).unwrap();
    let listed: Vec<_> = first
        .iter()
        .chain(&second)
        .chain(&third)
        .map(|account| account.id)
        .collect();
    assert_eq!(listed, ids);
    assert_eq!(third.len(), 1);

    let odd = engine
        .store()
        .list_accounts_by_owner("odd", Page::default())
        .unwrap();
    assert_eq!(odd.len(), 3);
    assert!(odd.iter().all(|account| account.owner == "odd"));
}

#[test]
fn transfers_listed_by_either_side() {
    let engine = Engine::new(SqliteStore::open_in_memory().unwrap());
    let a = open_account(&engine, "a", 100).id;
    let b = open_account(&engine, "b", 100).id;
    let c = open_account(&engine, "c", 100).id;

    engine.transfer(TransferRequest::new(a, b, 1)).unwrap();
    engine.transfer(TransferRequest::new(b, c, 2)).unwrap();
    engine.transfer(TransferRequest::new(c, a, 3)).unwrap();

    let store = engine.store();
    let amounts = |filter| -> Vec<i64> {
        store
            .list_transfers(filter, Page::default())
            .unwrap()
            .iter()
            .map(|transfer| transfer.amount)
            .collect()
    };
    assert_eq!(amounts(TransferFilter::from_account(a)), vec![1]);
    assert_eq!(amounts(TransferFilter::to_account(a)), vec![3]);
    // Either side matches.
    assert_eq!(amounts(TransferFilter::between(a, c)), vec![1, 2]);
    assert_eq!(amounts(TransferFilter::default()), vec![1, 2, 3]);
}

#[test]
fn missing_rows_are_reported_by_kind() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(matches!(
        store.get_account(bank_ledger_rs::AccountId(1)),
        Err(StoreError::AccountNotFound(_))
    ));
    assert!(matches!(
        store.get_entry(bank_ledger_rs::EntryId(1)),
        Err(StoreError::EntryNotFound(_))
    ));
    assert!(matches!(
        store.get_transfer(bank_ledger_rs::TransferId(1)),
        Err(StoreError::TransferNotFound(_))
    ));
}

#[test]
fn invalid_accounts_are_rejected() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(matches!(
        store.create_account(NewAccount::new("", Currency::Usd)),
        Err(StoreError::Constraint(_))
    ));
    assert!(matches!(
        store.create_account(NewAccount::new("alice", Currency::Usd).with_opening_balance(-1)),
        Err(StoreError::Constraint(_))
    ));
    assert!(store.list_accounts(Page::default()).unwrap().is_empty());
}

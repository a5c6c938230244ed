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

//! SQLite backed ledger store.
//!
//! Units of work run on a single connection guarded by a mutex and open with
//! `BEGIN IMMEDIATE`, which takes the database write lock up front. The
//! schema enforces what it can on its own: non-negative balances, positive
//! transfer amounts, foreign keys from entries and transfers to accounts,
//! and triggers that reject any `UPDATE` or `DELETE` on the append-only
//! `entries` and `transfers` tables.

use super::{Store, UnitOfWork, wait_deadline, wait_until};
use crate::account::{Account, NewAccount};
use crate::base::{AccountId, EntryId, Page, TransferId};
use crate::context::TransferContext;
use crate::entry::Entry;
use crate::error::StoreError;
use crate::transfer::{Transfer, TransferFilter};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Extended result code for a failed FOREIGN KEY constraint.
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner TEXT NOT NULL,
        balance INTEGER NOT NULL CHECK (balance >= 0),
        currency TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner);

    CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts (id),
        amount INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id);

    CREATE TABLE IF NOT EXISTS transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_account_id INTEGER NOT NULL REFERENCES accounts (id),
        to_account_id INTEGER NOT NULL REFERENCES accounts (id),
        amount INTEGER NOT NULL CHECK (amount > 0),
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id);
    CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id);

    CREATE TRIGGER IF NOT EXISTS entries_no_update BEFORE UPDATE ON entries
    BEGIN SELECT RAISE(ABORT, 'entries are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS entries_no_delete BEFORE DELETE ON entries
    BEGIN SELECT RAISE(ABORT, 'entries are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS transfers_no_update BEFORE UPDATE ON transfers
    BEGIN SELECT RAISE(ABORT, 'transfers are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS transfers_no_delete BEFORE DELETE ON transfers
    BEGIN SELECT RAISE(ABORT, 'transfers are append-only'); END;
";

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Busy(error.to_string())
                }
                ErrorCode::ConstraintViolation => StoreError::Constraint(error.to_string()),
                _ => StoreError::Backend(error.to_string()),
            },
            _ => StoreError::Backend(error.to_string()),
        }
    }
}

fn is_foreign_key_failure(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.extended_code == SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn map_account(row: &Row) -> Result<Account, rusqlite::Error> {
    let currency: String = row.get(3)?;
    Ok(Account {
        id: AccountId(row.get(0)?),
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: currency
            .parse()
            .map_err(|error| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(error)))?,
        created_at: row.get(4)?,
    })
}

fn map_entry(row: &Row) -> Result<Entry, rusqlite::Error> {
    Ok(Entry {
        id: EntryId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        amount: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_transfer(row: &Row) -> Result<Transfer, rusqlite::Error> {
    Ok(Transfer {
        id: TransferId(row.get(0)?),
        from_account_id: AccountId(row.get(1)?),
        to_account_id: AccountId(row.get(2)?),
        amount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn select_account(connection: &Connection, id: AccountId) -> Result<Account, StoreError> {
    connection
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
            params![id.0],
            map_account,
        )
        .optional()?
        .ok_or(StoreError::AccountNotFound(id))
}

fn insert_entry(connection: &Connection, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
    connection
        .query_row(
            &format!(
                "INSERT INTO entries (account_id, amount, created_at) VALUES (?1, ?2, ?3)
                 RETURNING {ENTRY_COLUMNS}"
            ),
            params![account_id.0, amount, Utc::now()],
            map_entry,
        )
        .map_err(|error| match error {
            error if is_foreign_key_failure(&error) => StoreError::AccountNotFound(account_id),
            error => error.into(),
        })
}

fn select_entries(connection: &Connection, account_id: AccountId, page: Option<Page>) -> Result<Vec<Entry>, StoreError> {
    let (limit, offset) = match page {
        Some(page) => (i64::from(page.limit), i64::from(page.offset)),
        None => (-1, 0),
    };
    let mut statement = connection.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
    ))?;
    let entries = statement
        .query_map(params![account_id.0, limit, offset], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Ledger tables in a SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Mutex<Connection>,
    lock_timeout: Duration,
}

impl SqliteStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens (creating if needed) a database file and installs the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_lock_timeout(Connection::open(path)?, Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_lock_timeout(Connection::open_in_memory()?, Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Wraps an existing connection, installing the schema if missing.
    ///
    /// Waits for the connection, and for file locks held by other processes,
    /// give up after `lock_timeout`.
    pub fn with_lock_timeout(connection: Connection, lock_timeout: Duration) -> Result<Self, StoreError> {
        connection.busy_timeout(lock_timeout)?;
        connection.pragma_update(None, "foreign_keys", true)?;
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Mutex::new(connection),
            lock_timeout,
        })
    }

    fn connection(&self, context: &TransferContext) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let until = wait_deadline(context, self.lock_timeout);
        wait_until(context, until, |slice| self.connection.try_lock_until(slice))?
            .ok_or_else(|| StoreError::Busy("timed out waiting for the database connection".into()))
    }

    /// Connection for a standalone read or write outside any unit of work.
    fn idle_connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection(&TransferContext::background())
    }
}

impl Store for SqliteStore {
    type Unit<'a> = SqliteUnitOfWork<'a>;

    fn begin(&self, context: &TransferContext) -> Result<Self::Unit<'_>, StoreError> {
        let connection = self.connection(context)?;
        connection.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteUnitOfWork {
            connection,
            open: true,
        })
    }

    fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        account.validate()?;
        let connection = self.idle_connection()?;
        let tx = connection.unchecked_transaction()?;
        let created = tx.query_row(
            &format!(
                "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?1, ?2, ?3, ?4)
                 RETURNING {ACCOUNT_COLUMNS}"
            ),
            params![
                account.owner,
                account.opening_balance,
                account.currency.code(),
                Utc::now()
            ],
            map_account,
        )?;
        if account.opening_balance != 0 {
            insert_entry(&tx, created.id, account.opening_balance)?;
        }
        tx.commit()?;
        Ok(created)
    }

    fn get_account(&self, id: AccountId) -> Result<Account, StoreError> {
        let connection = self.idle_connection()?;
        select_account(&connection, id)
    }

    fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError> {
        let connection = self.idle_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id LIMIT ?1 OFFSET ?2"
        ))?;
        let accounts = statement
            .query_map(params![page.limit, page.offset], map_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn list_accounts_by_owner(&self, owner: &str, page: Page) -> Result<Vec<Account>, StoreError> {
        let connection = self.idle_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
        ))?;
        let accounts = statement
            .query_map(params![owner, page.limit, page.offset], map_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn get_entry(&self, id: EntryId) -> Result<Entry, StoreError> {
        let connection = self.idle_connection()?;
        connection
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                params![id.0],
                map_entry,
            )
            .optional()?
            .ok_or(StoreError::EntryNotFound(id))
    }

    fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>, StoreError> {
        let connection = self.idle_connection()?;
        select_entries(&connection, account_id, Some(page))
    }

    fn get_transfer(&self, id: TransferId) -> Result<Transfer, StoreError> {
        let connection = self.idle_connection()?;
        connection
            .query_row(
                &format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?1"),
                params![id.0],
                map_transfer,
            )
            .optional()?
            .ok_or(StoreError::TransferNotFound(id))
    }

    fn list_transfers(&self, filter: TransferFilter, page: Page) -> Result<Vec<Transfer>, StoreError> {
        let mut values = vec![
            Value::Integer(i64::from(page.limit)),
            Value::Integer(i64::from(page.offset)),
        ];
        let clause = match (filter.from_account_id, filter.to_account_id) {
            (None, None) => "",
            (Some(from), None) => {
                values.push(Value::Integer(from.0));
                "WHERE from_account_id = ?3"
            }
            (None, Some(to)) => {
                values.push(Value::Integer(to.0));
                "WHERE to_account_id = ?3"
            }
            (Some(from), Some(to)) => {
                values.push(Value::Integer(from.0));
                values.push(Value::Integer(to.0));
                "WHERE from_account_id = ?3 OR to_account_id = ?4"
            }
        };

        let connection = self.idle_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers {clause} ORDER BY id LIMIT ?1 OFFSET ?2"
        ))?;
        let transfers = statement
            .query_map(params_from_iter(values), map_transfer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transfers)
    }

    fn ledger_snapshot(&self, account_id: AccountId) -> Result<(Account, Vec<Entry>), StoreError> {
        let connection = self.idle_connection()?;
        let tx = connection.unchecked_transaction()?;
        let account = select_account(&tx, account_id)?;
        let entries = select_entries(&tx, account_id, None)?;
        tx.commit()?;
        Ok((account, entries))
    }
}

/// A unit of work against a [`SqliteStore`]: one `BEGIN IMMEDIATE`
/// transaction holding the store's connection.
///
/// Dropped without [`UnitOfWork::commit`], the transaction is rolled back.
pub struct SqliteUnitOfWork<'a> {
    connection: MutexGuard<'a, Connection>,
    open: bool,
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        // The IMMEDIATE transaction already holds the database write lock.
        select_account(&self.connection, id)
    }

    fn insert_transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<Transfer, StoreError> {
        self.connection
            .query_row(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     RETURNING {TRANSFER_COLUMNS}"
                ),
                params![from.0, to.0, amount, Utc::now()],
                map_transfer,
            )
            .map_err(|error| match error {
                error if is_foreign_key_failure(&error) => {
                    let missing = if select_account(&self.connection, from).is_err() { from } else { to };
                    StoreError::AccountNotFound(missing)
                }
                error => error.into(),
            })
    }

    fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        insert_entry(&self.connection, account_id, amount)
    }

    fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account, StoreError> {
        // Rejects overflow, which SQLite would silently turn into a REAL.
        select_account(&self.connection, id)?.adjusted_balance(delta)?;
        self.connection
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = balance + ?1
                     WHERE id = ?2 AND balance + ?1 >= 0
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![delta, id.0],
                map_account,
            )
            .optional()?
            .ok_or(StoreError::NegativeBalance(id))
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

impl SqliteUnitOfWork<'_> {
    /// Ends the transaction. On failure the unit stays open, so drop still
    /// rolls it back.
    fn finish(&mut self, statement: &str) -> Result<(), StoreError> {
        self.connection.execute_batch(statement)?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(error) = self.connection.execute_batch("ROLLBACK") {
                warn!(%error, "Failed to roll back abandoned unit of work");
            }
        }
    }
}

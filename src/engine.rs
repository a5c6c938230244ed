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

//! Transfer processing engine.
//!
//! The [`Engine`] moves funds between accounts as a single unit of work:
//!
//! 1. Lock both account rows, lower account id first.
//! 2. Check the source balance on the locked row.
//! 3. Insert the transfer and its two entries (`-amount`, `+amount`).
//! 4. Apply both balance deltas, again lower account id first.
//! 5. Commit, or roll back everything on any failure.
//!
//! # Thread Safety
//!
//! The engine is shared between threads by reference or [`Arc`](std::sync::Arc).
//! Because every transfer acquires row locks in the same global order, two
//! transfers can never wait on each other in a cycle, whichever direction
//! they move money in.

use crate::account::{Account, NewAccount};
use crate::base::AccountId;
use crate::config::LedgerConfig;
use crate::context::TransferContext;
use crate::entry::EntryLedger;
use crate::error::{StoreError, TransferError};
use crate::guard;
use crate::store::{MemoryStore, SqliteStore, Store, UnitOfWork};
use crate::transfer::{TransferRequest, TransferResult};
use std::path::Path;
use std::thread;
use tracing::{debug, warn};

/// Transfer orchestrator over a ledger [`Store`].
///
/// # Invariants
///
/// - A committed transfer has exactly two entries, `-amount` on the source
///   and `+amount` on the destination.
/// - No committed balance is negative.
/// - A failed transfer leaves no transfer, entry or balance change behind.
pub struct Engine<S: Store> {
    store: S,
    config: LedgerConfig,
}

impl Engine<MemoryStore> {
    /// Creates an engine over a fresh in-memory ledger.
    ///
    /// `config.database` is not consulted here; open a persistent ledger
    /// with [`Engine::sqlite`].
    pub fn in_memory(config: LedgerConfig) -> Self {
        if let Some(path) = &config.database {
            warn!(path = %path.display(), "Database path ignored by in-memory ledger");
        }
        let store = MemoryStore::with_lock_timeout(config.lock_timeout());
        Self::with_config(store, config)
    }
}

impl Default for Engine<MemoryStore> {
    fn default() -> Self {
        Self::in_memory(LedgerConfig::default())
    }
}

impl Engine<SqliteStore> {
    /// Creates an engine over the SQLite database at `path`.
    pub fn sqlite(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self, StoreError> {
        let connection = rusqlite::Connection::open(path)?;
        let store = SqliteStore::with_lock_timeout(connection, config.lock_timeout())?;
        Ok(Self::with_config(store, config))
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn entry_ledger(&self) -> EntryLedger<'_, S> {
        EntryLedger::new(&self.store)
    }

    pub fn open_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let account = self.store.create_account(account)?;
        debug!(account_id = %account.id, owner = %account.owner, balance = account.balance, "Account opened");
        Ok(account)
    }

    pub fn get_account(&self, id: AccountId) -> Result<Account, StoreError> {
        self.store.get_account(id)
    }

    /// Moves `request.amount` from one account to another.
    ///
    /// # Errors
    ///
    /// - [`TransferError::InvalidAmount`] - Amount is zero or negative.
    /// - [`TransferError::AccountNotFound`] - Either account does not exist.
    /// - [`TransferError::CurrencyMismatch`] - Accounts hold different currencies,
    ///   or not the currency the request names.
    /// - [`TransferError::InsufficientFunds`] - Source balance is below the amount.
    /// - [`TransferError::TransientStorageFailure`] - Lock or database wait timed
    ///   out on every attempt.
    /// - [`TransferError::InternalFailure`] - Unexpected storage fault.
    pub fn transfer(&self, request: TransferRequest) -> Result<TransferResult, TransferError> {
        self.transfer_with(&TransferContext::background(), request)
    }

    /// Like [`Engine::transfer`], bounded by a deadline and/or cancel token.
    ///
    /// Returns [`TransferError::Cancelled`] when the context ends first; the
    /// unit of work is rolled back.
    pub fn transfer_with(
        &self,
        context: &TransferContext,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        if request.amount <= 0 {
            return Err(TransferError::InvalidAmount(request.amount));
        }
        let _span = tracing::debug_span!(
            "transfer",
            from = %request.from_account_id,
            to = %request.to_account_id,
            amount = request.amount
        )
        .entered();

        let mut attempt = 0;
        loop {
            match self.execute(context, &request) {
                Err(error)
                    if error.is_retryable()
                        && attempt < self.config.max_retries
                        && !context.is_done() =>
                {
                    attempt += 1;
                    warn!(attempt, %error, "Retrying transfer after transient failure");
                    thread::sleep(self.config.retry_backoff() * attempt);
                }
                result => return result,
            }
        }
    }

    /// One attempt: a full unit of work, committed or rolled back.
    fn execute(
        &self,
        context: &TransferContext,
        request: &TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        ensure_live(context)?;
        let mut unit = self
            .store
            .begin(context)
            .map_err(|error| store_failure(context, error))?;

        match apply(&mut unit, context, request) {
            Ok(result) => {
                unit.commit().map_err(|error| store_failure(context, error))?;
                debug!(transfer_id = %result.transfer.id, "Transfer committed");
                Ok(result)
            }
            Err(error) => {
                if let Err(rollback_error) = unit.rollback() {
                    warn!(%rollback_error, "Rollback failed");
                }
                debug!(%error, "Transfer rolled back");
                Err(error)
            }
        }
    }
}

/// The transfer steps inside an open unit of work.
fn apply<U: UnitOfWork>(
    unit: &mut U,
    context: &TransferContext,
    request: &TransferRequest,
) -> Result<TransferResult, TransferError> {
    let from_id = request.from_account_id;
    let to_id = request.to_account_id;
    let amount = request.amount;
    let fail = |error| store_failure(context, error);

    let (first, second) = request.lock_order();
    let first_account = unit.get_account_for_update(first).map_err(fail)?;
    let second_account = unit.get_account_for_update(second).map_err(fail)?;
    ensure_live(context)?;

    let (from_account, to_account) = if first == from_id {
        (first_account, second_account)
    } else {
        (second_account, first_account)
    };
    check_currency(request, &from_account, &to_account)?;

    if !guard::has_sufficient_funds(unit, from_id, amount).map_err(fail)? {
        return Err(TransferError::InsufficientFunds {
            account_id: from_id,
            balance: from_account.balance,
            amount,
        });
    }

    let transfer = unit.insert_transfer(from_id, to_id, amount).map_err(fail)?;
    let from_entry = unit.insert_entry(from_id, -amount).map_err(fail)?;
    let to_entry = unit.insert_entry(to_id, amount).map_err(fail)?;
    ensure_live(context)?;

    let debit = |unit: &mut U| {
        unit.add_account_balance(from_id, -amount)
            .map_err(|error| match error {
                StoreError::NegativeBalance(account_id) => TransferError::InsufficientFunds {
                    account_id,
                    balance: from_account.balance,
                    amount,
                },
                error => fail(error),
            })
    };
    let (from_account, to_account) = if from_id < to_id {
        let from_account = debit(&mut *unit)?;
        let to_account = unit.add_account_balance(to_id, amount).map_err(fail)?;
        (from_account, to_account)
    } else {
        let to_account = unit.add_account_balance(to_id, amount).map_err(fail)?;
        let from_account = debit(&mut *unit)?;
        (from_account, to_account)
    };

    // Both deltas hit the same row; report its final state on both sides.
    let (from_account, to_account) = if request.is_self_transfer() {
        let account = unit.get_account_for_update(from_id).map_err(fail)?;
        (account.clone(), account)
    } else {
        (from_account, to_account)
    };
    ensure_live(context)?;

    Ok(TransferResult {
        from_account,
        to_account,
        transfer,
        from_entry,
        to_entry,
    })
}

fn check_currency(
    request: &TransferRequest,
    from: &Account,
    to: &Account,
) -> Result<(), TransferError> {
    let expected = request.currency.unwrap_or(from.currency);
    for account in [from, to] {
        if account.currency != expected {
            return Err(TransferError::CurrencyMismatch {
                account_id: account.id,
                expected,
                actual: account.currency,
            });
        }
    }
    Ok(())
}

fn ensure_live(context: &TransferContext) -> Result<(), TransferError> {
    if context.is_done() {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

/// A lock wait cut short by the caller's deadline is a cancellation, not a
/// storage fault.
fn store_failure(context: &TransferContext, error: StoreError) -> TransferError {
    if error.is_transient() && context.is_done() {
        TransferError::Cancelled
    } else {
        error.into()
    }
}

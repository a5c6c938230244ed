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

//! Error types for the ledger store and transfer processing.

use crate::base::{AccountId, Currency, EntryId, TransferId};
use thiserror::Error;

/// Transfer processing errors.
///
/// Every variant is reported only after the unit of work has been rolled
/// back, so a caller never observes a partially applied transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Amount is zero or negative
    #[error("invalid amount {0} (must be positive)")]
    InvalidAmount(i64),

    /// Referenced account does not exist
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// Debit would exceed the source balance
    #[error("insufficient funds in account {account_id}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        amount: i64,
    },

    /// Account currency differs from the other side or from the request
    #[error("account {account_id} holds {actual}, expected {expected}")]
    CurrencyMismatch {
        account_id: AccountId,
        expected: Currency,
        actual: Currency,
    },

    /// Deadline passed or the caller cancelled the transfer
    #[error("transfer cancelled")]
    Cancelled,

    /// Lock timeout, busy database or lost connection; safe to retry
    #[error("transient storage failure: {0}")]
    TransientStorageFailure(String),

    /// Any other unexpected fault
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl TransferError {
    /// Whether the whole transfer may be attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::TransientStorageFailure(_))
    }
}

/// Ledger store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("transfer {0} not found")]
    TransferNotFound(TransferId),

    /// A conditional balance update was refused
    #[error("balance of account {0} would become negative")]
    NegativeBalance(AccountId),

    /// Row lock could not be acquired before the deadline
    #[error("timed out waiting for lock on account {0}")]
    LockTimeout(AccountId),

    /// The unit of work's context was cancelled while it waited
    #[error("unit of work cancelled")]
    Cancelled,

    /// The store could not be entered before the deadline or reported busy
    #[error("store busy: {0}")]
    Busy(String),

    /// A schema constraint rejected the write
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Unexpected backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_) | StoreError::Busy(_))
    }
}

impl From<StoreError> for TransferError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::AccountNotFound(id) => TransferError::AccountNotFound(id),
            StoreError::Cancelled => TransferError::Cancelled,
            StoreError::LockTimeout(_) | StoreError::Busy(_) => {
                TransferError::TransientStorageFailure(error.to_string())
            }
            StoreError::EntryNotFound(_)
            | StoreError::TransferNotFound(_)
            | StoreError::NegativeBalance(_)
            | StoreError::Constraint(_)
            | StoreError::Backend(_) => TransferError::InternalFailure(error.to_string()),
        }
    }
}

/// Currency parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("unsupported currency {0:?}")]
    Unsupported(String),
}

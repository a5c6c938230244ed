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

//! Transfer rows, requests and results.

use crate::account::Account;
use crate::base::{AccountId, Currency, TransferId};
use crate::entry::Entry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed movement of `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A request to move funds between two accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    /// When set, both accounts must hold this currency.
    #[serde(default)]
    pub currency: Option<Currency>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: i64) -> Self {
        Self {
            from_account_id: from,
            to_account_id: to,
            amount,
            currency: None,
        }
    }

    pub fn in_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn is_self_transfer(&self) -> bool {
        self.from_account_id == self.to_account_id
    }

    /// The two accounts in lock-acquisition order, lower id first.
    pub fn lock_order(&self) -> (AccountId, AccountId) {
        if self.from_account_id <= self.to_account_id {
            (self.from_account_id, self.to_account_id)
        } else {
            (self.to_account_id, self.from_account_id)
        }
    }
}

/// Everything a committed transfer produced, as of its commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub from_account: Account,
    pub to_account: Account,
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Selects transfers by source and/or destination account.
///
/// With both sides set, a transfer matches when either side matches, so the
/// filter lists every transfer touching the pair in either role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub from_account_id: Option<AccountId>,
    pub to_account_id: Option<AccountId>,
}

impl TransferFilter {
    pub fn from_account(id: AccountId) -> Self {
        Self {
            from_account_id: Some(id),
            to_account_id: None,
        }
    }

    pub fn to_account(id: AccountId) -> Self {
        Self {
            from_account_id: None,
            to_account_id: Some(id),
        }
    }

    pub fn between(from: AccountId, to: AccountId) -> Self {
        Self {
            from_account_id: Some(from),
            to_account_id: Some(to),
        }
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        match (self.from_account_id, self.to_account_id) {
            (None, None) => true,
            (Some(from), None) => transfer.from_account_id == from,
            (None, Some(to)) => transfer.to_account_id == to,
            (Some(from), Some(to)) => transfer.from_account_id == from || transfer.to_account_id == to,
        }
    }
}

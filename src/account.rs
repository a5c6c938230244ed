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

//! Account rows.
//!
//! # Example
//!
//! ```
//! use bank_ledger_rs::{Currency, NewAccount};
//!
//! let account = NewAccount::new("alice", Currency::Usd).with_opening_balance(500);
//! assert_eq!(account.opening_balance, 500);
//! ```

use crate::base::{AccountId, Currency};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Ledger account.
///
/// `balance` is held in the currency's smallest unit and is never negative
/// in a committed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Balance rendered in major units, e.g. `495` cents as `4.95`.
    pub fn balance_major(&self) -> Decimal {
        self.currency.to_major(self.balance)
    }

    /// Balance after applying `delta`, refusing overflow and overdraft.
    pub(crate) fn adjusted_balance(&self, delta: i64) -> Result<i64, StoreError> {
        let balance = self
            .balance
            .checked_add(delta)
            .ok_or_else(|| StoreError::Constraint(format!("balance overflow on account {}", self.id)))?;
        if balance < 0 {
            return Err(StoreError::NegativeBalance(self.id));
        }
        Ok(balance)
    }
}

/// Parameters for opening an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner: String,
    pub currency: Currency,
    /// Funds the account starts with, recorded as an opening entry.
    #[serde(default)]
    pub opening_balance: i64,
}

impl NewAccount {
    pub fn new(owner: impl Into<String>, currency: Currency) -> Self {
        Self {
            owner: owner.into(),
            currency,
            opening_balance: 0,
        }
    }

    pub fn with_opening_balance(mut self, amount: i64) -> Self {
        self.opening_balance = amount;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.owner.trim().is_empty() {
            return Err(StoreError::Constraint("account owner must not be empty".into()));
        }
        if self.opening_balance < 0 {
            return Err(StoreError::Constraint(format!(
                "opening balance {} must not be negative",
                self.opening_balance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account(balance: i64) -> Account {
        Account {
            id: AccountId(1),
            owner: "alice".into(),
            balance,
            currency: Currency::Usd,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn adjusted_balance_applies_signed_delta() {
        assert_eq!(account(500).adjusted_balance(-5), Ok(495));
        assert_eq!(account(300).adjusted_balance(5), Ok(305));
    }

    #[test]
    fn adjusted_balance_refuses_overdraft() {
        assert_eq!(
            account(10).adjusted_balance(-11),
            Err(StoreError::NegativeBalance(AccountId(1)))
        );
        assert_eq!(account(10).adjusted_balance(-10), Ok(0));
    }

    #[test]
    fn adjusted_balance_refuses_overflow() {
        assert!(matches!(
            account(i64::MAX).adjusted_balance(1),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn balance_major_renders_minor_units() {
        assert_eq!(account(49_500).balance_major(), dec!(495.00));
    }

    #[test]
    fn new_account_validation() {
        assert!(NewAccount::new("bob", Currency::Eur).validate().is_ok());
        assert!(NewAccount::new("  ", Currency::Eur).validate().is_err());
        assert!(
            NewAccount::new("bob", Currency::Eur)
                .with_opening_balance(-1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn account_serializes_currency_code() {
        let json = serde_json::to_value(account(100)).unwrap();
        assert_eq!(json["currency"], "USD");
        assert_eq!(json["balance"], 100);
        assert_eq!(json["id"], 1);
    }
}

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

//! Balance guard.
//!
//! Checks funds on the locked row of the unit of work that will perform the
//! debit, never on a separate read, so no concurrent debit can slip in
//! between the check and the deduction.

use crate::base::AccountId;
use crate::error::StoreError;
use crate::store::UnitOfWork;

/// Whether `account_id` can cover a debit of `amount`.
///
/// Locks the account row in `unit` if it is not locked already.
///
/// # Errors
///
/// [`StoreError::AccountNotFound`] if the account does not exist.
pub fn has_sufficient_funds<U: UnitOfWork>(
    unit: &mut U,
    account_id: AccountId,
    amount: i64,
) -> Result<bool, StoreError> {
    let account = unit.get_account_for_update(account_id)?;
    Ok(account.balance >= amount)
}

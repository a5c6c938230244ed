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

//! Ledger configuration.
//!
//! Passed explicitly to the store and engine constructors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite database file; `None` keeps the ledger in memory.
    pub database: Option<PathBuf>,
    /// Longest a single row-lock or connection wait may take.
    pub lock_timeout_ms: u64,
    /// Extra attempts after a transient storage failure.
    pub max_retries: u32,
    /// Pause before each retry, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: None,
            lock_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

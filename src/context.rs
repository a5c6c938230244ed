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

//! Deadlines and cancellation for transfers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared flag a caller sets to abandon in-flight transfers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Bounds on how long a transfer may run.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl TransferContext {
    /// No deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the token was cancelled, whatever the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// True once the deadline has passed or the token was cancelled.
    pub fn is_done(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
            || self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        assert!(!TransferContext::background().is_done());
        assert_eq!(TransferContext::background().deadline(), None);
    }

    #[test]
    fn past_deadline_is_done() {
        let context = TransferContext::background().with_deadline(Instant::now());
        assert!(context.is_done());
    }

    #[test]
    fn future_deadline_is_not_done() {
        let context = TransferContext::background().with_timeout(Duration::from_secs(60));
        assert!(!context.is_done());
    }

    #[test]
    fn cancelling_a_clone_cancels_the_context() {
        let token = CancelToken::new();
        let context = TransferContext::background().with_cancel_token(token.clone());
        assert!(!context.is_done());
        token.cancel();
        assert!(context.is_done());
        assert!(context.is_cancelled());
    }

    #[test]
    fn expired_deadline_is_not_cancellation() {
        let context = TransferContext::background().with_deadline(Instant::now());
        assert!(context.is_done());
        assert!(!context.is_cancelled());
    }
}

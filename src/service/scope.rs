// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hierarchical cancellation with optional deadlines.
//!
//! A [`CancelScope`] is a one-way signal shared by every task working on the
//! same logical operation. It ends either because somebody called
//! [`CancelScope::cancel`] or because its deadline passed, and it remembers
//! which of the two happened first. Canceling a scope ends all of its
//! children; ending a child never touches the parent.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::AppError;

/// Why a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for ScopeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeReason::Cancelled => write!(f, "scope canceled"),
            ScopeReason::DeadlineExceeded => write!(f, "scope deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Termination {
    reason: ScopeReason,
    at: Instant,
}

#[derive(Debug)]
struct ScopeInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    parent: Option<CancelScope>,
    // set exactly once, never cleared
    termination: OnceLock<Termination>,
}

#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// A root scope that only ends through [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::build(CancellationToken::new(), None, None)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(CancellationToken::new(), Some(deadline), None)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Derives a scope that ends with its parent but can be canceled alone.
    pub fn child(&self) -> Self {
        Self::build(
            self.inner.token.child_token(),
            self.inner.deadline,
            Some(self.clone()),
        )
    }

    /// Like [`child`](Self::child) with a deadline of its own; the parent's
    /// deadline still applies when it is earlier.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self::build(
            self.inner.token.child_token(),
            Some(deadline),
            Some(self.clone()),
        )
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_with_deadline(Instant::now() + timeout)
    }

    fn build(token: CancellationToken, deadline: Option<Instant>, parent: Option<Self>) -> Self {
        CancelScope {
            inner: Arc::new(ScopeInner {
                token,
                deadline,
                parent,
                termination: OnceLock::new(),
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Ends the scope. If the deadline already passed, or the parent already
    /// ended, that earlier reason is kept.
    pub fn cancel(&self) {
        let now = Instant::now();
        if self.termination().is_none() {
            self.settle(Termination {
                reason: ScopeReason::Cancelled,
                at: now,
            });
            trace!("scope canceled");
        }
    }

    pub fn is_done(&self) -> bool {
        self.termination().is_some()
    }

    pub fn reason(&self) -> Option<ScopeReason> {
        self.termination().map(|t| t.reason)
    }

    /// The terminal reason as an error, `None` while the scope is live.
    pub fn err(&self) -> Option<AppError> {
        self.reason().map(|reason| match reason {
            ScopeReason::Cancelled => AppError::Cancelled(reason.to_string()),
            ScopeReason::DeadlineExceeded => AppError::Timeout(reason.to_string()),
        })
    }

    /// Resolves once the scope has ended, whichever way.
    pub async fn cancelled(&self) {
        loop {
            if self.is_done() {
                return;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.inner.token.cancelled() => {}
                        _ = time::sleep_until(deadline) => {}
                    }
                }
                None => self.inner.token.cancelled().await,
            }
        }
    }

    fn termination(&self) -> Option<Termination> {
        if let Some(t) = self.inner.termination.get() {
            return Some(*t);
        }

        let expired = self
            .inner
            .deadline
            .filter(|deadline| *deadline <= Instant::now())
            .map(|deadline| Termination {
                reason: ScopeReason::DeadlineExceeded,
                at: deadline,
            });
        // the token only fires without a recorded termination when an
        // ancestor ended
        let inherited = if self.inner.token.is_cancelled() {
            self.inner.parent.as_ref().and_then(|p| p.termination())
        } else {
            None
        };

        let first = match (expired, inherited) {
            (Some(e), Some(i)) => Some(if e.at <= i.at { e } else { i }),
            (e, i) => e.or(i),
        };
        first.map(|t| self.settle(t))
    }

    fn settle(&self, termination: Termination) -> Termination {
        let settled = *self.inner.termination.get_or_init(|| termination);
        self.inner.token.cancel();
        settled
    }
}

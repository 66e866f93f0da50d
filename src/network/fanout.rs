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

//! Racing several connection attempts, keeping the first one that succeeds.
//!
//! Every attempt runs in its own task against one shared [`CancelScope`].
//! The first attempt to connect publishes its connection into a single slot
//! without blocking; the coordinator takes it, cancels the scope so the other
//! attempts give up, and then waits for all of them before returning. An
//! attempt that connects after the scope ended, or finds the slot taken,
//! closes its connection itself.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time;
use tracing::{debug, info, trace};

use crate::service::{CancelScope, ScopeReason};
use crate::utils::TaskGroup;
use crate::{AppError, AppResult};

/// Opens one connection to an address.
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn dial(&self, address: &str) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Plain TCP, optionally bounded by a per attempt connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        TcpDialer { connect_timeout }
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    fn dial(&self, address: &str) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let connect_timeout = self.connect_timeout;
        let address = address.to_string();
        async move {
            match connect_timeout {
                Some(limit) => time::timeout(limit, TcpStream::connect(&address))
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect to {} timed out", address),
                        )
                    })?,
                None => TcpStream::connect(&address).await,
            }
        }
    }
}

/// The attempt that won the race.
#[derive(Debug)]
pub struct Winner<C> {
    /// 1-based position of the address in the candidate list
    pub id: usize,
    pub address: String,
    pub conn: C,
}

/// Everything known about a finished race.
#[derive(Debug)]
pub struct FanOutReport<C> {
    pub winner: Option<Winner<C>>,
    /// how the shared scope ended
    pub reason: Option<ScopeReason>,
    pub attempts: usize,
    /// attempts that had fully finished when the race returned
    pub finished: usize,
}

impl<C> FanOutReport<C> {
    pub fn into_result(self) -> AppResult<Winner<C>> {
        match (self.winner, self.reason) {
            (Some(winner), _) => Ok(winner),
            (None, Some(ScopeReason::DeadlineExceeded)) => Err(AppError::Timeout(format!(
                "none of {} candidates connected before the deadline",
                self.attempts
            ))),
            (None, Some(ScopeReason::Cancelled)) => Err(AppError::Cancelled(format!(
                "fan-out over {} candidates canceled",
                self.attempts
            ))),
            (None, None) => Err(AppError::IllegalStateError(
                "fan-out returned with a live scope".into(),
            )),
        }
    }
}

pub struct FanOut<D: Dialer> {
    dialer: Arc<D>,
    candidates: Vec<String>,
}

impl<D: Dialer> FanOut<D> {
    pub fn new(dialer: D) -> Self {
        FanOut {
            dialer: Arc::new(dialer),
            candidates: Vec::new(),
        }
    }

    pub fn candidate(mut self, address: impl Into<String>) -> Self {
        self.candidates.push(address.into());
        self
    }

    pub fn candidates<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Races all candidates and returns the winner's connection, or the
    /// reason the scope ended without one.
    pub async fn race(&self, scope: &CancelScope) -> AppResult<Winner<D::Conn>> {
        self.race_report(scope).await.into_result()
    }

    /// Like [`race`](Self::race) but reports the scope's terminal reason and
    /// the attempt bookkeeping as well.
    ///
    /// Failed attempts only remove a contender. With no contender left the
    /// race still waits for the scope, so bind a deadline to it.
    pub async fn race_report(&self, scope: &CancelScope) -> FanOutReport<D::Conn> {
        let (winner_tx, mut winner_rx) = mpsc::channel(1);
        let mut attempts = TaskGroup::new("fan-out");
        for (index, address) in self.candidates.iter().enumerate() {
            attempts.spawn(attempt(
                self.dialer.clone(),
                scope.clone(),
                index + 1,
                address.clone(),
                winner_tx.clone(),
            ));
        }
        // only attempts hold senders from here on
        drop(winner_tx);
        let spawned = attempts.spawned();

        let mut contenders_left = true;
        let winner = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break None,
                published = winner_rx.recv(), if contenders_left => match published {
                    Some(winner) => {
                        scope.cancel();
                        break Some(winner);
                    }
                    None => {
                        debug!("every dial attempt failed, waiting for the scope to end");
                        contenders_left = false;
                    }
                },
            }
        };

        let finished = attempts.join_all().await;
        // a second success may have filled the slot after the first was taken
        winner_rx.close();
        while let Ok(redundant) = winner_rx.try_recv() {
            trace!("closing redundant connection from dialer {}", redundant.id);
        }

        let reason = scope.reason();
        match &winner {
            Some(winner) => info!("dialer {} won the race to {}", winner.id, winner.address),
            None => info!("no dialer connected: {:?}", reason),
        }
        FanOutReport {
            winner,
            reason,
            attempts: spawned,
            finished,
        }
    }
}

async fn attempt<D: Dialer>(
    dialer: Arc<D>,
    scope: CancelScope,
    id: usize,
    address: String,
    winner_tx: mpsc::Sender<Winner<D::Conn>>,
) {
    let conn = tokio::select! {
        biased;
        _ = scope.cancelled() => {
            trace!("dialer {} canceled", id);
            return;
        }
        result = dialer.dial(&address) => match result {
            Ok(conn) => conn,
            Err(e) => {
                debug!("dialer {} failed to connect to {}: {}", id, address, e);
                return;
            }
        },
    };

    // nobody is listening any more, close right away
    if scope.is_done() {
        trace!("dialer {} connected after the scope ended, closing", id);
        return;
    }
    match winner_tx.try_send(Winner { id, address, conn }) {
        Ok(()) => trace!("dialer {} published its connection", id),
        Err(TrySendError::Full(lost)) | Err(TrySendError::Closed(lost)) => {
            trace!("dialer {} lost the race, closing", lost.id);
        }
    }
}

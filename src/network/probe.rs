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

//! Liveness probing.
//!
//! A [`LivenessProbe`] writes [`PING`] to a sink every interval until its
//! scope ends. The interval can be changed, or the current window restarted,
//! by sending a duration on the reset channel: a zero duration keeps the
//! interval and only restarts the window. A failed write ends the probe; it
//! never retries.
//!
//! A write still pending when the scope ends is abandoned. On a plain sink
//! that can leave the first bytes of `ping` behind; a
//! [`ChannelWriter`](crate::ChannelWriter) sink always takes the literal in
//! one piece or not at all.

use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Sleep};
use tracing::{debug, trace, warn};

use crate::service::CancelScope;
use crate::AppResult;

pub const PING: &[u8; 4] = b"ping";
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// A one-shot timer that is explicitly drained before it is rearmed, so a
/// fire that is already due is discarded instead of delivered late.
#[derive(Debug)]
pub struct ProbeTimer {
    sleep: Pin<Box<Sleep>>,
    interval: Duration,
    armed: bool,
}

impl ProbeTimer {
    /// Creates a disarmed timer.
    pub fn new(interval: Duration) -> Self {
        ProbeTimer {
            sleep: Box::pin(time::sleep(interval)),
            interval,
            armed: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Disarms the timer. Returns true when a fire was already due and has
    /// been discarded.
    pub fn stop_and_drain(&mut self) -> bool {
        let due = self.armed && self.sleep.deadline() <= Instant::now();
        self.armed = false;
        due
    }

    /// Adopts `interval` and schedules the next fire one interval from now.
    pub fn rearm(&mut self, interval: Duration) {
        self.interval = interval;
        self.sleep.as_mut().reset(Instant::now() + interval);
        self.armed = true;
    }

    /// Resolves when an armed timer fires and leaves it disarmed. Never
    /// resolves while disarmed. Dropping the future keeps the timer armed.
    pub async fn fired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

pub struct LivenessProbe<W> {
    scope: CancelScope,
    sink: W,
    resets: mpsc::Receiver<Duration>,
    default_interval: Duration,
}

impl<W> LivenessProbe<W>
where
    W: AsyncWrite + Unpin,
{
    /// `resets` is meant to be a capacity 1 channel; a duration already
    /// queued when [`run`](Self::run) starts becomes the initial interval.
    pub fn new(scope: CancelScope, sink: W, resets: mpsc::Receiver<Duration>) -> Self {
        LivenessProbe {
            scope,
            sink,
            resets,
            default_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Interval used when no positive initial interval is queued. Zero is
    /// ignored.
    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.default_interval = interval;
        }
        self
    }

    /// Runs until the scope ends (`Ok` with the number of probes sent) or a
    /// write fails (`Err`).
    pub async fn run(self) -> AppResult<u64> {
        let LivenessProbe {
            scope,
            mut sink,
            mut resets,
            default_interval,
        } = self;
        let interval = match resets.try_recv() {
            Ok(interval) if !interval.is_zero() => interval,
            _ => default_interval,
        };
        let mut timer = ProbeTimer::new(interval);
        timer.rearm(interval);
        debug!("liveness probe started with interval {:?}", interval);

        let mut resets_open = true;
        let mut sent = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    timer.stop_and_drain();
                    debug!("liveness probe stopped after {} probes", sent);
                    return Ok(sent);
                }
                reset = resets.recv(), if resets_open => {
                    match reset {
                        Some(next) => {
                            if timer.stop_and_drain() {
                                trace!("discarded a due probe superseded by reset");
                            }
                            let interval = if next.is_zero() { timer.interval() } else { next };
                            timer.rearm(interval);
                            trace!("probe timer reset to {:?}", interval);
                        }
                        // nobody can reset any more, keep probing
                        None => resets_open = false,
                    }
                }
                _ = timer.fired() => {
                    let write = async {
                        sink.write_all(PING).await?;
                        sink.flush().await
                    };
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => {
                            debug!("liveness probe stopped during write after {} probes", sent);
                            return Ok(sent);
                        }
                        result = write => {
                            if let Err(e) = result {
                                warn!("liveness probe write failed, stopping: {}", e);
                                return Err(e.into());
                            }
                        }
                    }
                    sent += 1;
                    trace!("probe {} sent", sent);
                    timer.rearm(timer.interval());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::protocol::test_support::LimitedSink;
    use crate::service::setup_local_tracing;
    use crate::AppError;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    fn assert_near(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(5);
        assert!(
            actual + slack >= expected && actual <= expected + slack,
            "expected about {:?}, got {:?}",
            expected,
            actual
        );
    }

    async fn read_ping(reader: &mut DuplexStream) -> Duration {
        let begin = Instant::now();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, PING);
        begin.elapsed()
    }

    fn spawn_probe(
        scope: &CancelScope,
        initial: Option<Duration>,
    ) -> (
        DuplexStream,
        mpsc::Sender<Duration>,
        tokio::task::JoinHandle<AppResult<u64>>,
    ) {
        let (sink, reader) = tokio::io::duplex(64);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        if let Some(initial) = initial {
            reset_tx.try_send(initial).unwrap();
        }
        let probe = LivenessProbe::new(scope.clone(), sink, reset_rx);
        (reader, reset_tx, tokio::spawn(probe.run()))
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_probes_until_cancelled(_setup: ()) {
        let scope = CancelScope::new();
        let (mut reader, _reset_tx, handle) =
            spawn_probe(&scope, Some(Duration::from_millis(200)));

        for _ in 0..3 {
            assert_near(read_ping(&mut reader).await, Duration::from_millis(200));
        }
        scope.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 3);

        // the probe dropped its sink, nothing else follows
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_default_interval(_setup: ()) {
        let scope = CancelScope::new();
        let (mut reader, _reset_tx, handle) = spawn_probe(&scope, None);
        assert_near(read_ping(&mut reader).await, DEFAULT_PROBE_INTERVAL);

        // zero as the initial interval also falls back to the default
        let other = CancelScope::new();
        let (mut other_reader, _other_tx, other_handle) =
            spawn_probe(&other, Some(Duration::ZERO));
        assert_near(read_ping(&mut other_reader).await, DEFAULT_PROBE_INTERVAL);

        scope.cancel();
        other.cancel();
        handle.await.unwrap().unwrap();
        other_handle.await.unwrap().unwrap();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_zero_reset_restarts_window(_setup: ()) {
        let scope = CancelScope::new();
        let (mut reader, reset_tx, handle) =
            spawn_probe(&scope, Some(Duration::from_millis(200)));

        let begin = Instant::now();
        time::sleep(Duration::from_millis(150)).await;
        reset_tx.send(Duration::ZERO).await.unwrap();
        read_ping(&mut reader).await;
        // a full interval after the reset, not 200ms after start
        assert_near(begin.elapsed(), Duration::from_millis(350));
        assert_near(read_ping(&mut reader).await, Duration::from_millis(200));

        scope.cancel();
        handle.await.unwrap().unwrap();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_reset_adopts_new_interval(_setup: ()) {
        let scope = CancelScope::new();
        let (mut reader, reset_tx, handle) = spawn_probe(&scope, Some(Duration::from_secs(1)));

        reset_tx.send(Duration::from_millis(50)).await.unwrap();
        assert_near(read_ping(&mut reader).await, Duration::from_millis(50));
        assert_near(read_ping(&mut reader).await, Duration::from_millis(50));

        // dropping the reset side keeps the probe going
        drop(reset_tx);
        assert_near(read_ping(&mut reader).await, Duration::from_millis(50));

        scope.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_write_failure_stops_probe(_setup: ()) {
        let scope = CancelScope::new();
        let (reset_tx, reset_rx) = mpsc::channel(1);
        reset_tx.try_send(Duration::from_millis(10)).unwrap();
        // room for exactly one probe
        let probe = LivenessProbe::new(scope.clone(), LimitedSink::new(4), reset_rx);

        let result = probe.run().await;
        assert!(matches!(result, Err(AppError::IoError(_))));
        assert!(!scope.is_done());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_write_blocked(_setup: ()) {
        let scope = CancelScope::new();
        // a one byte pipe nobody reads from
        let (sink, mut reader) = tokio::io::duplex(1);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        reset_tx.try_send(Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(LivenessProbe::new(scope.clone(), sink, reset_rx).run());

        time::sleep(Duration::from_millis(50)).await;
        scope.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 0);

        // the abandoned write left only what the pipe had room for
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"p");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_channel_sink_gets_whole_literal(_setup: ()) {
        let scope = CancelScope::new();
        let (sink, mut frames_rx) = crate::network::channel_writer(1);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        reset_tx.try_send(Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(LivenessProbe::new(scope.clone(), sink, reset_rx).run());

        // the first probe fills the queue, the second one waits for room
        time::sleep(Duration::from_millis(50)).await;
        scope.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(frames_rx.recv().await.unwrap().as_ref(), PING);
        assert!(frames_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drains_due_fire() {
        let mut timer = ProbeTimer::new(Duration::from_millis(100));
        assert!(!timer.is_armed());
        assert!(!timer.stop_and_drain());

        timer.rearm(Duration::from_millis(100));
        time::advance(Duration::from_millis(150)).await;
        // the fire is due but was never observed
        assert!(timer.stop_and_drain());
        assert!(!timer.is_armed());

        timer.rearm(timer.interval());
        let early = time::timeout(Duration::from_millis(99), timer.fired()).await;
        assert!(early.is_err());
        assert!(timer.is_armed());
        timer.fired().await;
        assert!(!timer.is_armed());
    }
}

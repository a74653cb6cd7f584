//! Retry-until loops and per-peer re-dial backoff.
//!
//! [`RetryTask`] repeats an async step on a timer until the step reports it
//! is done, a deadline passes, or the task is cancelled. Joining a room uses
//! it to resend `request-storage` until the snapshot lands.
//!
//! [`Redialer`] paces reconnect attempts to known peers that have no open
//! link: 1s, 2s, 4s … up to a cap, reset once a link opens.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use eatwheel_core::PeerId;
use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Stop trying after this long. `None` tries until cancelled.
    pub max_wait: Option<Duration>,
    /// Interval multiplier per attempt. `1.0` keeps a fixed cadence.
    pub backoff: f64,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
            backoff: 1.0,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay after the `attempt`-th try (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.interval.mul_f64(factor.min(1e6));
        match self.max_wait {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The step reported completion.
    Done,
    TimedOut,
    Cancelled,
}

/// A cancelable retry loop. Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct RetryTask {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<RetryOutcome>>,
}

impl RetryTask {
    /// Run `step(attempt)` now and then after every delay of `policy`, until
    /// it returns `Break`.
    pub fn spawn<F, Fut>(policy: RetryPolicy, mut step: F) -> Self
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut attempt = 0u32;
            loop {
                if step(attempt).await.is_break() {
                    return RetryOutcome::Done;
                }
                if let Some(max) = policy.max_wait {
                    if started.elapsed() >= max {
                        debug!("Retry gave up after {attempt} attempt(s)");
                        return RetryOutcome::TimedOut;
                    }
                }
                tokio::select! {
                    _ = sleep(policy.delay(attempt)) => {}
                    _ = cancelled.changed() => return RetryOutcome::Cancelled,
                }
                attempt = attempt.saturating_add(1);
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the loop to end.
    pub async fn join(mut self) -> RetryOutcome {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(RetryOutcome::Cancelled),
            None => RetryOutcome::Cancelled,
        }
    }
}

impl Drop for RetryTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Doubling delay between a base and a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn next(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.base.min(self.cap),
            Some(d) => d.saturating_mul(2).min(self.cap),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerSchedule {
    delay: Duration,
    next_at: Instant,
}

/// Per-peer re-dial pacing.
#[derive(Debug)]
pub struct Redialer {
    backoff: Backoff,
    peers: HashMap<PeerId, PeerSchedule>,
}

impl Redialer {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            peers: HashMap::new(),
        }
    }

    /// Whether `peer` is due a dial at `now`. A `true` answer books the
    /// attempt and pushes the next one out.
    pub fn poll(&mut self, peer: &str, now: Instant) -> bool {
        match self.peers.get_mut(peer) {
            Some(schedule) if now < schedule.next_at => false,
            Some(schedule) => {
                schedule.delay = self.backoff.next(Some(schedule.delay));
                schedule.next_at = now + schedule.delay;
                true
            }
            None => {
                let delay = self.backoff.next(None);
                self.peers.insert(
                    peer.to_string(),
                    PeerSchedule {
                        delay,
                        next_at: now + delay,
                    },
                );
                true
            }
        }
    }

    /// Link opened: the next loss starts again from the base delay.
    pub fn reset(&mut self, peer: &str) {
        self.peers.remove(peer);
    }

    /// Current wait before the next attempt, if any attempt was made.
    pub fn delay(&self, peer: &str) -> Option<Duration> {
        self.peers.get(peer).map(|s| s.delay)
    }
}

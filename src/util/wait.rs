//! Bounded Polling
//!
//! Every "wait for something to become true" loop in the grid goes through
//! [`wait_until`]: the coordinator waiting on a cluster lock, non-coordinators
//! waiting for a done signal, tests waiting for a node to be suspected.
//!
//! A check is polled, and between polls the caller sleeps according to a
//! [`Backoff`]. The outcome distinguishes success, timeout and cancellation.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Done(T),
    Expired,
    Cancelled,
}

impl<T> WaitOutcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, WaitOutcome::Done(_))
    }

    pub fn into_done(self) -> Option<T> {
        match self {
            WaitOutcome::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Check<T> {
    Ready(T),
    NotYet,
    Cancel,
}

/// Sleep schedule between polls.
///
/// The delay starts at `initial`, is multiplied by `factor` after every poll
/// and capped at `max`. Up to `jitter_ms` of random delay is added on top.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
    pub jitter_ms: u64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: u32, max: Duration, jitter_ms: u64) -> Self {
        Self {
            initial,
            factor: factor.max(1),
            max: max.max(initial),
            jitter_ms,
            current: initial,
        }
    }

    /// Constant delay, no jitter.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, 1, interval, 0)
    }

    /// Doubling delay capped at `max`, with up to `initial` of jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::new(initial, 2, max, (initial.as_millis() as u64).max(1))
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * self.factor).min(self.max);

        if self.jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::random::<u64>() % self.jitter_ms)
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Polls `check` until it is ready, asks to cancel, or `timeout` elapses.
///
/// The check is always called at least once, even with a zero timeout. A
/// `None` timeout waits forever.
pub async fn wait_until<T, F, Fut>(
    mut check: F,
    mut backoff: Backoff,
    timeout: Option<Duration>,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<T>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        match check().await {
            Check::Ready(value) => return WaitOutcome::Done(value),
            Check::Cancel => return WaitOutcome::Cancelled,
            Check::NotYet => {}
        }

        let mut delay = backoff.next_delay();
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Expired;
            }
            delay = delay.min(deadline - now);
        }

        tokio::time::sleep(delay).await;
    }
}

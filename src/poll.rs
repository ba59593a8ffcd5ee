//! Bounded polling and retry primitives.
//!
//! Every wait in the coordinator goes through one of these two helpers so the
//! ceilings, intervals and budgets are declared at the call site and nothing
//! ever blocks indefinitely:
//!
//! - [`poll_until`] probes at a fixed interval until the probe reports ready
//!   or the ceiling elapses.
//! - [`retry_bounded`] re-runs an operation up to a fixed attempt budget with
//!   fixed or linear backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval and hard ceiling for a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }

    /// Upper bound on how many times a probe can run before the ceiling
    pub fn max_probes(&self) -> u64 {
        if self.interval.is_zero() {
            return 1;
        }
        (self.ceiling.as_millis() / self.interval.as_millis().max(1)) as u64 + 2
    }
}

/// What a single probe observed
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T, S> {
    Ready(T),
    /// Not ready; carries the last observed status for diagnostics
    Pending(S),
}

/// Ceiling reached without a `Ready` probe
#[derive(Debug, Clone, PartialEq)]
pub struct PollTimeout<S> {
    pub elapsed: Duration,
    pub probes: u64,
    /// Status from the most recent successful probe, if any succeeded
    pub last: Option<S>,
}

/// Probe every `spec.interval` until ready or `spec.ceiling` elapses.
///
/// Probe errors are logged and treated as "not ready yet"; they never end the
/// loop early and never extend it past the ceiling. A probe that is still
/// running when the ceiling arrives is dropped and counts as pending with no
/// status.
pub async fn poll_until<T, S, E, F, Fut>(
    description: &str,
    spec: PollSpec,
    mut probe: F,
) -> Result<T, PollTimeout<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T, S>, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut probes = 0u64;
    let mut last = None;

    loop {
        probes += 1;
        let remaining = spec.ceiling.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, probe()).await {
            Ok(Ok(Probe::Ready(value))) => {
                debug!(what = %description, probes, elapsed_ms = start.elapsed().as_millis() as u64, "Poll ready");
                return Ok(value);
            }
            Ok(Ok(Probe::Pending(status))) => {
                last = Some(status);
            }
            Ok(Err(e)) => {
                warn!(what = %description, error = %e, "Poll error, retrying");
            }
            Err(_) => {
                warn!(what = %description, probes, "Probe still running at the ceiling, abandoned");
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= spec.ceiling {
            warn!(what = %description, probes, elapsed_ms = elapsed.as_millis() as u64, "Poll ceiling reached");
            return Err(PollTimeout {
                elapsed,
                probes,
                last,
            });
        }

        let remaining = spec.ceiling - elapsed;
        tokio::time::sleep(spec.interval.min(remaining)).await;
    }
}

/// Delay policy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Attempt `n` (1-based) waits `n * step` before the next attempt
    Linear(Duration),
}

impl Backoff {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(step) => step.saturating_mul(attempt.max(1)),
        }
    }
}

/// Attempt budget for [`retry_bounded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryBudget {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// Result of one attempt inside [`retry_bounded`]
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Failed, worth another try if budget remains
    Retry(E),
    /// Failed in a way retrying cannot fix
    Abort(E),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
    /// `true` when the budget ran out, `false` when an attempt aborted
    pub exhausted: bool,
}

/// Run `operation` until it succeeds, aborts, or uses up `budget.attempts`.
pub async fn retry_bounded<T, E, F, Fut>(
    description: &str,
    budget: RetryBudget,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(error) => {
                warn!(what = %description, attempt, error = %error, "Attempt aborted");
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                    exhausted: false,
                });
            }
            Attempt::Retry(error) => {
                if attempt >= budget.attempts {
                    warn!(what = %description, attempt, error = %error, "Retry budget exhausted");
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                        exhausted: true,
                    });
                }

                let delay = budget.backoff.delay_after(attempt);
                debug!(
                    what = %description,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_ready_after_pending() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(60));

        let result: Result<u32, PollTimeout<u32>> = poll_until("counter", spec, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Ok::<_, String>(Probe::Pending(n))
                } else {
                    Ok(Probe::Ready(n))
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_last_status() {
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(20));
        let start = Instant::now();

        let result: Result<(), PollTimeout<&str>> =
            poll_until("stuck", spec, || async { Ok::<_, String>(Probe::Pending("behind")) }).await;

        let timeout = result.unwrap_err();
        assert_eq!(timeout.last, Some("behind"));
        assert_eq!(timeout.probes, 5);
        assert!(timeout.probes <= spec.max_probes());
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_do_not_end_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let spec = PollSpec::new(Duration::from_secs(1), Duration::from_secs(10));

        let result: Result<&str, PollTimeout<()>> = poll_until("flaky", spec, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection refused")
                } else {
                    Ok(Probe::Ready("up"))
                }
            }
        })
        .await;

        assert_eq!(result, Ok("up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_without_any_status() {
        let spec = PollSpec::new(Duration::from_secs(2), Duration::from_secs(4));
        let result: Result<(), PollTimeout<u8>> =
            poll_until("down", spec, || async { Err::<Probe<(), u8>, _>("refused") }).await;
        assert_eq!(result.unwrap_err().last, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_check_cannot_outlive_ceiling() {
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(20));
        let start = Instant::now();

        let result: Result<(), PollTimeout<u8>> = poll_until("hung", spec, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(Probe::Ready(()))
        })
        .await;

        let timeout = result.unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(timeout.probes, 1);
        assert_eq!(timeout.last, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_check_keeps_earlier_status() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(30));
        let start = Instant::now();

        let result: Result<(), PollTimeout<&str>> = poll_until("stalls", spec, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok::<_, String>(Probe::Pending("behind"))
                } else {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Probe::Ready(()))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap_err().last, Some("behind"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = Backoff::Linear(Duration::from_secs(15));
        assert_eq!(backoff.delay_after(1), Duration::from_secs(15));
        assert_eq!(backoff.delay_after(3), Duration::from_secs(45));
        assert_eq!(Backoff::Fixed(Duration::from_secs(2)).delay_after(4), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_budget() {
        let budget = RetryBudget::new(5, Backoff::Linear(Duration::from_secs(10)));
        let start = Instant::now();

        let result: Result<u32, RetryFailure<&str>> = retry_bounded("op", budget, |attempt| async move {
            if attempt < 3 {
                Attempt::Retry("busy")
            } else {
                Attempt::Done(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        // 10s after the first failure, 20s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let budget = RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(1)));

        let result: Result<(), RetryFailure<&str>> = retry_bounded("op", budget, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Attempt::Retry("always fails")
            }
        })
        .await;

        let failure = result.unwrap_err();
        assert!(failure.exhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_abort_stops_immediately() {
        let budget = RetryBudget::new(5, Backoff::Fixed(Duration::from_secs(60)));
        let result: Result<(), RetryFailure<&str>> =
            retry_bounded("op", budget, |_| async { Attempt::Abort("fatal") }).await;

        let failure = result.unwrap_err();
        assert!(!failure.exhausted);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error, "fatal");
    }
}

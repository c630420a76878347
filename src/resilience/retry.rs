// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry with exponential backoff.
//!
//! Used only while establishing backend connections and creating schema.
//! Individual storage operations are never retried here: a failed query is
//! reported to the caller unchanged, and the one recoverable failure (a
//! duplicate-key race) is handled by [`super::collision`].
//!
//! ```
//! use record_store::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for connecting to a backend.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. Never less than one.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Five attempts, 200ms doubling up to 2s: a misconfigured URL fails
    /// in a few seconds instead of hanging startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Delay to wait after `delay`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `connect` until it succeeds or `config.max_attempts` is spent,
/// returning the last error.
pub async fn retry<F, Fut, T, E>(target: &str, config: &RetryConfig, mut connect: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        match connect().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(target_name = target, attempt, "Connected after retrying");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    target_name = target,
                    attempt,
                    max_attempts,
                    error = %err,
                    ?delay,
                    "Connection attempt failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    async fn flaky(calls: Arc<AtomicUsize>, fail_first: usize) -> Result<&'static str, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_first {
            Err(format!("connection refused ({})", n))
        } else {
            Ok("connected")
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_makes_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry("sql_connect", &quick(3), || flaky(calls.clone(), 0)).await;
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry("redis_connect", &quick(3), || flaky(calls.clone(), 2)).await;
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry("redis_connect", &quick(3), || flaky(calls.clone(), 10)).await;
        assert_eq!(result.unwrap_err(), "connection refused (3)");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry("sql_connect", &quick(0), || flaky(calls.clone(), 10)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_startup_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);

        let mut delay = config.initial_delay;
        let mut schedule = vec![delay];
        for _ in 0..4 {
            delay = config.next_delay(delay);
            schedule.push(delay);
        }
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_secs(2),
            ]
        );
    }
}

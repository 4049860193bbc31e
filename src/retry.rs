//! # Retry Policies
//!
//! Retry-with-backoff as an explicit policy value passed to a generic
//! combinator. Only errors that report themselves as temporary are retried;
//! any other error is returned immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Errors that can tell whether a retry may succeed.
pub trait Temporary {
    fn is_temporary(&self) -> bool;
}

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * fib(n)` after the n-th failed attempt: 1, 1, 2, 3, 5, ...
    Fibonacci(Duration),
    Constant(Duration),
    None,
}

impl Backoff {
    /// Delay to wait after `attempt` (1-based) has failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fibonacci(base) => base.saturating_mul(fibonacci(attempt)),
            Backoff::Constant(d) => *d,
            Backoff::None => Duration::ZERO,
        }
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Maximum attempts plus backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Log each temporary failure at debug level.
    pub log: bool,
}

impl RetryPolicy {
    pub fn fibonacci(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fibonacci(base),
            log: false,
        }
    }

    pub fn with_logging(mut self) -> Self {
        self.log = true;
        self
    }

    /// Provider send calls.
    pub fn send() -> Self {
        Self::fibonacci(10, Duration::from_millis(65)).with_logging()
    }

    /// Status writes after a send attempt.
    pub fn status_write() -> Self {
        Self::fibonacci(15, Duration::from_millis(50))
    }

    /// Asynchronous provider status callbacks.
    pub fn status_update() -> Self {
        Self::fibonacci(10, Duration::from_millis(100)).with_logging()
    }
}

/// Run `op` until it succeeds, fails with a non-temporary error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry_temporary<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Temporary + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_temporary() && attempt < max_attempts => {
                let delay = policy.backoff.delay(attempt);
                if policy.log {
                    debug!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after temporary error"
                    );
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

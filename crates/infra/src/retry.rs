//! Exponential backoff with jitter around a fallible call.
//!
//! The policy knows nothing about tasks or queues. Errors opt into retries
//! through [`Retryable`]; anything else aborts on the first failure.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Marks which errors are worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub growth_factor: f64,
    /// Draw the actual sleep uniformly from `[0.8 * delay, 1.2 * delay]`.
    pub jitter: bool,
    /// Upper bound for a single sleep.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            jitter: true,
            max_delay: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            growth_factor: 1.0,
            jitter: false,
            max_delay: None,
        }
    }

    /// Doubling delay, capped at `max_delay`, with jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            growth_factor: 2.0,
            jitter: true,
            max_delay: Some(max_delay),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered, uncapped delay after failed attempt `attempt` (1-indexed).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.growth_factor.powi(attempt.saturating_sub(1) as i32);
        secs_to_duration(self.base_delay.as_secs_f64() * exp)
    }

    /// Sleep to take after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.sleep_for(self.nominal_delay(attempt))
    }

    fn sleep_for(&self, nominal: Duration) -> Duration {
        let mut sleep = nominal;
        if self.jitter && !nominal.is_zero() {
            let secs = nominal.as_secs_f64();
            sleep = secs_to_duration(rand::thread_rng().gen_range(secs * 0.8..=secs * 1.2));
        }
        match self.max_delay {
            Some(cap) => sleep.min(cap),
            None => sleep,
        }
    }

    /// Run `op`, retrying errors that report themselves as retryable.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + core::fmt::Display,
    {
        self.run_with(op, |e: &E| e.is_retryable())
    }

    /// Run `op`, retrying errors accepted by `is_retryable`.
    ///
    /// On exhaustion the last retryable error is returned.
    pub fn run_with<T, E, F, P>(&self, op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: core::fmt::Display,
    {
        self.run_with_sleeper(op, is_retryable, thread::sleep)
    }

    pub(crate) fn run_with_sleeper<T, E, F, P, S>(
        &self,
        mut op: F,
        is_retryable: P,
        mut sleep: S,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        S: FnMut(Duration),
        E: core::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.base_delay.as_secs_f64();
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    error!(attempts = max_attempts, error = %err, "retry budget exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let pause = self.sleep_for(secs_to_duration(delay));
                    warn!(
                        attempt,
                        max_attempts,
                        sleep_ms = pause.as_millis() as u64,
                        error = %err,
                        "retryable failure"
                    );
                    sleep(pause);
                    delay *= self.growth_factor;
                    attempt += 1;
                }
            }
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

use std::time::Duration;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

/// Upper bound on `max_attempts` accepted from configuration.
pub const MAX_POLL_ATTEMPTS: u32 = 600;
/// Upper bound on a single backoff delay.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollPolicyError {
    #[error("poll max_attempts must be between 1 and {}, got {0}", MAX_POLL_ATTEMPTS)]
    Attempts(u32),
    #[error("poll delays must satisfy initial <= max <= {}s", MAX_POLL_DELAY.as_secs())]
    Delay,
}

#[derive(Error, Debug)]
pub enum PollError<E> {
    #[error("still not settled after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("{0}")]
    Failed(E),
}

/// Bounded polling with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "PollPolicyConfig")]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Deserialize)]
struct PollPolicyConfig {
    max_attempts: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

impl From<PollPolicyConfig> for PollPolicy {
    fn from(value: PollPolicyConfig) -> Self {
        Self {
            max_attempts: value.max_attempts,
            initial_delay: Duration::from_millis(value.initial_delay_ms),
            max_delay: Duration::from_millis(value.max_delay_ms),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    /// A policy that never sleeps; tests use it to cap iterations without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), PollPolicyError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_POLL_ATTEMPTS {
            return Err(PollPolicyError::Attempts(self.max_attempts));
        }
        if self.initial_delay > self.max_delay || self.max_delay > MAX_POLL_DELAY {
            return Err(PollPolicyError::Delay);
        }
        Ok(())
    }

    /// Delay to wait before the given (zero-based) refresh.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Refreshes `current` with `fetch` until `settled` holds, at most
    /// `max_attempts` times. Fetch errors end polling immediately.
    pub fn poll<T, E, F, S>(
        &self,
        what: &str,
        mut current: T,
        mut fetch: F,
        settled: S,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Result<T, E>,
        S: Fn(&T) -> bool,
    {
        let mut attempt = 0;
        while !settled(&current) {
            if attempt >= self.max_attempts {
                return Err(PollError::Exhausted { attempts: attempt });
            }
            let delay = self.delay_for(attempt);
            debug!(
                "[poll] {} not settled, refresh {} of {} in {}ms",
                what,
                attempt + 1,
                self.max_attempts,
                delay.as_millis()
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
            current = fetch().map_err(PollError::Failed)?;
        }
        Ok(current)
    }
}

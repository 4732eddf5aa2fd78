use crate::error::ConnectError;
use rand::Rng;
use std::time::Duration;

/// Backoff configuration. Fields are fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, ConnectError> {
        if max_retries == 0 {
            return Err(ConnectError::Config("max_retries must be at least 1".to_owned()));
        }
        if base_delay > max_delay {
            return Err(ConnectError::Config("base_delay exceeds max_delay".to_owned()));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ConnectError::Config("backoff_multiplier must be >= 1".to_owned()));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
        })
    }

    /// More attempts and longer delays for memory/network constrained clients.
    pub fn constrained() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// `min(base_delay * multiplier^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Jitter {
    #[default]
    None,
    /// Scales each delay by a random factor in `[1 - f, 1 + f]`.
    Proportional(f64),
}

impl Jitter {
    pub fn apply(&self, delay: Duration, ceiling: Duration) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(factor) if factor > 0.0 && factor.is_finite() => {
                let factor = factor.min(1.0);
                let scale = 1.0 + rand::thread_rng().gen_range(-factor..=factor);
                delay.mul_f64(scale).min(ceiling)
            }
            Jitter::Proportional(_) => delay,
        }
    }
}

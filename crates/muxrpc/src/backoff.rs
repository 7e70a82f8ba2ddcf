//! Exponential backoff with capped delay and seeded jitter.
//!
//! The delay for attempt `n` (1-based) is
//! `min(max_backoff, initial_backoff * multiplier^(n-1))`, optionally jittered
//! by `delay * jitter * u` with `u` drawn uniformly from `[0, 1)`. The jittered
//! value is clamped to `[0, max_backoff]`. A fixed seed makes the sequence
//! reproducible.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How jitter is applied to the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No jitter.
    None,
    /// Jitter is added to the delay.
    Add,
    /// Jitter is subtracted from the delay.
    Subtract,
    /// Jitter is added or subtracted, centred on the delay.
    #[default]
    Symmetric,
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
    /// How the jitter is applied.
    pub jitter_mode: JitterMode,
    /// Seed for the jitter source. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 120_000,
            multiplier: 1.6,
            jitter: 0.2,
            jitter_mode: JitterMode::Symmetric,
            seed: None,
        }
    }
}

impl BackoffConfig {
    /// Unjittered delay for a 1-based attempt number. Attempt 0 is treated as 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let initial = self.initial_backoff_ms as f64;
        let max = self.max_backoff_ms as f64;
        let multiplier = self.multiplier.max(1.0);
        let computed = initial * multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let capped = if computed.is_finite() { computed.min(max) } else { max };
        Duration::from_millis(capped as u64)
    }
}

/// Stateful backoff sequence.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    rng: StdRng,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff sequence. Uses the configured seed when present.
    pub fn new(config: BackoffConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            attempt: 0,
        }
    }

    /// Jittered delay for a 1-based attempt number.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let base = self.config.base_delay(attempt).as_millis() as f64;
        let max = self.config.max_backoff_ms as f64;
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let jittered = match self.config.jitter_mode {
            _ if jitter == 0.0 => base,
            JitterMode::None => base,
            JitterMode::Add => base + base * jitter * self.rng.gen::<f64>(),
            JitterMode::Subtract => base - base * jitter * self.rng.gen::<f64>(),
            JitterMode::Symmetric => base + base * jitter * (2.0 * self.rng.gen::<f64>() - 1.0),
        };
        Duration::from_millis(jittered.clamp(0.0, max) as u64)
    }

    /// Advances to the next attempt and returns its delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay(self.attempt)
    }

    /// Number of delays handed out since creation or the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restarts the sequence at the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The configuration in use.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

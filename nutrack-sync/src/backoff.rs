//! Adaptive poll interval
//!
//! The poll loop threads a [`BackoffState`] through
//! [`BackoffPolicy::next_interval`], a pure function, and applies jitter to
//! the result separately so the policy can be tested without timers.

use rand::Rng;
use std::time::Duration;

/// Configuration for the poll loop's backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Regular poll interval when nothing goes wrong
    pub regular: Duration,

    /// Starting point of the backoff after a reset
    pub initial: Duration,

    /// Upper bound for rate-limit backoff
    pub ceiling: Duration,

    /// Multiplier applied after a rate-limit response
    pub factor: f64,

    /// Multiplier applied after any other failure
    pub mild_factor: f64,

    /// Relative jitter, e.g. 0.15 for ±15%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            regular: Duration::from_secs(5 * 60),
            initial: Duration::from_secs(60),
            ceiling: Duration::from_secs(60 * 60),
            factor: 2.0,
            mild_factor: 1.5,
            jitter: 0.15,
        }
    }
}

/// In-memory backoff state. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub current: Duration,
}

/// Result of one poll iteration as seen by the backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Failed,
}

impl BackoffPolicy {
    pub fn initial_state(&self) -> BackoffState {
        BackoffState { current: self.initial }
    }

    /// Compute the next state and the un-jittered delay before the next poll.
    pub fn next_interval(&self, state: BackoffState, outcome: Outcome) -> (BackoffState, Duration) {
        let twice_regular = self.regular * 2;

        match outcome {
            Outcome::RateLimited => {
                let current = scale(state.current, self.factor).min(self.ceiling);
                (BackoffState { current }, current)
            }
            Outcome::Failed => {
                let current = if state.current > twice_regular {
                    (state.current / 2).max(self.regular)
                } else {
                    scale(state.current, self.mild_factor).min(twice_regular)
                };
                (BackoffState { current }, current)
            }
            Outcome::Success => {
                // Step down gradually from a high backoff, otherwise reset.
                let current = if state.current > twice_regular {
                    (state.current / 2).max(self.regular)
                } else {
                    self.initial
                };
                (BackoffState { current }, current.max(self.regular))
            }
        }
    }

    /// Scale `interval` by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn apply_jitter<R: Rng + ?Sized>(&self, interval: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 {
            return interval;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        scale(interval, factor)
    }
}

fn scale(interval: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

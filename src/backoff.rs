// Exponential backoff schedule for the --auto-retry mode. The policy is
// immutable configuration shared by every request in an invocation; each
// request gets its own mutable `ExponentialBackoff` state.

use std::time::{Duration, Instant};

use rand::Rng;

/// Retry configuration: never mutated after construction.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub initial_interval: Duration,
    /// Cap on any single wait.
    pub max_interval: Duration,
    /// Total wall-clock budget measured from the first failure; once spent,
    /// the error surfaces to the caller.
    pub max_elapsed: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: f64,
    /// Each wait is jittered by a uniform draw from ±(factor × interval).
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    // Roughly ten attempts over ~55 minutes before giving up:
    // sum(6 * 1.85^i for i in 0..10) ≈ 55 min.
    fn default() -> Self {
        RetryPolicy {
            initial_interval: Duration::from_secs(6),
            max_interval: Duration::from_secs(15 * 60),
            max_elapsed: Duration::from_secs(45 * 60),
            multiplier: 1.85,
            randomization_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Begins a fresh schedule for one request. The clock starts now.
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            current: self.initial_interval,
            started: Instant::now(),
        }
    }
}

/// Mutable backoff state for a single request. Both I/O-level and
/// HTTP-level failures of that request share this state.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    /// Returns the next jittered wait, or `None` once the elapsed budget
    /// is spent and the request should fail for good.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.policy.max_elapsed {
            return None;
        }
        let interval = self.current;
        let grown = self.current.mul_f64(self.policy.multiplier);
        self.current = grown.min(self.policy.max_interval);
        Some(jitter(interval, self.policy.randomization_factor))
    }

    /// Time since the first failure of this request.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let delta = interval.as_secs_f64() * factor;
    let base = interval.as_secs_f64();
    let secs = rand::thread_rng().gen_range((base - delta)..=(base + delta));
    Duration::from_secs_f64(secs.max(0.0))
}

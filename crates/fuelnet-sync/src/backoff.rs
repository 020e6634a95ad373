//! # Reconnect Backoff
//!
//! How long a supervisor waits before its next connection attempt. A policy
//! is a pure function of the number of consecutive failed attempts, so it
//! can be swapped per link and tested without a clock.
//!
//! ```text
//! attempt:        0     1     2     3     4     ...
//! FixedBackoff:   60s   60s   60s   60s   60s         (pump → distributor)
//! Exponential:    1s    2s    4s    8s    16s  → cap
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay before reconnect attempt number `attempt` (0-based).
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        FixedBackoff { interval }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Doubling delay, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff { initial, max }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Backoff strategy as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

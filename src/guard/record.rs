//! Per-identity attempt state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempt counter for one identity within its current window.
///
/// A record only exists once at least one attempt was admitted; a missing
/// record is equivalent to a count of zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Attempts admitted since the window began
    pub count: u64,
    /// When the current window began
    pub first_attempt: DateTime<Utc>,
    /// Most recent admitted attempt
    pub last_attempt: DateTime<Utc>,
}

impl AttemptRecord {
    /// Record for the first attempt of a new window.
    pub fn first(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            first_attempt: now,
            last_attempt: now,
        }
    }

    /// The record after one more admitted attempt at `now`.
    pub fn incremented(&self, now: DateTime<Utc>) -> Self {
        Self {
            count: self.count.saturating_add(1),
            first_attempt: self.first_attempt,
            last_attempt: now.max(self.first_attempt),
        }
    }

    /// Whole seconds elapsed since the window began, floored.
    pub fn window_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.first_attempt).num_milliseconds().div_euclid(1000)
    }
}

//! Escalation policy and the per-identity state transition.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

use super::record::AttemptRecord;
use super::schedule::DelaySchedule;
use crate::error::Result;

/// Attempts allowed without delay when nothing else is configured.
pub const DEFAULT_FREE_RETRIES: u64 = 2;
/// Shortest delay once escalation begins.
pub const DEFAULT_MIN_WAIT_MS: u64 = 500;
/// Longest delay, 15 minutes.
pub const DEFAULT_MAX_WAIT_MS: u64 = 15 * 60 * 1000;

/// Immutable escalation policy for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    free_retries: u64,
    schedule: DelaySchedule,
    /// Window lifetime in seconds, 0 means the window never expires
    lifetime_secs: u64,
    refresh_lifetime_on_attempt: bool,
}

/// Result of applying one attempt to an identity's current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The attempt may proceed; `record` must be persisted for `ttl_secs`.
    Admit {
        record: AttemptRecord,
        /// Seconds until the record expires, 0 for no expiry
        ttl_secs: u64,
        /// The prior window had run out and was started over
        window_expired: bool,
    },
    /// The attempt came too early. Nothing is persisted.
    Deny {
        retry_after: DateTime<Utc>,
        count: u64,
    },
}

impl Policy {
    /// Build a policy, deriving the lifetime from the schedule when unset.
    ///
    /// The derived lifetime is long enough to walk the whole schedule at
    /// `max_wait` per step, including the free retries.
    pub fn new(
        free_retries: u64,
        min_wait_ms: u64,
        max_wait_ms: u64,
        lifetime_secs: Option<u64>,
        refresh_lifetime_on_attempt: bool,
    ) -> Result<Self> {
        let schedule = DelaySchedule::build(min_wait_ms, max_wait_ms)?;
        let lifetime_secs = lifetime_secs
            .unwrap_or_else(|| derived_lifetime_secs(max_wait_ms, schedule.len(), free_retries));

        Ok(Self {
            free_retries,
            schedule,
            lifetime_secs,
            refresh_lifetime_on_attempt,
        })
    }

    /// Attempts admitted before any delay applies.
    pub fn free_retries(&self) -> u64 {
        self.free_retries
    }

    /// The escalating delays used once free retries are spent.
    pub fn schedule(&self) -> &DelaySchedule {
        &self.schedule
    }

    /// Window lifetime in seconds, 0 when windows never expire.
    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    /// Whether each admitted attempt restarts the window lifetime.
    pub fn refresh_lifetime_on_attempt(&self) -> bool {
        self.refresh_lifetime_on_attempt
    }

    /// Decide one attempt at `now` given the identity's stored record.
    pub fn evaluate(&self, prior: Option<&AttemptRecord>, now: DateTime<Utc>) -> Transition {
        let (mut count, mut first_attempt, mut next_eligible) = match prior {
            Some(record) => {
                let delay = self.schedule.delay_for(record.count, self.free_retries);
                (
                    record.count,
                    record.first_attempt,
                    add_millis(record.last_attempt, delay),
                )
            }
            None => (0, now, now),
        };

        let mut ttl_secs = self.lifetime_secs;
        let mut window_expired = false;

        if prior.is_some() && !self.refresh_lifetime_on_attempt && self.lifetime_secs > 0 {
            let elapsed = (now - first_attempt).num_milliseconds().div_euclid(1000);
            let remaining = i64::try_from(self.lifetime_secs)
                .unwrap_or(i64::MAX)
                .saturating_sub(elapsed);

            if remaining <= 0 {
                count = 0;
                first_attempt = now;
                next_eligible = now;
                window_expired = true;
            } else {
                ttl_secs = remaining as u64;
            }
        }

        if next_eligible <= now || count <= self.free_retries {
            Transition::Admit {
                record: AttemptRecord {
                    count: count.saturating_add(1),
                    first_attempt,
                    last_attempt: now.max(first_attempt),
                },
                ttl_secs,
                window_expired,
            }
        } else {
            Transition::Deny {
                retry_after: next_eligible,
                count,
            }
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        let schedule = DelaySchedule::build(DEFAULT_MIN_WAIT_MS, DEFAULT_MAX_WAIT_MS)
            .unwrap_or_else(|_| unreachable!("default delay bounds are valid"));
        let lifetime_secs =
            derived_lifetime_secs(DEFAULT_MAX_WAIT_MS, schedule.len(), DEFAULT_FREE_RETRIES);
        Self {
            free_retries: DEFAULT_FREE_RETRIES,
            schedule,
            lifetime_secs,
            refresh_lifetime_on_attempt: true,
        }
    }
}

fn derived_lifetime_secs(max_wait_ms: u64, steps: usize, free_retries: u64) -> u64 {
    let total_ms = u128::from(max_wait_ms) * (steps as u128 + u128::from(free_retries));
    u64::try_from(total_ms.div_ceil(1000)).unwrap_or(u64::MAX)
}

fn add_millis(at: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(|ms| at.checked_add_signed(Duration::milliseconds(ms)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Monotonic source of default limiter names (`brute1`, `brute2`, ...).
///
/// Engines built without an explicit name draw from [`NameSequence::global`];
/// callers that need stable names inject their own sequence or name.
#[derive(Debug)]
pub struct NameSequence {
    prefix: &'static str,
    issued: AtomicU64,
}

static GLOBAL_NAMES: NameSequence = NameSequence::new("brute");

impl NameSequence {
    /// A sequence whose names are `prefix` followed by 1, 2, ...
    pub const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            issued: AtomicU64::new(0),
        }
    }

    /// The process-wide sequence.
    pub fn global() -> &'static NameSequence {
        &GLOBAL_NAMES
    }

    pub fn next_name(&self) -> String {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", self.prefix, n)
    }

    /// Names handed out so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

//! Escalating delay schedule.

use crate::error::{BruteGuardError, Result};

/// Fibonacci-shaped backoff table, in milliseconds.
///
/// The table starts at `min_wait`, grows by summing the two previous terms
/// (the first term has an implicit zero predecessor, so it appears twice) and
/// ends with a final term clamped to exactly `max_wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySchedule {
    delays: Vec<u64>,
    max_wait: u64,
}

impl DelaySchedule {
    /// Build the schedule for the given bounds.
    ///
    /// Fails with `InvalidConfig` unless `1 <= min_wait <= max_wait`.
    pub fn build(min_wait: u64, max_wait: u64) -> Result<Self> {
        if min_wait == 0 {
            return Err(BruteGuardError::InvalidConfig(
                "min_wait must be at least 1ms".to_string(),
            ));
        }
        if min_wait > max_wait {
            return Err(BruteGuardError::InvalidConfig(format!(
                "min_wait ({}ms) must not exceed max_wait ({}ms)",
                min_wait, max_wait
            )));
        }

        let mut delays = vec![min_wait];
        let mut previous = 0u64;
        while let Some(&last) = delays.last() {
            if last >= max_wait {
                break;
            }
            let next = last.saturating_add(previous);
            previous = last;
            delays.push(next);
        }

        if let Some(last) = delays.last_mut() {
            *last = max_wait;
        }

        Ok(Self { delays, max_wait })
    }

    /// Delay required before the next attempt, given how many attempts are on record.
    ///
    /// Returns zero while `attempt_count` is within `free_retries` and
    /// `max_wait` once the count runs past the end of the table.
    pub fn delay_for(&self, attempt_count: u64, free_retries: u64) -> u64 {
        let Some(index) = attempt_count
            .checked_sub(free_retries)
            .and_then(|n| n.checked_sub(1))
        else {
            return 0;
        };

        usize::try_from(index)
            .ok()
            .and_then(|i| self.delays.get(i).copied())
            .unwrap_or(self.max_wait)
    }

    /// The delays in order.
    pub fn delays(&self) -> &[u64] {
        &self.delays
    }

    /// Number of escalation steps.
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// Always false; a schedule holds at least one step.
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// First delay in the table.
    pub fn min_wait(&self) -> u64 {
        self.delays[0]
    }

    /// Last delay in the table, and the delay for any count beyond it.
    pub fn max_wait(&self) -> u64 {
        self.max_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_default_bounds() {
        let schedule = DelaySchedule::build(500, 15 * 60 * 1000).unwrap();
        let delays = schedule.delays();

        assert_eq!(delays[0], 500);
        assert_eq!(delays[1], 500);
        assert_eq!(delays[2], 1000);
        assert_eq!(delays[3], 1500);
        assert_eq!(delays[4], 2500);
        assert_eq!(*delays.last().unwrap(), 900_000);
    }

    #[test]
    fn test_build_is_fibonacci_shaped() {
        for (min, max) in [(1, 1), (1, 100), (500, 60_000), (7, 13), (250, 251)] {
            let schedule = DelaySchedule::build(min, max).unwrap();
            let delays = schedule.delays();

            assert_eq!(delays[0], min);
            assert_eq!(*delays.last().unwrap(), max);

            let last = delays.len() - 1;
            for i in 2..last {
                assert_eq!(delays[i], delays[i - 1] + delays[i - 2]);
            }
            for i in 1..delays.len() {
                assert!(delays[i] >= delays[i - 1], "{:?}", delays);
            }
            for i in 2..delays.len() {
                assert!(delays[i] > delays[i - 1], "{:?}", delays);
            }
        }
    }

    #[test]
    fn test_build_equal_bounds() {
        let schedule = DelaySchedule::build(1000, 1000).unwrap();
        assert_eq!(schedule.delays(), &[1000]);
    }

    #[test]
    fn test_build_rejects_invalid_bounds() {
        assert!(matches!(
            DelaySchedule::build(0, 100),
            Err(BruteGuardError::InvalidConfig(_))
        ));
        assert!(matches!(
            DelaySchedule::build(200, 100),
            Err(BruteGuardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_delay_for_free_retries() {
        let schedule = DelaySchedule::build(500, 60_000).unwrap();

        for count in 0..=2 {
            assert_eq!(schedule.delay_for(count, 2), 0);
        }
        assert_eq!(schedule.delay_for(3, 2), 500);
        assert_eq!(schedule.delay_for(4, 2), 500);
        assert_eq!(schedule.delay_for(5, 2), 1000);
    }

    #[test]
    fn test_delay_for_zero_free_retries() {
        let schedule = DelaySchedule::build(100, 1000).unwrap();
        assert_eq!(schedule.delay_for(0, 0), 0);
        assert_eq!(schedule.delay_for(1, 0), 100);
    }

    #[test]
    fn test_delay_for_is_monotonic_and_capped() {
        let schedule = DelaySchedule::build(500, 60_000).unwrap();
        let mut previous = 0;
        for count in 0..200 {
            let delay = schedule.delay_for(count, 3);
            assert!(delay >= previous);
            assert!(delay <= 60_000);
            previous = delay;
        }
        assert_eq!(schedule.delay_for(u64::MAX, 0), 60_000);
    }
}

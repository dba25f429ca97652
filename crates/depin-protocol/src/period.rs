//! Wall-clock → period conversion.
//!
//! A period is one day counted from a fixed network origin. Nothing here is
//! persisted: the current period is always recomputed from `SystemTime`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::{MAX_PERIOD, PERIOD_LENGTH_SECS, PERIOD_ZERO};
use crate::error::ProtocolError;

/// Period index as stored on the ledger.
pub type Period = u16;

/// Stateless period calculator. `Copy`, so every task can hold its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    origin_secs: u64,
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new(PERIOD_ZERO)
    }
}

impl EpochClock {
    pub const fn new(origin_secs: u64) -> Self {
        Self { origin_secs }
    }

    pub fn origin(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.origin_secs)
    }

    /// Period containing `at`. Times before the origin map to period 0.
    pub fn period_at(&self, at: SystemTime) -> Result<Period, ProtocolError> {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if secs < self.origin_secs {
            return Ok(0);
        }
        let period = (secs - self.origin_secs) / PERIOD_LENGTH_SECS;
        if period > MAX_PERIOD {
            return Err(ProtocolError::PeriodOutOfRange {
                period,
                limit: MAX_PERIOD,
            });
        }
        Ok(period as Period)
    }

    pub fn current_period(&self) -> Result<Period, ProtocolError> {
        self.period_at(SystemTime::now())
    }

    pub fn period_start(&self, period: Period) -> SystemTime {
        self.origin() + Duration::from_secs(period as u64 * PERIOD_LENGTH_SECS)
    }

    /// Start of `period + 1`.
    pub fn period_end(&self, period: Period) -> SystemTime {
        self.period_start(period) + Duration::from_secs(PERIOD_LENGTH_SECS)
    }

    /// Time left in `period` as seen at `at`; zero once the period is over.
    pub fn remaining_at(&self, period: Period, at: SystemTime) -> Duration {
        self.period_end(period)
            .duration_since(at)
            .unwrap_or(Duration::ZERO)
    }

    /// Time left in `period`, or in the current period when `None`.
    pub fn remaining(&self, period: Option<Period>) -> Result<Duration, ProtocolError> {
        let now = SystemTime::now();
        let period = match period {
            Some(p) => p,
            None => self.period_at(now)?,
        };
        Ok(self.remaining_at(period, now))
    }
}

/// Milliseconds since the Unix epoch, as carried in signed payloads.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const T0: u64 = 1_700_000_000;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn origin_is_period_zero() {
        let clock = EpochClock::new(T0);
        assert_eq!(clock.period_at(at(T0)).unwrap(), 0);
    }

    #[test]
    fn before_origin_clamps_to_zero() {
        let clock = EpochClock::new(T0);
        assert_eq!(clock.period_at(at(T0 - 5)).unwrap(), 0);
        assert_eq!(clock.period_at(UNIX_EPOCH).unwrap(), 0);
    }

    #[test]
    fn third_day_remaining() {
        let clock = EpochClock::new(T0);
        let now = at(T0 + 3 * 86_400 + 10);
        let period = clock.period_at(now).unwrap();
        assert_eq!(period, 3);
        assert_eq!(clock.remaining_at(period, now), Duration::from_secs(86_390));
    }

    #[test]
    fn remaining_of_past_period_is_zero() {
        let clock = EpochClock::new(T0);
        let now = at(T0 + 5 * 86_400);
        assert_eq!(clock.remaining_at(2, now), Duration::ZERO);
    }

    #[test]
    fn period_beyond_u16_is_rejected() {
        let clock = EpochClock::new(T0);
        let last = at(T0 + MAX_PERIOD * 86_400 + 86_399);
        assert_eq!(clock.period_at(last).unwrap(), u16::MAX);

        let overflow = at(T0 + (MAX_PERIOD + 1) * 86_400);
        assert!(matches!(
            clock.period_at(overflow),
            Err(ProtocolError::PeriodOutOfRange { period, .. }) if period == MAX_PERIOD + 1
        ));
    }

    #[test]
    fn period_end_brackets_timestamp() {
        let clock = EpochClock::new(T0);
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            let ts = T0 + rng.gen_range(0..(1_000 * 86_400));
            let p = clock.period_at(at(ts)).unwrap();
            assert!(clock.period_end(p) > at(ts));
            if p > 0 {
                assert!(clock.period_end(p - 1) <= at(ts));
            }
        }
    }

    #[test]
    fn mainnet_origin_is_june_2025() {
        let clock = EpochClock::default();
        assert_eq!(clock.period_start(0), at(1_748_736_000));
        assert_eq!(clock.period_end(0), at(1_748_736_000 + 86_400));
    }
}

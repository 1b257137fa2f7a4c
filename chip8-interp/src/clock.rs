//! Timer clock.
use std::time::Duration;

use crate::constants::*;

/// CPU clock frequency, in hertz (per second)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(transparent))]
pub struct Hz(pub u64);

impl From<Hz> for Duration {
    fn from(freq: Hz) -> Self {
        if freq.0 == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(NANOS_IN_SECOND / freq.0)
        }
    }
}

/// Fixed rate clock driven by elapsed time.
///
/// It is designed to work with the yielding cooperative pattern
/// of the driving loop. The caller measures how much real time
/// passed and hands it to the clock, which reports how many whole
/// cycles elapsed. Leftover time carries over to the next call,
/// so the clock keeps its rate regardless of how unevenly it is fed.
#[derive(Debug, Clone)]
pub(crate) struct Clock {
    period: Duration,
    elapsed: Duration,
}

impl Clock {
    /// Creates a clock ticking once every `period`.
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            elapsed: Duration::ZERO,
        }
    }

    /// Creates a clock ticking at the delay timer frequency.
    pub(crate) fn timer() -> Self {
        Self::new(Duration::from_nanos(CLOCK_CYCLE_TIME))
    }

    /// Set the clock state back to zero.
    pub(crate) fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    /// Accumulate elapsed time and return the number of completed cycles.
    pub(crate) fn advance(&mut self, delta: Duration) -> u64 {
        // A zero period never ticks.
        if self.period.is_zero() {
            return 0;
        }

        self.elapsed = self.elapsed.saturating_add(delta);

        let period = self.period.as_nanos();
        let elapsed = self.elapsed.as_nanos();
        let remainder = elapsed % period;
        self.elapsed = Duration::new(
            (remainder / NANOS_IN_SECOND as u128) as u64,
            (remainder % NANOS_IN_SECOND as u128) as u32,
        );

        u64::try_from(elapsed / period).unwrap_or(u64::MAX)
    }
}

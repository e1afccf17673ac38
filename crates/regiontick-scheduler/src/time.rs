use std::time::Duration;

/// A caller-supplied delay or period, either in ticks or in wall-clock milliseconds.
///
/// Signed on purpose: a negative one-shot delay is legal (it means "as soon as
/// possible"), a negative period is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpan {
    Ticks(i64),
    Millis(i64),
}

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan::Ticks(0);

    pub fn ticks(n: i64) -> Self {
        TimeSpan::Ticks(n)
    }

    pub fn millis(ms: i64) -> Self {
        TimeSpan::Millis(ms)
    }

    pub fn is_negative(&self) -> bool {
        match self {
            TimeSpan::Ticks(n) | TimeSpan::Millis(n) => *n < 0,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            TimeSpan::Ticks(n) | TimeSpan::Millis(n) => *n > 0,
        }
    }
}

impl Default for TimeSpan {
    fn default() -> Self {
        TimeSpan::ZERO
    }
}

impl From<Duration> for TimeSpan {
    fn from(d: Duration) -> Self {
        TimeSpan::Millis(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Converts caller spans into the tick unit of the running model.
///
/// Wall-clock spans are floored to whole ticks. One-shot delays are clamped
/// to at least one tick so nothing ever runs inside `submit`; positive
/// periods are clamped to at least one tick so a sub-tick period still repeats.
#[derive(Debug, Clone, Copy)]
pub struct TimeConverter {
    tick_millis: u64,
}

impl TimeConverter {
    pub fn new(tick_millis: u64) -> Self {
        Self {
            tick_millis: tick_millis.max(1),
        }
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// `is_period = false`: delay, result >= 1.
    /// `is_period = true`: period, 0 stays 0 (one-shot), anything positive >= 1.
    pub fn to_ticks(&self, span: TimeSpan, is_period: bool) -> u64 {
        let raw = match span {
            TimeSpan::Ticks(n) => n,
            TimeSpan::Millis(ms) => ms.div_euclid(self.tick_millis as i64),
        };
        let ticks = raw.max(0) as u64;
        if is_period {
            if span.is_positive() {
                ticks.max(1)
            } else {
                0
            }
        } else {
            ticks.max(1)
        }
    }

    /// Wall-clock form of a span, for the off-loop pool. Ticks are
    /// `tick_millis` long; negative spans collapse to zero.
    pub fn to_duration(&self, span: TimeSpan) -> Duration {
        match span {
            TimeSpan::Ticks(n) => {
                Duration::from_millis(self.tick_millis.saturating_mul(n.max(0) as u64))
            }
            TimeSpan::Millis(ms) => Duration::from_millis(ms.max(0) as u64),
        }
    }
}

impl Default for TimeConverter {
    fn default() -> Self {
        Self::new(regiontick_core::config::DEFAULT_TICK_MILLIS)
    }
}

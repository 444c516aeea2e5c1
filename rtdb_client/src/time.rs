//! Microsecond-precision [`Timestamp`] and [`Duration`], and the
//! [`ScheduleAt`] tagged union (spec §3), grounded on `EnhancedTimestamp` /
//! `EnhancedTimeDuration` / `ScheduleAt` in
//! `examples/original_source/src/spacetimedb_sdk/time_utils.py`.

use std::ops::{Add, Sub};

use crate::error::{Result, ScheduleError};

/// 1000 years in microseconds, matching `EnhancedTimeDuration.max_value()`.
pub const MAX_MICROS: i64 = 1000 * 365 * 24 * 3600 * 1_000_000;

/// Wall-clock instant, microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros.clamp(-MAX_MICROS, MAX_MICROS))
    }

    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Self::from_micros(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, duration: Duration) -> Timestamp {
        Timestamp::from_micros(self.0.saturating_add(duration.as_micros()))
    }

    pub fn checked_sub_timestamp(self, other: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Timestamp {
        self.checked_add(rhs)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;
    fn sub(self, rhs: Timestamp) -> Duration {
        self.checked_sub_timestamp(rhs)
    }
}

/// Signed microsecond duration, saturating at ±1000 years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

impl Duration {
    pub fn from_micros(micros: i64) -> Self {
        Duration(micros.clamp(-MAX_MICROS, MAX_MICROS))
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_micros(millis.saturating_mul(1_000))
    }

    pub fn from_secs(secs: i64) -> Self {
        Self::from_micros(secs.saturating_mul(1_000_000))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from_micros((secs * 1_000_000.0) as i64)
    }

    pub fn zero() -> Self {
        Duration(0)
    }

    pub fn max_value() -> Self {
        Duration(MAX_MICROS)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration::from_micros(self.0.saturating_add(rhs.0))
    }
}

/// `At(Timestamp)` or `Every(Duration)`, tagged exactly as spec §3 requires
/// (`At` tag 1, `Every` tag 0, matching `ScheduleAtTime`/`ScheduleAtInterval`
/// in `time_utils.py`).
#[derive(Debug, Clone, Copy)]
pub enum ScheduleAt {
    Every(Duration),
    At(Timestamp),
}

impl ScheduleAt {
    pub const TAG_EVERY: u8 = 0;
    pub const TAG_AT: u8 = 1;

    pub fn every(duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(ScheduleError::InvalidSchedule(
                "interval schedule requires non-zero duration".into(),
            )
            .into());
        }
        Ok(ScheduleAt::Every(duration))
    }

    pub fn at(timestamp: Timestamp) -> Self {
        ScheduleAt::At(timestamp)
    }

    pub fn tag(&self) -> u8 {
        match self {
            ScheduleAt::Every(_) => Self::TAG_EVERY,
            ScheduleAt::At(_) => Self::TAG_AT,
        }
    }

    /// Computes the next execution timestamp relative to `from`.
    pub fn next_from(&self, from: Timestamp) -> Timestamp {
        match self {
            ScheduleAt::At(ts) => *ts,
            ScheduleAt::Every(duration) => from.checked_add(*duration),
        }
    }
}

//! Utilities for messing with time
//!
//! Token expiry in the `tessera` crates is anchored to absolute wall-clock
//! instants measured in milliseconds since the Unix epoch. The types here
//! provide that representation along with a [`Clock`] abstraction so that
//! the current time can be controlled in tests.
//!
//! Note that the [`System`] clock follows the wall clock, so adjustments to
//! the system time will move it, including backwards.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt, ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An instant in time
///
/// Represented as the number of milliseconds elapsed since the beginning of
/// the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct EpochMillis(pub u64);

/// A span of time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl DurationMillis {
    /// A zero-length duration
    pub const ZERO: Self = Self(0);

    /// Constructs a duration from a number of seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Constructs a duration from a number of minutes
    #[inline]
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins.saturating_mul(60))
    }

    /// The number of whole seconds in this duration
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000
    }
}

impl From<SystemTime> for EpochMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // Times before the epoch collapse to the epoch itself
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        EpochMillis(millis)
    }
}

impl From<Duration> for DurationMillis {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<DurationMillis> for Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        Duration::from_millis(d.0)
    }
}

impl EpochMillis {
    /// The time remaining from `now` until this instant
    ///
    /// Returns `None` if this instant is at or before `now`.
    #[inline]
    pub fn remaining_after(self, now: EpochMillis) -> Option<DurationMillis> {
        if self > now {
            Some(DurationMillis(self.0 - now.0))
        } else {
            None
        }
    }
}

impl ops::Add<DurationMillis> for EpochMillis {
    type Output = EpochMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        EpochMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign<DurationMillis> for EpochMillis {
    #[inline]
    fn add_assign(&mut self, rhs: DurationMillis) {
        *self = *self + rhs;
    }
}

impl ops::Sub<DurationMillis> for EpochMillis {
    type Output = EpochMillis;

    #[inline]
    fn sub(self, rhs: DurationMillis) -> Self::Output {
        EpochMillis(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub for EpochMillis {
    type Output = DurationMillis;

    /// Saturates to zero when `rhs` is later than `self`
    #[inline]
    fn sub(self, rhs: EpochMillis) -> Self::Output {
        DurationMillis(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add for DurationMillis {
    type Output = DurationMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        DurationMillis(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for DurationMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for EpochMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for EpochMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> EpochMillis;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> EpochMillis {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> EpochMillis {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> EpochMillis {
        EpochMillis::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones observe the same time, so a clock handed to a component under test
/// can still be advanced from the test body.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> EpochMillis {
        EpochMillis(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub fn new(time: EpochMillis) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: EpochMillis) {
        self.0.store(val.0, Ordering::Release);
    }

    /// Moves the clock's current time forward by `inc`
    pub fn advance(&self, inc: DurationMillis) {
        self.0.fetch_add(inc.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_constructors_scale_to_millis() {
        assert_eq!(DurationMillis::from_secs(2), DurationMillis(2_000));
        assert_eq!(DurationMillis::from_mins(5), DurationMillis(300_000));
        assert_eq!(DurationMillis::from_mins(5).as_secs(), 300);
    }

    #[test]
    fn remaining_after_is_none_once_passed() {
        let at = EpochMillis(10_000);
        assert_eq!(
            at.remaining_after(EpochMillis(4_000)),
            Some(DurationMillis(6_000))
        );
        assert_eq!(at.remaining_after(EpochMillis(10_000)), None);
        assert_eq!(at.remaining_after(EpochMillis(12_000)), None);
    }

    #[test]
    fn subtraction_saturates() {
        assert_eq!(EpochMillis(5) - EpochMillis(9), DurationMillis::ZERO);
        assert_eq!(EpochMillis(5) - DurationMillis(9), EpochMillis(0));
    }

    #[test]
    fn system_time_before_epoch_collapses_to_zero() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(EpochMillis::from(before), EpochMillis(0));
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(EpochMillis(1_000));
        let observer = clock.clone();

        clock.advance(DurationMillis::from_secs(1));
        assert_eq!(observer.now(), EpochMillis(2_000));

        observer.set(EpochMillis(42));
        assert_eq!(clock.now(), EpochMillis(42));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_bare_integers() {
        let json = serde_json::to_string(&DurationMillis(3_600_000)).unwrap();
        assert_eq!(json, "3600000");
        let at: EpochMillis = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(at, EpochMillis(1_700_000_000_000));
    }
}

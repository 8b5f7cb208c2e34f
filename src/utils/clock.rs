use std::{cmp::Ordering, marker::PhantomData, time::Duration};

use rustix::time::{clock_gettime, ClockId};

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> ClockId;
}

/// Monotonic clock
///
/// Page-flip timestamps are reported on this clock when the driver advertises
/// monotonic timestamps.
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> ClockId {
        ClockId::Monotonic
    }
}

/// Realtime clock
#[derive(Debug)]
pub struct Realtime;

impl ClockSource for Realtime {
    fn id() -> ClockId {
        ClockId::Realtime
    }
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Default for Clock<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        let tp = clock_gettime(Kind::id());
        Time::from(Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32))
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    since_epoch: Duration,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Gets the duration between self and a later time
    ///
    /// Returns zero if `later` is in fact earlier than `self`.
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        later.since_epoch.saturating_sub(self.since_epoch)
    }

    /// Gets the time elapsed between `earlier` and self, `None` if `earlier` lies in the future
    pub fn checked_elapsed(&self, earlier: Time<Kind>) -> Option<Duration> {
        self.since_epoch.checked_sub(earlier.since_epoch)
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> From<Duration> for Time<Kind> {
    fn from(since_epoch: Duration) -> Self {
        Time {
            since_epoch,
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<Time<Kind>> for Duration {
    fn from(time: Time<Kind>) -> Self {
        time.since_epoch
    }
}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time").field("since_epoch", &self.since_epoch).finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.since_epoch == other.since_epoch
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.since_epoch.cmp(&other.since_epoch)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::utils::{Clock, Monotonic, Time};

    #[test]
    fn monotonic() {
        let clock_source: Clock<Monotonic> = Clock::new();
        let now = clock_source.now();
        let zero = Time::<Monotonic>::from(Duration::ZERO);
        assert_eq!(zero.duration_since(now), now.into());
    }

    #[test]
    fn elapsed_is_none_for_future_times() {
        let clock_source: Clock<Monotonic> = Clock::new();
        let now = clock_source.now();
        let later = Time::<Monotonic>::from(Duration::from(now) + Duration::from_secs(5));
        assert_eq!(now.checked_elapsed(later), None);
        assert_eq!(later.checked_elapsed(now), Some(Duration::from_secs(5)));
    }
}

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A trait for time sources that return a monotonic or wall-clock timestamp.
///
/// This abstraction allows you to plug in a real system clock, a monotonic
/// timer, or a mocked time source in tests. Lock leases and dispatch audit
/// timestamps are both measured through it.
///
/// The timestamp type `T` is generic (typically `u64`), and the unit is
/// expected to be **milliseconds** since the UNIX epoch.
///
/// # Example
///
/// ```
/// use idpool::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource<u64> for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.current_millis(), 1234);
/// ```
pub trait TimeSource<T> {
    /// Returns the current time in milliseconds since the configured epoch.
    fn current_millis(&self) -> T;
}

/// A monotonic time source anchored to the UNIX epoch.
///
/// The wall clock is sampled once at construction; afterwards time advances
/// with [`Instant`], so NTP steps or manual clock changes cannot make a lease
/// appear to expire early or live forever.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    start: Instant,
    epoch_offset: u64, // in milliseconds
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        // A clock set before 1970 degrades to a zero offset; timestamps stay
        // monotonic either way.
        let epoch_offset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            start: Instant::now(),
            epoch_offset,
        }
    }
}

impl TimeSource<u64> for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.epoch_offset + self.start.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock shared by the lease and claim tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MockTime {
    millis: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

#[cfg(test)]
impl MockTime {
    pub(crate) fn advance(&self, millis: u64) {
        self.millis
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl TimeSource<u64> for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis.load(std::sync::atomic::Ordering::SeqCst)
    }
}

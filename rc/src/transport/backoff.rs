//! Exponential reconnect backoff

use std::time::Duration;

/// Lower bound of every reconnect wait
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Default upper bound of a reconnect wait
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Doubling delay, capped at a ceiling
///
/// The wait returned after the k-th consecutive failure is
/// `min(floor * 2^(k-1), ceiling)`. [`Backoff::reset`] is called on every
/// successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait now; advances the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).map_or(self.ceiling, |d| d.min(self.ceiling));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Delay the next call to `next_delay` will return
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_FLOOR, DEFAULT_BACKOFF_CEILING)
    }
}

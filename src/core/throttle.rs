//! Bandwidth throttling for the background scan
//!
//! Time is cut into fixed slices. Each slice has a byte quota derived from
//! the configured speed. Bytes beyond the quota are debt: the caller is told
//! to sleep until as many slices have passed as the bytes fill, so a chunk
//! larger than one slice's quota still averages out to the configured rate.
//! Writes intercepted from the live path never pass through here.

use std::time::{Duration, Instant};

/// Length of one accounting slice
pub const SLICE_TIME: Duration = Duration::from_millis(100);

/// Slice-based rate limiter
#[derive(Debug, Clone)]
pub struct RateLimit {
    speed: u64,
    slice: Duration,
    slice_quota: u64,
    dispatched: u64,
    slice_start: Instant,
    next_slice_time: Option<Instant>,
}

impl RateLimit {
    /// Create a limiter; `bytes_per_second = 0` disables it
    pub fn new(bytes_per_second: u64) -> Self {
        Self::with_slice(bytes_per_second, SLICE_TIME)
    }

    /// Create a limiter with a custom slice length
    pub fn with_slice(bytes_per_second: u64, slice: Duration) -> Self {
        let mut limit = Self {
            speed: 0,
            slice,
            slice_quota: 0,
            dispatched: 0,
            slice_start: Instant::now(),
            next_slice_time: None,
        };
        limit.set_speed(bytes_per_second);
        limit
    }

    /// Change the configured speed; takes effect from the next call
    pub fn set_speed(&mut self, bytes_per_second: u64) {
        self.speed = bytes_per_second;
        let quota = u128::from(bytes_per_second) * self.slice.as_nanos() / 1_000_000_000;
        self.slice_quota = quota.min(u128::from(u64::MAX)) as u64;
    }

    /// Configured speed in bytes per second (0 = unlimited)
    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// Whether throttling is active
    pub fn is_enabled(&self) -> bool {
        self.speed > 0
    }

    /// Bytes allowed per slice
    pub fn slice_quota(&self) -> u64 {
        self.slice_quota
    }

    /// Account for `units` bytes and return how long to wait before the next
    /// I/O, using the current time.
    pub fn calculate_delay(&mut self, units: u64) -> Duration {
        self.calculate_delay_at(Instant::now(), units)
    }

    /// Same as [`RateLimit::calculate_delay`] with an explicit clock reading.
    ///
    /// `units` are charged to the current slice. While the slice stays within
    /// its quota no wait is needed; past it, the wait runs to the end of the
    /// last slice the dispatched bytes fill.
    pub fn calculate_delay_at(&mut self, now: Instant, units: u64) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        // Slices are half-open: at `now == next_slice_time` a new one has begun.
        if !matches!(self.next_slice_time, Some(t) if t > now) {
            self.slice_start = now;
            self.next_slice_time = Some(now + self.slice);
            self.dispatched = 0;
        }

        self.dispatched = self.dispatched.saturating_add(units);
        if self.dispatched <= self.slice_quota {
            return Duration::ZERO;
        }

        let slices = self.dispatched.div_ceil(self.slice_quota.max(1));
        let debt = self
            .slice
            .saturating_mul(u32::try_from(slices).unwrap_or(u32::MAX));
        match self.slice_start.checked_add(debt) {
            Some(end) => {
                self.next_slice_time = Some(end);
                end.saturating_duration_since(now)
            }
            None => {
                self.next_slice_time = None;
                debt.saturating_sub(now.saturating_duration_since(self.slice_start))
            }
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(0)
    }
}

//! Timestamp sources for recorded events.
//!
//! # Available counters
//!
//! Name (for [`Counter::by_name()`]) | Counter      | OSes | CPUs
//! --------------------------------- | -------      | ---- | ----
//! `wall-time`                       | [`WallTime`] | any  | any
//!
//! Timestamps are "ticks" relative to the moment the counter was created.
//! For `wall-time` one tick is one nanosecond. The consumer never interprets
//! ticks beyond ordering and subtraction, so other monotonic sources can be
//! added here without touching the wire format.

use std::error::Error;
use std::time::Instant;

pub enum Counter {
    WallTime(WallTime),
}

impl Counter {
    pub fn by_name(name: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(match name {
            WallTime::NAME => Counter::WallTime(WallTime::new()),
            _ => return Err(format!("{:?} is not a valid counter name", name).into()),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Counter::WallTime(_) => WallTime::NAME,
        }
    }

    #[inline]
    pub fn since_start(&self) -> u64 {
        match self {
            Counter::WallTime(counter) => counter.since_start(),
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::WallTime(WallTime::new())
    }
}

/// "Monotonic clock" with nanosecond precision (using [`std::time::Instant`]).
///
/// Can be obtained with `Counter::by_name("wall-time")`.
pub struct WallTime {
    start: Instant,
}

impl WallTime {
    const NAME: &'static str = "wall-time";

    pub fn new() -> Self {
        WallTime {
            start: Instant::now(),
        }
    }

    #[inline]
    fn since_start(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

impl Default for WallTime {
    fn default() -> Self {
        WallTime::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_time_is_monotonic() {
        let counter = Counter::by_name("wall-time").unwrap();
        let a = counter.since_start();
        let b = counter.since_start();
        assert!(b >= a);
        assert_eq!(counter.name(), "wall-time");
    }

    #[test]
    fn unknown_counter_is_rejected() {
        assert!(Counter::by_name("instructions:u").is_err());
    }
}

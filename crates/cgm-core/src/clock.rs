//! Wall-clock source for sample timestamps.

use std::fmt;
use std::time::Instant;

use time::{Duration, OffsetDateTime};

/// Source of the current time used to timestamp decoded frames.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that runs `speed` times faster than real time from its origin.
///
/// Used by accelerated simulations so that a frame per simulated minute
/// lands on a distinct minute.
#[derive(Debug, Clone)]
pub struct ScaledClock {
    origin: OffsetDateTime,
    started: Instant,
    speed: f64,
}

impl ScaledClock {
    /// Start at the current time. Non-finite or non-positive speeds run at 1x.
    pub fn new(speed: f64) -> Self {
        Self::starting_at(OffsetDateTime::now_utc(), speed)
    }

    pub fn starting_at(origin: OffsetDateTime, speed: f64) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        Self {
            origin,
            started: Instant::now(),
            speed,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> OffsetDateTime {
        let elapsed = self.started.elapsed().as_secs_f64() * self.speed;
        self.origin + Duration::seconds_f64(elapsed)
    }
}

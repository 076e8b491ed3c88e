//! Defines types for timing requests and emitting timing information.

use std::fmt::{self, Display, Formatter};
use std::time::Instant;

/// Timer struct used to record execution times of requests.
///
/// The `elapsed` function returns the elapsed time in an easy to format way,
/// suitable for request logging and the per-request scratch record.
#[derive(Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Begins measuring from the current instant.
    pub fn new() -> Timer {
        Timer {
            start: Instant::now(),
        }
    }

    /// Finishes measuring, and returns the elapsed time as a `Timing` value.
    pub fn elapsed(&self) -> Timing {
        let micros = self.start.elapsed().as_micros();
        if micros > i64::max_value() as u128 {
            Timing::Invalid
        } else {
            Timing::Microseconds(micros as i64)
        }
    }

    /// Retrieves the start instant of this timer.
    pub fn start_time(&self) -> Instant {
        self.start
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

/// Represents an elapsed time measured by `Timer`.
#[derive(Clone, Copy)]
pub enum Timing {
    /// A number of microseconds measured by `Timer`.
    Microseconds(i64),

    /// An invalid state, where the amount of time elapsed was unable to be measured.
    Invalid,
}

impl Display for Timing {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Timing::Microseconds(i) => {
                if i < 1000 {
                    write!(f, "{}µs", i)
                } else if i < 1_000_000 {
                    write!(f, "{:.2}ms", (i as f32) / 1000.0)
                } else {
                    write!(f, "{:.2}s", (i as f32) / 1_000_000.0)
                }
            }
            Timing::Invalid => f.write_str("invalid"),
        }
    }
}

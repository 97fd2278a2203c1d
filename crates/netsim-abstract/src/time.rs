//! Virtual time helpers.
//!
//! Simulation time is a plain count of microseconds since the simulator was
//! created. A link of `n` Mbps moves `n` bits per microsecond, which keeps
//! serialization arithmetic exact for the usual link speeds.

pub type SimTime = u64;

pub const MICROS_PER_MS: u64 = 1_000;
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Converts fractional milliseconds to [`SimTime`], rounding up so a
/// non-zero delay never collapses to zero.
pub fn from_millis_f64(ms: f64) -> SimTime {
    if ms <= 0.0 || !ms.is_finite() {
        return 0;
    }
    (ms * MICROS_PER_MS as f64).ceil() as SimTime
}

pub fn from_secs_f64(secs: f64) -> SimTime {
    from_millis_f64(secs * 1_000.0)
}

pub fn as_millis_f64(time: SimTime) -> f64 {
    time as f64 / MICROS_PER_MS as f64
}

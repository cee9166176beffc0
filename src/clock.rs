//! Operation Clock
//!
//! Wall-clock timestamps for operations, expressed as seconds since the
//! UNIX epoch with microsecond resolution. Within one process every call
//! to [`now`] returns a strictly larger value, so two distinct local
//! operations on the same file can never share an identifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch, microsecond resolution
pub type Timestamp = f64;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Last issued timestamp in microseconds
static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Current timestamp, strictly increasing within the process
pub fn now() -> Timestamp {
    from_micros(next_micros())
}

/// Convert a timestamp to whole microseconds
pub fn to_micros(ts: Timestamp) -> i64 {
    (ts * MICROS_PER_SEC).round() as i64
}

/// Convert whole microseconds to a timestamp
pub fn from_micros(micros: u64) -> Timestamp {
    micros as f64 / MICROS_PER_SEC
}

fn next_micros() -> u64 {
    loop {
        let current = wall_micros();
        let last = LAST_MICROS.load(Ordering::Relaxed);
        // Clock stalls or goes backwards: keep counting from the last value
        let next = if current > last { current } else { last + 1 };

        if LAST_MICROS
            .compare_exchange(last, next, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

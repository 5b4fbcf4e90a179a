use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Elapsed microseconds between two instants, saturating at zero.
#[inline]
pub fn elapsed_usecs(from: Instant, to: Instant) -> u64 {
    to.checked_duration_since(from)
        .unwrap_or(Duration::from_secs(0))
        .as_micros() as u64
}

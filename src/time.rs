//! Monotonic clock shared by deadlines and timestamps.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed on the crate's monotonic clock.
///
/// All message deadlines (`timeout_ns`, reply tracker deadlines) are
/// absolute values of this clock.
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Wall-clock nanoseconds, for timestamp metadata items.
pub fn realtime_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Convert an absolute monotonic deadline back into an [`Instant`].
pub(crate) fn ns_to_instant(ns: u64) -> Instant {
    *EPOCH + Duration::from_nanos(ns)
}

/// Absolute deadline a relative timeout from now.
pub fn deadline_after(timeout: Duration) -> u64 {
    monotonic_ns().saturating_add(timeout.as_nanos() as u64)
}

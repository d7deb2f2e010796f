//! Common time/period helpers for gazed_core.

/// Compute the period in microseconds for a given sampling rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (1_000_000u64 / u64::from(hz.max(1))).max(1)
}

/// Compute the period in milliseconds for a given sampling rate in Hz.
#[inline]
pub fn period_ms(hz: u32) -> u64 {
    (1000u64 / u64::from(hz.max(1))).max(1)
}

/// Wall-clock milliseconds since the Unix epoch. Used for export metadata
/// and filenames only; pipeline ordering always uses the monotonic clock.
pub fn wall_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_millis().min(u128::from(u64::MAX))) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_clamp_to_sane_values() {
        assert_eq!(period_us(0), 1_000_000);
        assert_eq!(period_us(120), 8_333);
        assert_eq!(period_ms(20), 50);
        assert_eq!(period_ms(2000), 1);
    }
}

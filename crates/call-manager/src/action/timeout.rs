//! Per-action timeout rules

use std::time::Duration;

/// Optional duration in milliseconds; zero means no timeout
pub fn optional_ms(duration_ms: Option<u64>) -> Option<Duration> {
    duration_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

/// Echo runs for its option duration or the configured default
pub fn echo_timeout(duration_ms: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(duration_ms.filter(|ms| *ms > 0).unwrap_or(default_ms))
}

/// Time needed to play `digit_count` DTMF tones
pub fn digits_send_timeout(digit_count: usize, duration_ms: u64, interval_ms: u64) -> Duration {
    if digit_count == 0 {
        return Duration::ZERO;
    }
    let count = digit_count as u64;
    Duration::from_millis(
        duration_ms
            .saturating_mul(count)
            .saturating_add(interval_ms.saturating_mul(count - 1)),
    )
}

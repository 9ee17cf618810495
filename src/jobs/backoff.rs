//! Poll backoff schedule

use std::time::Duration;

/// Delay before the next poll after `retry_count` consecutive failures:
/// `base * 2^retry_count`, never more than `cap`.
pub fn next_interval(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    2u32.checked_pow(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |interval| interval.min(cap))
}

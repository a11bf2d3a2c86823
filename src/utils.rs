//! Small shared helpers.

use std::time::Duration;

/// Upper bound for any computed backoff, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff in milliseconds: `base_ms * 2^(attempt - 1)`, capped.
///
/// `attempt` is 1-based; attempt 0 yields no delay.
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// Whole milliseconds in a duration, saturating.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

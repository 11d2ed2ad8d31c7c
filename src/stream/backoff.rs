//! Capped exponential backoff

use std::time::Duration;

/// Delay for reconnect attempt `attempt` (0-indexed): `min(base * 2^attempt, cap)`
pub fn retry_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

//! Reconnect delay schedules.

use fieldsync_core::{PresenceConfig, ReconnectConfig};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Delay before the transport session's `attempt`-th reconnect (1-based):
/// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`, plus jitter.
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled = config.initial_ms as f64 * config.multiplier.powi(exponent);
    let base = if scaled.is_finite() {
        (scaled as u64).min(config.max_ms)
    } else {
        config.max_ms
    };
    Duration::from_millis(jittered_backoff(base, config.jitter_ms))
}

/// Delay before presence-driven reconnect number `attempt` (0-based):
/// `min(2^attempt * base_ms, cap_ms)`.
pub fn presence_delay(config: &PresenceConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(factor.saturating_mul(config.base_ms).min(config.cap_ms))
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

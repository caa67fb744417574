//! Retry and idle-poll back-off schedules.

use std::time::Duration;

use rand::Rng;

/// Retry delay table; attempt k uses entry min(k-1, 4).
pub const RETRY_DELAYS_SECS: [u64; 5] = [1, 5, 15, 60, 300];

/// Uniform jitter added on top of the base delay, as a fraction of it.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before the next attempt after failed attempt `attempt` (1-indexed).
pub fn retry_delay(attempt: u32) -> chrono::Duration {
    let index = (attempt.saturating_sub(1) as usize).min(RETRY_DELAYS_SECS.len() - 1);
    let base_ms = RETRY_DELAYS_SECS[index] * 1_000;
    let max_jitter_ms = (base_ms as f64 * JITTER_FRACTION) as u64;
    let jitter_ms = if max_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter_ms)
    };
    chrono::Duration::milliseconds((base_ms + jitter_ms) as i64)
}

const IDLE_BACKOFF_START_MS: u64 = 50;

/// Sleep before the next poll after `consecutive_idle` empty acquires:
/// exponential from 50 ms, capped, plus a small jitter. No busy loop.
pub fn idle_backoff(consecutive_idle: u32, cap: Duration) -> Duration {
    let exp = consecutive_idle.min(16);
    let base_ms = IDLE_BACKOFF_START_MS
        .saturating_mul(1u64 << exp)
        .min(cap.as_millis() as u64);
    let jitter_ms = rand::thread_rng().gen_range(0..=(base_ms / 10).max(1));
    Duration::from_millis(base_ms + jitter_ms)
}

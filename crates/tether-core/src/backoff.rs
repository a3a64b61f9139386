//! Reconnect backoff.
//!
//! Formula: `min(max_delay, round((initial_delay + randomness * r) * multiplier^attempt))`
//! where `r` is uniform in `[0, 1)` and `attempt` counts the reconnects
//! scheduled since the last user-initiated connect.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::close_codes;

/// Default delay before the first reconnect, in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 10_000;
/// Default random extra delay range, in milliseconds.
pub const DEFAULT_RANDOMNESS_MS: u64 = 10_000;
/// Default growth factor per attempt.
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Default delay cap, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Automatic reconnect parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Base delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound of the random extra delay, in milliseconds.
    pub randomness_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            randomness_ms: DEFAULT_RANDOMNESS_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for `attempt` using a fresh random draw.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Delay for `attempt` with an explicit random draw in `[0, 1)`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base = self.initial_delay_ms as f64 + self.randomness_ms as f64 * random.clamp(0.0, 1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = (base * self.multiplier.powi(exponent)).round();
        let cap = self.max_delay_ms as f64;
        let ms = if scaled.is_finite() { scaled.min(cap) } else { cap };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Delay before reconnecting after a close with `code`, or `None` when
    /// the code forbids reconnecting.
    pub fn delay_for_close(&self, code: u16, attempt: u32) -> Option<Duration> {
        if close_codes::is_permanent(code) {
            return None;
        }
        if close_codes::reconnects_immediately(code) {
            return Some(Duration::ZERO);
        }
        Some(self.delay(attempt))
    }
}

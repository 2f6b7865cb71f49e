//! Webhook delivery scheduling.
//!
//! The delivery contract: the first retry waits at least the configured
//! base, no wait is ever shorter than the one before it, computed waits are
//! capped, 4xx (except 429) is never retried, 5xx/429 always is, and a
//! target's `Retry-After` can stretch a wait but never shrink it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Retry schedule for one delivery.
///
/// Attempt N draws its wait from the window `[base * 2^N, base * 2^(N+1)]`.
/// Window N+1 starts where window N ends, so the sequence of waits cannot
/// shrink no matter where in its window each draw lands, while the spread
/// still de-synchronizes deliveries that failed together.
#[derive(Clone, Debug)]
pub struct DeliverySchedule {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for DeliverySchedule {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl DeliverySchedule {
    /// Whether the delivery should be dead-lettered after `attempts_made`
    /// failed attempts.
    pub fn exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Wait before retrying attempt `attempt` (0-based), honoring a
    /// `Retry-After` wait requested by the target.
    ///
    /// Once a window's ceiling reaches `max_delay` the wait pins there
    /// exactly; drawing below the cap at that point could travel back
    /// under an earlier wait. A `Retry-After` value may exceed the cap -
    /// the target asked, and the value was already bounded at parse time.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let shift = (attempt + 1).min(20);
        let ceiling = self.base_delay.saturating_mul(1u32 << shift);
        let computed = if ceiling >= self.max_delay {
            self.max_delay
        } else {
            let floor = ceiling / 2;
            floor + (ceiling - floor).mul_f64(rand::thread_rng().gen::<f64>())
        };
        match retry_after {
            Some(requested) => computed.max(requested),
            None => computed,
        }
    }
}

/// Whether a delivery response status may be retried at all.
pub fn status_is_retryable(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Parse a `Retry-After` header value.
///
/// Both delta-seconds and HTTP-date forms are accepted; negative deltas are
/// rejected and past dates yield zero. The result is capped at `cap` so a
/// misbehaving target cannot stall a delivery queue for hours.
pub fn parse_retry_after(raw: &str, cap: Duration) -> Option<Duration> {
    let raw = raw.trim();

    if let Ok(secs) = raw.parse::<i64>() {
        if secs < 0 {
            return None;
        }
        return Some(Duration::from_secs(secs as u64).min(cap));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    let waited = delta.to_std().unwrap_or(Duration::ZERO);
    Some(waited.min(cap))
}

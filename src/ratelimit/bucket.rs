//! Token bucket state and the pure refill/consume step.

use serde::{Deserialize, Serialize};

use super::rules::{Algorithm, RateLimitConfig};

/// Token count and refill time stored per (principal, resource) key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_time_millis: i64,
}

impl BucketState {
    pub fn new(tokens: f64, last_refill_time_millis: i64) -> Self {
        Self {
            tokens,
            last_refill_time_millis,
        }
    }
}

/// Algorithm details attached to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMetadata {
    pub algorithm: Algorithm,
    /// Seconds for an empty bucket to refill completely
    pub window_duration_seconds: i64,
}

/// The outcome of an admission check or a status projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining_tokens: i64,
    /// Epoch milliseconds at which the bucket is next full
    pub reset_time_millis: i64,
    pub tier: String,
    pub message: String,
    pub metadata: DecisionMetadata,
}

impl Decision {
    /// HTTP status a boundary layer should answer with.
    pub fn http_status(&self) -> u16 {
        if self.allowed {
            200
        } else {
            429
        }
    }
}

/// Advance a bucket to `now_millis`, optionally consuming one token.
///
/// An absent state is a bucket that has never been seen and starts full.
/// Elapsed time is clamped at zero and the refill time never moves
/// backwards, so a clock that regresses neither removes tokens nor rewinds
/// the bucket.
pub fn advance(
    state: Option<BucketState>,
    config: &RateLimitConfig,
    now_millis: i64,
    consume: bool,
) -> (BucketState, Decision) {
    let capacity = config.capacity() as f64;

    let (mut tokens, last_refill) = match state {
        None => (capacity, now_millis),
        Some(state) => {
            let elapsed = now_millis.saturating_sub(state.last_refill_time_millis).max(0);
            let stored = clamp_tokens(state.tokens, capacity);
            let refilled = (stored + config.tokens_refilled(elapsed)).min(capacity);
            (refilled, state.last_refill_time_millis.max(now_millis))
        }
    };

    let allowed = tokens >= 1.0;
    if consume && allowed {
        tokens -= 1.0;
    }

    let reset_time_millis = last_refill.saturating_add(config.millis_to_refill(capacity - tokens));

    let message = match (consume, allowed) {
        (true, true) => "Request allowed",
        (true, false) => "Rate limit exceeded. Try again later.",
        (false, true) => "Quota available",
        (false, false) => "Quota exhausted",
    };

    let decision = Decision {
        allowed,
        remaining_tokens: tokens.floor() as i64,
        reset_time_millis,
        tier: config.tier.clone(),
        message: message.to_string(),
        metadata: DecisionMetadata {
            algorithm: config.algorithm,
            window_duration_seconds: (config.refill_window_millis() + 999) / 1000,
        },
    };

    (BucketState::new(tokens, last_refill), decision)
}

// Stored values come from a shared store and may predate a capacity change.
fn clamp_tokens(tokens: f64, capacity: f64) -> f64 {
    if tokens.is_nan() {
        0.0
    } else {
        tokens.clamp(0.0, capacity)
    }
}

//! Queue retry scheduling policy
//!
//! Encodes the backoff curve and the dead-letter promotion rule. The
//! lifecycle transitions themselves are database writes in `db::queue`;
//! this module decides *when* an item becomes ready again and *whether*
//! it gets another chance at all.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::config::Config;
use crate::models::CommandQueueItem;

/// Exponential backoff with jitter for a queue item's next retry.
///
/// `delay = clamp(base * 2^retry_count, max) + jitter`, with jitter drawn
/// uniformly from `[1, delay/10 + 1]` seconds so synchronized failures
/// don't retry in lockstep.
pub fn backoff_delay(config: &Config, retry_count: i64) -> Duration {
    let exponent = retry_count.clamp(0, 20) as u32;
    let delay_secs = config
        .base_retry_delay_secs
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(config.max_retry_delay_secs);

    let jitter_secs = rand::thread_rng().gen_range(1..=delay_secs / 10 + 1);

    Duration::seconds((delay_secs + jitter_secs) as i64)
}

/// The moment a failed item becomes claimable again
pub fn next_retry_at(config: &Config, retry_count: i64) -> DateTime<Utc> {
    Utc::now() + backoff_delay(config, retry_count)
}

/// Whether the item has used up its scheduler retries
pub fn retries_exhausted(config: &Config, item: &CommandQueueItem) -> bool {
    item.retry_count >= i64::from(config.max_retries)
}

/// Terminal diagnostic recorded when an item dead-letters on retry
/// exhaustion
pub fn max_retries_message(config: &Config, reason: &str) -> String {
    format!(
        "Max retry count ({}) exceeded: {}",
        config.max_retries, reason
    )
}

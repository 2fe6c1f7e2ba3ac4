//! OCC retry engine
//!
//! Wraps one unit of posting work. A stale lock_version write inside the
//! work is not an error to the caller — it means another writer got to an
//! account first — so the engine records the conflict on the command's
//! queue item, backs off linearly, and runs the work again against fresh
//! state. Anything other than the stale-row signal bubbles out untouched.

use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;

/// Typed result of an OCC-wrapped unit of work
#[derive(Debug)]
pub enum OccOutcome<T> {
    /// The work committed
    Ok(T),
    /// Every attempt hit a stale row; the queue item should move to
    /// occ_timeout and be retried by the scheduler later
    Timeout,
}

/// Run `work` up to `config.occ_max_retries` times.
///
/// Each attempt must be self-contained: read fresh state, compute, and
/// commit in its own database transaction. On a stale-row conflict the
/// engine appends a diagnostic to the queue item (outside the rolled-back
/// transaction), increments `occ_retry_count`, sleeps
/// `attempt x occ_base_interval_ms`, and tries again.
pub fn with_occ_retry<T>(
    db: &Database,
    config: &Config,
    queue_item_id: i64,
    mut work: impl FnMut() -> Result<T>,
) -> Result<OccOutcome<T>> {
    let max_retries = config.occ_max_retries.max(1);

    for attempt in 1..=max_retries {
        match work() {
            Ok(value) => return Ok(OccOutcome::Ok(value)),
            Err(err) if err.is_occ_conflict() => {
                let attempts_left = max_retries - attempt;
                let message = format!(
                    "OCC conflict detected on attempt {}: {} attempts left ({})",
                    attempt, attempts_left, err
                );
                warn!(queue_item_id, attempt, attempts_left, "OCC conflict");
                db.record_occ_conflict(queue_item_id, &message)?;

                std::thread::sleep(Duration::from_millis(
                    u64::from(attempt) * config.occ_base_interval_ms,
                ));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(OccOutcome::Timeout)
}

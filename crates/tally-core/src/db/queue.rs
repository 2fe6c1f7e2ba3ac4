//! Queue item lifecycle operations
//!
//! Status transitions are compare-and-set writes: the claim checks
//! `lock_version` and a claimable status, and the post-processing writes
//! are guarded on `status = 'processing'` so a swept or re-claimed item
//! cannot be overwritten by a processor that lost its claim.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::commands::{get_queue_item, QUEUE_ITEM_COLUMNS};
use super::{fmt_datetime, now_str, Database};
use crate::error::{Error, Result};
use crate::models::{CommandQueueItem, QueueError, QueueStatus};

impl Database {
    /// Claim a queue item for processing.
    ///
    /// Atomic compare-and-set on `(lock_version, claimable status)`.
    /// `retry_count` increments when claiming from a non-pending state;
    /// `occ_retry_count` resets for the fresh attempt. A miss means another
    /// processor claimed first and surfaces as [`Error::AlreadyClaimed`].
    pub fn claim_queue_item(
        &self,
        item: &CommandQueueItem,
        processor_id: &str,
        processor_version: &str,
    ) -> Result<CommandQueueItem> {
        let conn = self.conn()?;
        let retry_increment: i64 = if item.status == QueueStatus::Pending { 0 } else { 1 };
        let now = now_str();

        let affected = conn.execute(
            "UPDATE command_queue_items \
             SET status = 'processing', processor_id = ?, processor_version = ?, \
                 processing_started_at = ?, processing_completed_at = NULL, \
                 retry_count = retry_count + ?, occ_retry_count = 0, \
                 lock_version = lock_version + 1, updated_at = ? \
             WHERE id = ? AND lock_version = ? \
               AND status IN ('pending', 'failed', 'occ_timeout')",
            params![
                processor_id,
                processor_version,
                now,
                retry_increment,
                now,
                item.id,
                item.lock_version,
            ],
        )?;

        if affected == 0 {
            debug!(queue_item_id = item.id, processor_id, "claim lost");
            return Err(Error::AlreadyClaimed(item.id));
        }

        get_queue_item(&conn, item.id)?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", item.id)))
    }

    /// Record an OCC conflict against a claimed item.
    ///
    /// Runs in its own autocommit write so the diagnostic survives the
    /// rollback of the posting transaction that hit the conflict.
    pub fn record_occ_conflict(&self, queue_item_id: i64, message: &str) -> Result<()> {
        let conn = self.conn()?;
        let errors = prepend_error(&conn, queue_item_id, message)?;

        conn.execute(
            "UPDATE command_queue_items \
             SET occ_retry_count = occ_retry_count + 1, errors = ?, updated_at = ? \
             WHERE id = ?",
            params![errors, now_str(), queue_item_id],
        )?;

        Ok(())
    }

    /// Mark a processing item failed with a scheduled retry
    pub fn mark_failed(
        &self,
        queue_item_id: i64,
        message: &str,
        next_retry_after: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let errors = prepend_error(&conn, queue_item_id, message)?;

        let affected = conn.execute(
            "UPDATE command_queue_items \
             SET status = 'failed', errors = ?, next_retry_after = ?, \
                 processing_completed_at = ?, lock_version = lock_version + 1, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
            params![
                errors,
                fmt_datetime(next_retry_after),
                now_str(),
                now_str(),
                queue_item_id
            ],
        )?;

        if affected == 0 {
            warn!(queue_item_id, "mark_failed skipped: item no longer processing");
        }
        Ok(())
    }

    /// Mark a processing item occ_timeout with a scheduled retry
    pub fn mark_occ_timeout(
        &self,
        queue_item_id: i64,
        message: &str,
        next_retry_after: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let errors = prepend_error(&conn, queue_item_id, message)?;

        let affected = conn.execute(
            "UPDATE command_queue_items \
             SET status = 'occ_timeout', errors = ?, next_retry_after = ?, \
                 processing_completed_at = ?, lock_version = lock_version + 1, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
            params![
                errors,
                fmt_datetime(next_retry_after),
                now_str(),
                now_str(),
                queue_item_id
            ],
        )?;

        if affected == 0 {
            warn!(queue_item_id, "mark_occ_timeout skipped: item no longer processing");
        }
        Ok(())
    }

    /// Dead-letter a processing item; terminal, never retried
    pub fn mark_dead_letter(&self, queue_item_id: i64, message: &str) -> Result<()> {
        let conn = self.conn()?;
        let errors = prepend_error(&conn, queue_item_id, message)?;

        let affected = conn.execute(
            "UPDATE command_queue_items \
             SET status = 'dead_letter', errors = ?, next_retry_after = NULL, \
                 processing_completed_at = ?, lock_version = lock_version + 1, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
            params![errors, now_str(), now_str(), queue_item_id],
        )?;

        if affected == 0 {
            warn!(queue_item_id, "mark_dead_letter skipped: item no longer processing");
        }
        Ok(())
    }

    /// Put a processing item back to pending with a deferral.
    ///
    /// Used when an update command must wait for its create command.
    pub fn revert_to_pending(
        &self,
        queue_item_id: i64,
        message: &str,
        next_retry_after: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let errors = prepend_error(&conn, queue_item_id, message)?;

        let affected = conn.execute(
            "UPDATE command_queue_items \
             SET status = 'pending', errors = ?, next_retry_after = ?, \
                 lock_version = lock_version + 1, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
            params![
                errors,
                fmt_datetime(next_retry_after),
                now_str(),
                queue_item_id
            ],
        )?;

        if affected == 0 {
            warn!(queue_item_id, "revert_to_pending skipped: item no longer processing");
        }
        Ok(())
    }

    /// Revert queue items stuck in `processing` longer than `threshold`
    /// back to `pending`, appending a diagnostic to each. Returns how many
    /// items were reverted.
    pub fn sweep_stalled(&self, threshold: Duration) -> Result<usize> {
        let conn = self.conn()?;
        let cutoff = fmt_datetime(Utc::now() - threshold);

        let stalled: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM command_queue_items \
                 WHERE status = 'processing' AND processing_completed_at IS NULL \
                   AND processing_started_at < ?",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for id in &stalled {
            let message = format!(
                "Processing stalled beyond {} seconds; reverted to pending",
                threshold.num_seconds()
            );
            let errors = prepend_error(&conn, *id, &message)?;
            conn.execute(
                "UPDATE command_queue_items \
                 SET status = 'pending', errors = ?, processing_started_at = NULL, \
                     lock_version = lock_version + 1, updated_at = ? \
                 WHERE id = ? AND status = 'processing'",
                params![errors, now_str(), id],
            )?;
            warn!(queue_item_id = id, "stalled queue item reverted to pending");
        }

        Ok(stalled.len())
    }

    /// List every queue item (test and tooling support)
    pub fn list_queue_items(&self) -> Result<Vec<CommandQueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM command_queue_items ORDER BY id",
            QUEUE_ITEM_COLUMNS
        ))?;

        let items = stmt
            .query_map([], super::commands::row_to_queue_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(items)
    }
}

/// Mark a claimed item processed inside the posting transaction so success
/// and its effects commit together.
pub(crate) fn mark_processed(conn: &Connection, queue_item_id: i64) -> Result<()> {
    let affected = conn.execute(
        "UPDATE command_queue_items \
         SET status = 'processed', processing_completed_at = ?, next_retry_after = NULL, \
             lock_version = lock_version + 1, updated_at = ? \
         WHERE id = ? AND status = 'processing'",
        params![now_str(), now_str(), queue_item_id],
    )?;

    if affected == 0 {
        return Err(Error::AlreadyClaimed(queue_item_id));
    }
    Ok(())
}

/// Prepend a diagnostic to the item's error list (most recent first) and
/// return the serialized list
fn prepend_error(conn: &Connection, queue_item_id: i64, message: &str) -> Result<String> {
    let current: String = conn.query_row(
        "SELECT errors FROM command_queue_items WHERE id = ?",
        params![queue_item_id],
        |row| row.get(0),
    )?;

    let mut errors: Vec<QueueError> = serde_json::from_str(&current).unwrap_or_default();
    errors.insert(
        0,
        QueueError {
            message: message.to_string(),
            inserted_at: Utc::now(),
        },
    );

    Ok(serde_json::to_string(&errors)?)
}

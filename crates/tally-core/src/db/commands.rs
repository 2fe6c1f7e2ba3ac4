//! Command log operations
//!
//! A command, its queue item, and its idempotency key are inserted in one
//! write-locked transaction; the idempotency key refuses duplicates before
//! any new state is created.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{now_str, parse_datetime, parse_datetime_opt, with_immediate_tx, Database};
use crate::command::CommandMap;
use crate::error::{Error, Result};
use crate::models::{Command, CommandQueueItem, QueueStatus};

impl Database {
    /// Atomically insert a command, its pending queue item, and its
    /// idempotency key.
    ///
    /// A prior submission with the same `(instance, action, source,
    /// source_idempk[, update_idempk])` aborts the insert and surfaces the
    /// existing command's identity as [`Error::Duplicate`].
    pub fn insert_command(
        &self,
        instance_id: i64,
        map: &CommandMap,
    ) -> Result<(Command, CommandQueueItem)> {
        let conn = self.conn()?;
        let key_hash = map.idempotency_hash();
        let command_map = map.to_value()?.to_string();

        let command_id = with_immediate_tx(&conn, |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT command_id FROM idempotency_keys WHERE instance_id = ? AND key_hash = ?",
                    params![instance_id, key_hash],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                debug!(
                    instance_id,
                    existing_id, "duplicate command submission refused"
                );
                return Err(Error::Duplicate(existing_id));
            }

            let now = now_str();
            conn.execute(
                "INSERT INTO commands (instance_id, command_map, inserted_at) VALUES (?, ?, ?)",
                params![instance_id, command_map, now],
            )?;
            let command_id = conn.last_insert_rowid();

            conn.execute(
                "INSERT INTO command_queue_items (command_id, status, inserted_at, updated_at) \
                 VALUES (?, 'pending', ?, ?)",
                params![command_id, now, now],
            )?;

            conn.execute(
                "INSERT INTO idempotency_keys (instance_id, key_hash, command_id, inserted_at) \
                 VALUES (?, ?, ?, ?)",
                params![instance_id, key_hash, command_id, now],
            )?;

            Ok(command_id)
        })?;

        let command = self
            .get_command(command_id)?
            .ok_or_else(|| Error::NotFound(format!("command {}", command_id)))?;
        let queue_item = self
            .get_queue_item_for_command(command_id)?
            .ok_or_else(|| Error::NotFound(format!("queue item for command {}", command_id)))?;

        Ok((command, queue_item))
    }

    /// Get a command by ID
    pub fn get_command(&self, id: i64) -> Result<Option<Command>> {
        let conn = self.conn()?;
        get_command(&conn, id)
    }

    /// Get the queue item that tracks a command's lifecycle
    pub fn get_queue_item_for_command(&self, command_id: i64) -> Result<Option<CommandQueueItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!(
                    "SELECT {} FROM command_queue_items WHERE command_id = ?",
                    QUEUE_ITEM_COLUMNS
                ),
                params![command_id],
                row_to_queue_item,
            )
            .optional()?;

        Ok(item)
    }

    /// Get a queue item by ID
    pub fn get_queue_item(&self, id: i64) -> Result<Option<CommandQueueItem>> {
        let conn = self.conn()?;
        get_queue_item(&conn, id)
    }

    /// The oldest ready command for an instance, if any.
    ///
    /// Ready means claimable status and no deferral still in the future.
    /// Ordering is by command insertion so an instance's log replays in
    /// submission order.
    pub fn next_ready_command(
        &self,
        instance_id: i64,
    ) -> Result<Option<(Command, CommandQueueItem)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT c.id, q.id FROM commands c \
                 JOIN command_queue_items q ON q.command_id = c.id \
                 WHERE c.instance_id = ? \
                   AND q.status IN ('pending', 'failed', 'occ_timeout') \
                   AND (q.next_retry_after IS NULL OR q.next_retry_after <= ?) \
                 ORDER BY c.inserted_at ASC, c.id ASC \
                 LIMIT 1",
                params![instance_id, now_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((command_id, queue_item_id)) = row else {
            return Ok(None);
        };

        let command = get_command(&conn, command_id)?
            .ok_or_else(|| Error::NotFound(format!("command {}", command_id)))?;
        let queue_item = get_queue_item(&conn, queue_item_id)?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", queue_item_id)))?;

        Ok(Some((command, queue_item)))
    }

    /// Distinct instances with at least one ready queue item
    pub fn instances_with_ready_work(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.instance_id FROM commands c \
             JOIN command_queue_items q ON q.command_id = c.id \
             WHERE q.status IN ('pending', 'failed', 'occ_timeout') \
               AND (q.next_retry_after IS NULL OR q.next_retry_after <= ?) \
             ORDER BY c.instance_id",
        )?;

        let ids = stmt
            .query_map(params![now_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;

        Ok(ids)
    }

    /// Count of ready queue items for an instance
    pub fn ready_count(&self, instance_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM commands c \
             JOIN command_queue_items q ON q.command_id = c.id \
             WHERE c.instance_id = ? \
               AND q.status IN ('pending', 'failed', 'occ_timeout') \
               AND (q.next_retry_after IS NULL OR q.next_retry_after <= ?)",
            params![instance_id, now_str()],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// Resolve an idempotency key hash to the command it identifies
    pub fn find_command_by_idempotency(
        &self,
        instance_id: i64,
        key_hash: &str,
    ) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let command_id = conn
            .query_row(
                "SELECT command_id FROM idempotency_keys WHERE instance_id = ? AND key_hash = ?",
                params![instance_id, key_hash],
                |row| row.get(0),
            )
            .optional()?;

        Ok(command_id)
    }

    /// List queue items in a given status, oldest first (operational
    /// tooling; the dead-letter scan in particular)
    pub fn list_queue_items_by_status(
        &self,
        status: QueueStatus,
    ) -> Result<Vec<CommandQueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM command_queue_items WHERE status = ? ORDER BY inserted_at, id",
            QUEUE_ITEM_COLUMNS
        ))?;

        let items = stmt
            .query_map(params![status.as_str()], row_to_queue_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(items)
    }
}

pub(crate) const QUEUE_ITEM_COLUMNS: &str =
    "id, command_id, status, processor_id, processor_version, processing_started_at, \
     processing_completed_at, retry_count, occ_retry_count, next_retry_after, errors, \
     lock_version, inserted_at, updated_at";

pub(crate) fn get_command(conn: &Connection, id: i64) -> Result<Option<Command>> {
    let command = conn
        .query_row(
            "SELECT id, instance_id, command_map, inserted_at FROM commands WHERE id = ?",
            params![id],
            row_to_command,
        )
        .optional()?;

    Ok(command)
}

pub(crate) fn get_queue_item(conn: &Connection, id: i64) -> Result<Option<CommandQueueItem>> {
    let item = conn
        .query_row(
            &format!(
                "SELECT {} FROM command_queue_items WHERE id = ?",
                QUEUE_ITEM_COLUMNS
            ),
            params![id],
            row_to_queue_item,
        )
        .optional()?;

    Ok(item)
}

fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let map_str: String = row.get(2)?;
    let inserted_at: String = row.get(3)?;

    Ok(Command {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        command_map: serde_json::from_str(&map_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        inserted_at: parse_datetime(&inserted_at),
    })
}

pub(crate) fn row_to_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandQueueItem> {
    let status_str: String = row.get(2)?;
    let processing_started_at: Option<String> = row.get(5)?;
    let processing_completed_at: Option<String> = row.get(6)?;
    let next_retry_after: Option<String> = row.get(9)?;
    let errors_str: String = row.get(10)?;
    let inserted_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(CommandQueueItem {
        id: row.get(0)?,
        command_id: row.get(1)?,
        status: status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        processor_id: row.get(3)?,
        processor_version: row.get(4)?,
        processing_started_at: parse_datetime_opt(processing_started_at),
        processing_completed_at: parse_datetime_opt(processing_completed_at),
        retry_count: row.get(7)?,
        occ_retry_count: row.get(8)?,
        next_retry_after: parse_datetime_opt(next_retry_after),
        errors: serde_json::from_str(&errors_str).unwrap_or_default(),
        lock_version: row.get(11)?,
        inserted_at: parse_datetime(&inserted_at),
        updated_at: parse_datetime(&updated_at),
    })
}

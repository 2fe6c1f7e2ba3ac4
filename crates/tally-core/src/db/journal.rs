//! Journal event, link row, and pending-transaction lookup operations

use rusqlite::{params, Connection, OptionalExtension};

use super::{now_str, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{JournalEvent, PendingTransactionLookup};

impl Database {
    /// List an instance's journal events, oldest first
    pub fn list_journal_events(&self, instance_id: i64) -> Result<Vec<JournalEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, command_map, inserted_at FROM journal_events \
             WHERE instance_id = ? ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![instance_id], row_to_journal_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// The journal event emitted for a command, if it has succeeded
    pub fn journal_event_for_command(&self, command_id: i64) -> Result<Option<JournalEvent>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                "SELECT j.id, j.instance_id, j.command_map, j.inserted_at \
                 FROM journal_events j \
                 JOIN journal_event_command_links l ON l.journal_event_id = j.id \
                 WHERE l.command_id = ?",
                params![command_id],
                row_to_journal_event,
            )
            .optional()?;

        Ok(event)
    }

    /// Journal events linked to a transaction, oldest first
    pub fn journal_events_for_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<JournalEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT j.id, j.instance_id, j.command_map, j.inserted_at \
             FROM journal_events j \
             JOIN journal_event_transaction_links l ON l.journal_event_id = j.id \
             WHERE l.transaction_id = ? ORDER BY j.id",
        )?;

        let events = stmt
            .query_map(params![transaction_id], row_to_journal_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Resolve a pending-transaction lookup key
    pub fn get_pending_lookup(
        &self,
        instance_id: i64,
        source: &str,
        source_idempk: &str,
    ) -> Result<Option<PendingTransactionLookup>> {
        let conn = self.conn()?;
        get_pending_lookup(&conn, instance_id, source, source_idempk)
    }
}

/// Insert the immutable journal event and its command link
pub(crate) fn insert_journal_event(
    conn: &Connection,
    instance_id: i64,
    command_id: i64,
    command_map: &serde_json::Value,
) -> Result<JournalEvent> {
    let now = now_str();

    conn.execute(
        "INSERT INTO journal_events (instance_id, command_map, inserted_at) VALUES (?, ?, ?)",
        params![instance_id, command_map.to_string(), now],
    )?;
    let journal_event_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO journal_event_command_links (journal_event_id, command_id) VALUES (?, ?)",
        params![journal_event_id, command_id],
    )?;

    conn.query_row(
        "SELECT id, instance_id, command_map, inserted_at FROM journal_events WHERE id = ?",
        params![journal_event_id],
        row_to_journal_event,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("journal event {}", journal_event_id)))
}

pub(crate) fn link_transaction(
    conn: &Connection,
    journal_event_id: i64,
    transaction_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO journal_event_transaction_links (journal_event_id, transaction_id) \
         VALUES (?, ?)",
        params![journal_event_id, transaction_id],
    )?;
    Ok(())
}

pub(crate) fn link_account(
    conn: &Connection,
    journal_event_id: i64,
    account_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO journal_event_account_links (journal_event_id, account_id) VALUES (?, ?)",
        params![journal_event_id, account_id],
    )?;
    Ok(())
}

/// Record where a pending transaction can be found by later updates
pub(crate) fn insert_pending_lookup(
    conn: &Connection,
    lookup: &PendingTransactionLookup,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_transaction_lookup \
         (instance_id, source, source_idempk, command_id, transaction_id, journal_event_id) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            lookup.instance_id,
            lookup.source,
            lookup.source_idempk,
            lookup.command_id,
            lookup.transaction_id,
            lookup.journal_event_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_pending_lookup(
    conn: &Connection,
    instance_id: i64,
    source: &str,
    source_idempk: &str,
) -> Result<Option<PendingTransactionLookup>> {
    let lookup = conn
        .query_row(
            "SELECT instance_id, source, source_idempk, command_id, transaction_id, \
             journal_event_id \
             FROM pending_transaction_lookup \
             WHERE instance_id = ? AND source = ? AND source_idempk = ?",
            params![instance_id, source, source_idempk],
            |row| {
                Ok(PendingTransactionLookup {
                    instance_id: row.get(0)?,
                    source: row.get(1)?,
                    source_idempk: row.get(2)?,
                    command_id: row.get(3)?,
                    transaction_id: row.get(4)?,
                    journal_event_id: row.get(5)?,
                })
            },
        )
        .optional()?;

    Ok(lookup)
}

/// Remove the lookup once its transaction has left the pending state
pub(crate) fn clear_pending_lookup(
    conn: &Connection,
    instance_id: i64,
    source: &str,
    source_idempk: &str,
) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_transaction_lookup \
         WHERE instance_id = ? AND source = ? AND source_idempk = ?",
        params![instance_id, source, source_idempk],
    )?;
    Ok(())
}

fn row_to_journal_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEvent> {
    let map_str: String = row.get(2)?;
    let inserted_at: String = row.get(3)?;

    Ok(JournalEvent {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        command_map: serde_json::from_str(&map_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        inserted_at: parse_datetime(&inserted_at),
    })
}

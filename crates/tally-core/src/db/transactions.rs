//! Transaction, entry, and balance history operations

use rusqlite::{params, Connection, OptionalExtension};

use super::{fmt_datetime, now_str, parse_datetime, parse_datetime_opt, Database};
use crate::error::{Error, Result};
use crate::models::{
    Balance, BalanceHistoryEntry, Entry, EntryType, Transaction, TransactionStatus,
};

impl Database {
    /// Get a transaction by ID
    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        get_transaction(&conn, id)
    }

    /// List a transaction's entries in insertion order
    pub fn list_entries(&self, transaction_id: i64) -> Result<Vec<Entry>> {
        let conn = self.conn()?;
        list_entries(&conn, transaction_id)
    }

    /// List an account's balance history, oldest first
    pub fn list_balance_history(&self, account_id: i64) -> Result<Vec<BalanceHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, entry_id, posted_amount, posted_debit, posted_credit, \
             pending_amount, pending_debit, pending_credit, available, inserted_at \
             FROM balance_history_entries WHERE account_id = ? ORDER BY id",
        )?;

        let history = stmt
            .query_map(params![account_id], row_to_history)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(history)
    }
}

pub(crate) fn get_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    let transaction = conn
        .query_row(
            "SELECT id, instance_id, status, posted_at, inserted_at, updated_at \
             FROM transactions WHERE id = ?",
            params![id],
            row_to_transaction,
        )
        .optional()?;

    Ok(transaction)
}

pub(crate) fn insert_transaction(
    conn: &Connection,
    instance_id: i64,
    status: TransactionStatus,
    posted_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<Transaction> {
    let now = now_str();

    conn.execute(
        "INSERT INTO transactions (instance_id, status, posted_at, inserted_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
        params![
            instance_id,
            status.as_str(),
            posted_at.map(fmt_datetime),
            now,
            now
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_transaction(conn, id)?.ok_or_else(|| Error::NotFound(format!("transaction {}", id)))
}

/// Move a transaction to a new status, guarded by its current status.
///
/// The guard makes terminal-state immutability a database fact: a write
/// that matches zero rows means the transaction was not in the expected
/// state and the transition is refused.
pub(crate) fn set_transaction_status(
    conn: &Connection,
    id: i64,
    expected: TransactionStatus,
    next: TransactionStatus,
    posted_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    let affected = conn.execute(
        "UPDATE transactions SET status = ?, posted_at = COALESCE(?, posted_at), updated_at = ? \
         WHERE id = ? AND status = ?",
        params![
            next.as_str(),
            posted_at.map(fmt_datetime),
            now_str(),
            id,
            expected.as_str()
        ],
    )?;

    if affected == 0 {
        return Err(Error::InvalidTransition(format!(
            "transaction {} is not {}; cannot move to {}",
            id, expected, next
        )));
    }

    Ok(())
}

pub(crate) fn insert_entry(
    conn: &Connection,
    transaction_id: i64,
    account_id: i64,
    entry_type: EntryType,
    amount: i64,
    currency: &str,
) -> Result<Entry> {
    conn.execute(
        "INSERT INTO entries (transaction_id, account_id, entry_type, amount, currency, inserted_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            transaction_id,
            account_id,
            entry_type.as_str(),
            amount,
            currency,
            now_str()
        ],
    )?;

    let id = conn.last_insert_rowid();
    let entry = conn.query_row(
        "SELECT id, transaction_id, account_id, entry_type, amount, currency, inserted_at \
         FROM entries WHERE id = ?",
        params![id],
        row_to_entry,
    )?;

    Ok(entry)
}

/// Rewrite an entry's value in place (pending-transaction edit)
pub(crate) fn update_entry_value(
    conn: &Connection,
    entry_id: i64,
    entry_type: EntryType,
    amount: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE entries SET entry_type = ?, amount = ? WHERE id = ?",
        params![entry_type.as_str(), amount, entry_id],
    )?;
    Ok(())
}

pub(crate) fn list_entries(conn: &Connection, transaction_id: i64) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(
        "SELECT id, transaction_id, account_id, entry_type, amount, currency, inserted_at \
         FROM entries WHERE transaction_id = ? ORDER BY id",
    )?;

    let entries = stmt
        .query_map(params![transaction_id], row_to_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Append a balance snapshot for an account immediately after an entry
/// was applied to it
pub(crate) fn insert_balance_history(
    conn: &Connection,
    account_id: i64,
    entry_id: i64,
    posted: &Balance,
    pending: &Balance,
    available: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO balance_history_entries \
         (account_id, entry_id, posted_amount, posted_debit, posted_credit, \
          pending_amount, pending_debit, pending_credit, available, inserted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            account_id,
            entry_id,
            posted.amount,
            posted.debit,
            posted.credit,
            pending.amount,
            pending.debit,
            pending.credit,
            available,
            now_str()
        ],
    )?;

    Ok(())
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let status_str: String = row.get(2)?;
    let posted_at: Option<String> = row.get(3)?;
    let inserted_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Transaction {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        status: status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        posted_at: parse_datetime_opt(posted_at),
        inserted_at: parse_datetime(&inserted_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let type_str: String = row.get(3)?;
    let inserted_at: String = row.get(6)?;

    Ok(Entry {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        account_id: row.get(2)?,
        entry_type: type_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        inserted_at: parse_datetime(&inserted_at),
    })
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceHistoryEntry> {
    let inserted_at: String = row.get(10)?;

    Ok(BalanceHistoryEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        entry_id: row.get(2)?,
        posted: Balance {
            amount: row.get(3)?,
            debit: row.get(4)?,
            credit: row.get(5)?,
        },
        pending: Balance {
            amount: row.get(6)?,
            debit: row.get(7)?,
            credit: row.get(8)?,
        },
        available: row.get(9)?,
        inserted_at: parse_datetime(&inserted_at),
    })
}

//! Account operations
//!
//! Balance writes are guarded by `lock_version`: updates carry the version
//! they were computed from, and a write that matches zero rows surfaces as
//! a stale-version error for the OCC retry engine.

use rusqlite::{params, Connection, OptionalExtension};

use super::{now_str, parse_datetime, Database};
use crate::command::AccountData;
use crate::error::{Error, Result};
use crate::models::{Account, Balance};

impl Database {
    /// Get an account by ID
    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        get_account(&conn, id)
    }

    /// Get an account by its per-instance address
    pub fn get_account_by_address(
        &self,
        instance_id: i64,
        address: &str,
    ) -> Result<Option<Account>> {
        let conn = self.conn()?;
        find_account_by_address(&conn, instance_id, address)
    }

    /// List all accounts in an instance
    pub fn list_accounts(&self, instance_id: i64) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts WHERE instance_id = ? ORDER BY address",
            ACCOUNT_COLUMNS
        ))?;

        let accounts = stmt
            .query_map(params![instance_id], row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(accounts)
    }
}

const ACCOUNT_COLUMNS: &str = "id, instance_id, address, name, description, type, normal_balance, \
     currency, allowed_negative, posted_amount, posted_debit, posted_credit, \
     pending_amount, pending_debit, pending_credit, available, context, \
     lock_version, inserted_at, updated_at";

pub(crate) fn get_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
            params![id],
            row_to_account,
        )
        .optional()?;

    Ok(account)
}

pub(crate) fn find_account_by_address(
    conn: &Connection,
    instance_id: i64,
    address: &str,
) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!(
                "SELECT {} FROM accounts WHERE instance_id = ? AND address = ?",
                ACCOUNT_COLUMNS
            ),
            params![instance_id, address],
            row_to_account,
        )
        .optional()?;

    Ok(account)
}

/// Insert a new account from a validated payload and return it.
///
/// `normal_balance` falls back to the convention for the account type when
/// the payload does not override it.
pub(crate) fn insert_account(
    conn: &Connection,
    instance_id: i64,
    data: &AccountData,
) -> Result<Account> {
    let now = now_str();
    let normal_balance = data
        .normal_balance
        .unwrap_or_else(|| data.account_type.normal_balance());

    conn.execute(
        r#"
        INSERT INTO accounts (instance_id, address, name, description, type, normal_balance,
                              currency, allowed_negative, context, inserted_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            instance_id,
            data.address,
            data.name,
            data.description,
            data.account_type.as_str(),
            normal_balance.as_str(),
            data.currency,
            data.allowed_negative.unwrap_or(false),
            data.context.as_ref().map(|c| c.to_string()),
            now,
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_account(conn, id)?.ok_or_else(|| Error::NotFound(format!("account {}", id)))
}

/// Update an account's mutable fields with a lock_version compare-and-set
pub(crate) fn update_account_fields(
    conn: &Connection,
    account: &Account,
    name: Option<&str>,
    description: Option<&str>,
    allowed_negative: Option<bool>,
    context: Option<&serde_json::Value>,
) -> Result<()> {
    let affected = conn.execute(
        r#"
        UPDATE accounts
        SET name = COALESCE(?, name),
            description = COALESCE(?, description),
            allowed_negative = COALESCE(?, allowed_negative),
            context = COALESCE(?, context),
            lock_version = lock_version + 1,
            updated_at = ?
        WHERE id = ? AND lock_version = ?
        "#,
        params![
            name,
            description,
            allowed_negative,
            context.map(|c| c.to_string()),
            now_str(),
            account.id,
            account.lock_version,
        ],
    )?;

    if affected == 0 {
        return Err(Error::StaleVersion(format!(
            "account {} lock_version {}",
            account.id, account.lock_version
        )));
    }

    Ok(())
}

/// Write new balances for an account, guarded by the lock_version the
/// balances were computed from. Zero rows affected means another writer
/// got there first.
pub(crate) fn update_account_balances(
    conn: &Connection,
    account_id: i64,
    expected_lock_version: i64,
    posted: &Balance,
    pending: &Balance,
    available: i64,
) -> Result<()> {
    let affected = conn.execute(
        r#"
        UPDATE accounts
        SET posted_amount = ?, posted_debit = ?, posted_credit = ?,
            pending_amount = ?, pending_debit = ?, pending_credit = ?,
            available = ?,
            lock_version = lock_version + 1,
            updated_at = ?
        WHERE id = ? AND lock_version = ?
        "#,
        params![
            posted.amount,
            posted.debit,
            posted.credit,
            pending.amount,
            pending.debit,
            pending.credit,
            available,
            now_str(),
            account_id,
            expected_lock_version,
        ],
    )?;

    if affected == 0 {
        return Err(Error::StaleVersion(format!(
            "account {} lock_version {}",
            account_id, expected_lock_version
        )));
    }

    Ok(())
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let type_str: String = row.get(5)?;
    let normal_str: String = row.get(6)?;
    let context_str: Option<String> = row.get(16)?;
    let inserted_at: String = row.get(18)?;
    let updated_at: String = row.get(19)?;

    Ok(Account {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        address: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        account_type: type_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        normal_balance: normal_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        currency: row.get(7)?,
        allowed_negative: row.get(8)?,
        posted: Balance {
            amount: row.get(9)?,
            debit: row.get(10)?,
            credit: row.get(11)?,
        },
        pending: Balance {
            amount: row.get(12)?,
            debit: row.get(13)?,
            credit: row.get(14)?,
        },
        available: row.get(15)?,
        context: context_str.and_then(|s| serde_json::from_str(&s).ok()),
        lock_version: row.get(17)?,
        inserted_at: parse_datetime(&inserted_at),
        updated_at: parse_datetime(&updated_at),
    })
}

//! Instance operations

use rusqlite::{params, OptionalExtension};

use super::{now_str, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::Instance;

impl Database {
    /// Create a ledger instance
    pub fn create_instance(
        &self,
        address: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<Instance> {
        let conn = self.conn()?;
        let now = now_str();

        conn.execute(
            "INSERT INTO instances (address, config, inserted_at, updated_at) VALUES (?, ?, ?, ?)",
            params![
                address,
                config.map(|c| c.to_string()),
                now,
                now
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.get_instance(id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))
    }

    /// Get an instance by ID
    pub fn get_instance(&self, id: i64) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let instance = conn
            .query_row(
                "SELECT id, address, config, inserted_at, updated_at FROM instances WHERE id = ?",
                params![id],
                row_to_instance,
            )
            .optional()?;

        Ok(instance)
    }

    /// Get an instance by its unique address
    pub fn get_instance_by_address(&self, address: &str) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let instance = conn
            .query_row(
                "SELECT id, address, config, inserted_at, updated_at FROM instances WHERE address = ?",
                params![address],
                row_to_instance,
            )
            .optional()?;

        Ok(instance)
    }

    /// Delete an instance.
    ///
    /// Refused while any account or transaction still references it.
    pub fn delete_instance(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;

        let accounts: i64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE instance_id = ?",
            params![id],
            |row| row.get(0),
        )?;
        let transactions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE instance_id = ?",
            params![id],
            |row| row.get(0),
        )?;

        if accounts > 0 || transactions > 0 {
            return Err(Error::InstanceInUse(format!(
                "instance {} has {} accounts and {} transactions",
                id, accounts, transactions
            )));
        }

        conn.execute("DELETE FROM instances WHERE id = ?", params![id])?;
        Ok(())
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
    let config_str: Option<String> = row.get(2)?;
    let inserted_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(Instance {
        id: row.get(0)?,
        address: row.get(1)?,
        config: config_str.and_then(|s| serde_json::from_str(&s).ok()),
        inserted_at: parse_datetime(&inserted_at),
        updated_at: parse_datetime(&updated_at),
    })
}

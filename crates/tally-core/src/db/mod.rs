//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `instances` - Ledger tenant operations
//! - `accounts` - Account rows and lock_version-guarded balance updates
//! - `transactions` - Transactions, entries, balance history
//! - `commands` - Command + queue item + idempotency key inserts, readiness queries
//! - `queue` - Queue item lifecycle (claim, transitions, error log, stall sweep)
//! - `journal` - Journal events, link rows, pending-transaction lookup

use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::info;

use crate::config::Config;
use crate::error::Result;

pub(crate) mod accounts;
pub(crate) mod commands;
mod instances;
pub(crate) mod journal;
pub(crate) mod queue;
pub(crate) mod transactions;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Datetime storage format. Millisecond precision keeps retry scheduling
/// comparisons meaningful; the format sorts lexicographically.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Format a DateTime<Utc> for storage
pub(crate) fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// The current time in storage format
pub(crate) fn now_str() -> String {
    fmt_datetime(Utc::now())
}

/// Run a closure inside an immediate (write-locked) transaction.
///
/// The write lock is taken up front so that every statement in the unit
/// either commits together or rolls back together.
pub(crate) fn with_immediate_tx<T>(
    conn: &Connection,
    work: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match work(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open (or create) the ledger store at `path`.
    ///
    /// SQLite has no in-database schemas, so a non-empty
    /// `config.schema_prefix` namespaces the on-disk file instead: the
    /// prefix is prepended to the file name.
    pub fn open(path: &str, config: &Config) -> Result<Self> {
        let db_path = if config.schema_prefix.is_empty() {
            path.to_string()
        } else {
            let path = Path::new(path);
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            path.with_file_name(format!("{}_{}", config.schema_prefix, file_name))
                .to_string_lossy()
                .to_string()
        };

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self { pool, db_path };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` so every pooled
    /// connection sees the same store.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = format!(
            "/tmp/tally_test_{}_{}.db",
            std::process::id(),
            id
        );

        // Remove any existing file
        let _ = std::fs::remove_file(&path);

        Self::open(&path, &Config::default())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Enable foreign keys
            PRAGMA foreign_keys = ON;

            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;

            -- Writers queue behind each other instead of failing fast
            PRAGMA busy_timeout = 5000;

            PRAGMA synchronous = NORMAL;

            -- Instances (ledger tenants)
            CREATE TABLE IF NOT EXISTS instances (
                id INTEGER PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                config TEXT,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Accounts (balance holders)
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                address TEXT NOT NULL,
                name TEXT,
                description TEXT,
                type TEXT NOT NULL,
                normal_balance TEXT NOT NULL,
                currency TEXT NOT NULL,
                allowed_negative BOOLEAN NOT NULL DEFAULT 0,
                posted_amount INTEGER NOT NULL DEFAULT 0,
                posted_debit INTEGER NOT NULL DEFAULT 0,
                posted_credit INTEGER NOT NULL DEFAULT 0,
                pending_amount INTEGER NOT NULL DEFAULT 0,
                pending_debit INTEGER NOT NULL DEFAULT 0,
                pending_credit INTEGER NOT NULL DEFAULT 0,
                available INTEGER NOT NULL DEFAULT 0,
                context TEXT,
                lock_version INTEGER NOT NULL DEFAULT 0,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(instance_id, address)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_instance ON accounts(instance_id);

            -- Transactions
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                status TEXT NOT NULL,
                posted_at DATETIME,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_instance ON transactions(instance_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);

            -- Entries (committed debits/credits; never deleted)
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                entry_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_entries_transaction ON entries(transaction_id);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);

            -- Balance history (append-only snapshots per applied entry)
            CREATE TABLE IF NOT EXISTS balance_history_entries (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                entry_id INTEGER NOT NULL REFERENCES entries(id),
                posted_amount INTEGER NOT NULL,
                posted_debit INTEGER NOT NULL,
                posted_credit INTEGER NOT NULL,
                pending_amount INTEGER NOT NULL,
                pending_debit INTEGER NOT NULL,
                pending_credit INTEGER NOT NULL,
                available INTEGER NOT NULL,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_balance_history_account ON balance_history_entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_balance_history_entry ON balance_history_entries(entry_id);

            -- Commands (immutable write-ahead log)
            CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                command_map TEXT NOT NULL,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_commands_instance_inserted ON commands(instance_id, inserted_at);

            -- Command queue items (mutable lifecycle partner, 1:1)
            CREATE TABLE IF NOT EXISTS command_queue_items (
                id INTEGER PRIMARY KEY,
                command_id INTEGER NOT NULL UNIQUE REFERENCES commands(id),
                status TEXT NOT NULL DEFAULT 'pending',
                processor_id TEXT,
                processor_version TEXT,
                processing_started_at DATETIME,
                processing_completed_at DATETIME,
                retry_count INTEGER NOT NULL DEFAULT 0,
                occ_retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_after DATETIME,
                errors TEXT NOT NULL DEFAULT '[]',
                lock_version INTEGER NOT NULL DEFAULT 0,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Queue readiness scan
            CREATE INDEX IF NOT EXISTS idx_queue_items_readiness ON command_queue_items(status, next_retry_after);
            -- Dead-letter scan
            CREATE INDEX IF NOT EXISTS idx_queue_items_dead_letter ON command_queue_items(status, inserted_at)
                WHERE status = 'dead_letter';
            -- Stalled processing scan
            CREATE INDEX IF NOT EXISTS idx_queue_items_stalled ON command_queue_items(processing_started_at)
                WHERE status = 'processing' AND processing_completed_at IS NULL;

            -- Journal events (immutable audit records)
            CREATE TABLE IF NOT EXISTS journal_events (
                id INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                command_map TEXT NOT NULL,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_journal_events_instance ON journal_events(instance_id);

            -- Link tables: one journal event maps to exactly one command and
            -- exactly one transaction or account; one command emits at most
            -- one journal event.
            CREATE TABLE IF NOT EXISTS journal_event_command_links (
                id INTEGER PRIMARY KEY,
                journal_event_id INTEGER NOT NULL UNIQUE REFERENCES journal_events(id),
                command_id INTEGER NOT NULL UNIQUE REFERENCES commands(id),
                UNIQUE(journal_event_id, command_id)
            );

            CREATE TABLE IF NOT EXISTS journal_event_transaction_links (
                id INTEGER PRIMARY KEY,
                journal_event_id INTEGER NOT NULL UNIQUE REFERENCES journal_events(id),
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                UNIQUE(journal_event_id, transaction_id)
            );

            CREATE INDEX IF NOT EXISTS idx_journal_tx_links_transaction
                ON journal_event_transaction_links(transaction_id);

            CREATE TABLE IF NOT EXISTS journal_event_account_links (
                id INTEGER PRIMARY KEY,
                journal_event_id INTEGER NOT NULL UNIQUE REFERENCES journal_events(id),
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                UNIQUE(journal_event_id, account_id)
            );

            CREATE INDEX IF NOT EXISTS idx_journal_account_links_account
                ON journal_event_account_links(account_id);

            -- Pending-transaction lookup: update commands find their target
            -- without scanning the command log.
            CREATE TABLE IF NOT EXISTS pending_transaction_lookup (
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                source TEXT NOT NULL,
                source_idempk TEXT NOT NULL,
                command_id INTEGER NOT NULL REFERENCES commands(id),
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                journal_event_id INTEGER REFERENCES journal_events(id),
                PRIMARY KEY (instance_id, source, source_idempk)
            );

            -- Idempotency keys (inserted with the command; the unique key
            -- refuses duplicate submissions)
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                instance_id INTEGER NOT NULL REFERENCES instances(id),
                key_hash TEXT NOT NULL,
                command_id INTEGER NOT NULL REFERENCES commands(id),
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (instance_id, key_hash)
            );
            "#,
        )?;

        info!("Ledger schema initialized at {}", self.db_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests;

//! Tally Core Library
//!
//! Command queue and double-entry posting core for the Tally ledger:
//! - Immutable command log with idempotent submission
//! - Double-entry posting engine with posted/pending sub-balances
//! - Optimistic concurrency control with bounded, backed-off retries
//! - Queue item lifecycle with retry scheduling and dead-lettering
//! - Per-instance dispatcher (one processor per tenant, found by polling)
//! - Journal emission with link rows and a fan-out job hook

pub mod command;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod occ;
pub mod posting;
pub mod scheduler;
pub mod submit;
pub mod workers;

pub use command::{
    idempotency_hash, parse_params, validate_command_map, AccountCommandMap, AccountData,
    CommandAction, CommandMap, EntryData, FieldError, TransactionCommandMap, TransactionData,
    ValidationErrors,
};
pub use config::Config;
pub use db::Database;
pub use dispatcher::{drain_instance, start, DispatcherHandle};
pub use error::{Error, Result};
pub use models::{
    Account, AccountType, Balance, BalanceHistoryEntry, Command, CommandQueueItem, Entry,
    EntryType, Entryable, Instance, JournalEvent, NormalBalance, PendingTransactionLookup,
    QueueError, QueueStatus, Transaction, TransactionStatus,
};
pub use occ::{with_occ_retry, OccOutcome};
pub use posting::{check_balanced, normalize_entry, PostingOutcome, ProposedEntry};
pub use submit::{create_from_params, process_from_params, OnError, ProcessOptions};
pub use workers::{
    process_command, validate_against_state, LinkJobQueue, NoopLinkQueue, ProcessOutcome,
    Projection,
};

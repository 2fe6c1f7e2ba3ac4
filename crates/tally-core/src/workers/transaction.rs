//! Transaction command workers
//!
//! CreateTransaction posts a new transaction. UpdateTransaction drives the
//! pending-transaction protocol: resolve the target through the lookup
//! table, and when the lookup is absent, fall back to the create command's
//! idempotency key to decide between waiting, dead-lettering, and
//! rejecting — an update must never race ahead of its create.

use chrono::Utc;
use tracing::info;

use super::{occ_timed_out, LinkJobQueue, Projection, WorkerOutcome};
use crate::command::{
    idempotency_hash, CommandAction, EntryData, TransactionCommandMap, ValidationErrors,
};
use crate::config::Config;
use crate::db::{journal, queue, transactions, with_immediate_tx, Database};
use crate::error::{Error, Result};
use crate::models::{
    Account, Command, CommandQueueItem, Entry, Instance, QueueStatus, TransactionStatus,
};
use crate::occ::{with_occ_retry, OccOutcome};
use crate::posting::{self, ProposedEntry};
use crate::scheduler;

/// Resolve and normalize a create payload against current instance state
pub(crate) fn validate_create(
    db: &Database,
    instance: &Instance,
    map: &TransactionCommandMap,
) -> Result<Vec<(Account, ProposedEntry)>> {
    let entries = map.payload.entries.as_deref().ok_or_else(|| {
        Error::Validation(ValidationErrors::single("payload.entries", "can't be blank"))
    })?;

    let pairs = resolve_entries(db, instance, entries)?;
    let proposed: Vec<ProposedEntry> = pairs.iter().map(|(_, p)| p.clone()).collect();
    posting::check_balanced(&proposed)?;

    Ok(pairs)
}

/// CreateTransaction worker
pub(crate) fn create(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
    claimed: &CommandQueueItem,
    instance: &Instance,
    map: &TransactionCommandMap,
) -> Result<WorkerOutcome> {
    validate_create(db, instance, map)?;
    let status = map.payload.status;

    let work = || {
        // Fresh account snapshots per attempt; their lock_versions guard
        // the in-transaction balance writes.
        let pairs = validate_create(db, instance, map)?;

        let conn = db.conn()?;
        with_immediate_tx(&conn, |conn| {
            let outcome = posting::post_new_transaction(conn, instance.id, status, &pairs)?;
            let event = journal::insert_journal_event(
                conn,
                instance.id,
                command.id,
                &command.command_map,
            )?;
            journal::link_transaction(conn, event.id, outcome.transaction.id)?;

            // Only still-pending transactions are reachable by later
            // updates; a created-posted transaction is final.
            if status == TransactionStatus::Pending {
                journal::insert_pending_lookup(
                    conn,
                    &crate::models::PendingTransactionLookup {
                        instance_id: instance.id,
                        source: map.source.clone(),
                        source_idempk: map.source_idempk.clone(),
                        command_id: command.id,
                        transaction_id: outcome.transaction.id,
                        journal_event_id: Some(event.id),
                    },
                )?;
            }

            links.enqueue(conn, event.id)?;
            queue::mark_processed(conn, claimed.id)?;

            Ok(outcome.transaction)
        })
    };

    match with_occ_retry(db, config, claimed.id, work)? {
        OccOutcome::Ok(transaction) => {
            Ok(WorkerOutcome::Processed(Projection::Transaction(transaction)))
        }
        OccOutcome::Timeout => occ_timed_out(db, config, claimed),
    }
}

/// UpdateTransaction worker
pub(crate) fn update(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
    claimed: &CommandQueueItem,
    instance: &Instance,
    map: &TransactionCommandMap,
) -> Result<WorkerOutcome> {
    let lookup = match db.get_pending_lookup(instance.id, &map.source, &map.source_idempk)? {
        Some(lookup) => lookup,
        None => return resolve_missing_lookup(db, config, claimed, instance, map),
    };

    let requested = map.payload.status;

    let work = || {
        let tx = db
            .get_transaction(lookup.transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", lookup.transaction_id)))?;
        if !tx.status.can_transition_to(requested) {
            return Err(Error::InvalidTransition(format!(
                "transaction {} is {}; cannot move to {}",
                tx.id, tx.status, requested
            )));
        }

        let old_entries = db.list_entries(tx.id)?;
        let updates =
            effective_updates(db, instance, &old_entries, map.payload.entries.as_deref())?;

        if requested != TransactionStatus::Archived {
            let proposed: Vec<ProposedEntry> = updates.iter().map(|(_, p)| p.clone()).collect();
            posting::check_balanced(&proposed)?;
        }

        let conn = db.conn()?;
        with_immediate_tx(&conn, |conn| {
            posting::apply_pending_update(conn, &tx, &old_entries, &updates, requested)?;

            let event = journal::insert_journal_event(
                conn,
                instance.id,
                command.id,
                &command.command_map,
            )?;
            journal::link_transaction(conn, event.id, tx.id)?;

            // Leaving pending makes the transaction final; clear the
            // lookup so later updates fail fast.
            if requested != TransactionStatus::Pending {
                journal::clear_pending_lookup(
                    conn,
                    instance.id,
                    &map.source,
                    &map.source_idempk,
                )?;
            }

            links.enqueue(conn, event.id)?;
            queue::mark_processed(conn, claimed.id)?;

            transactions::get_transaction(conn, tx.id)?
                .ok_or_else(|| Error::NotFound(format!("transaction {}", tx.id)))
        })
    };

    match with_occ_retry(db, config, claimed.id, work)? {
        OccOutcome::Ok(transaction) => {
            Ok(WorkerOutcome::Processed(Projection::Transaction(transaction)))
        }
        OccOutcome::Timeout => occ_timed_out(db, config, claimed),
    }
}

/// No lookup row: decide between dead-letter and deferral by the fate of
/// the create command that owns this (source, source_idempk).
fn resolve_missing_lookup(
    db: &Database,
    config: &Config,
    claimed: &CommandQueueItem,
    instance: &Instance,
    map: &TransactionCommandMap,
) -> Result<WorkerOutcome> {
    let create_hash = idempotency_hash(
        CommandAction::CreateTransaction,
        &map.source,
        &map.source_idempk,
        None,
    );

    let Some(create_command_id) = db.find_command_by_idempotency(instance.id, &create_hash)?
    else {
        let reason = format!(
            "create_event_not_found: no create_transaction for ({}, {})",
            map.source, map.source_idempk
        );
        db.mark_dead_letter(claimed.id, &reason)?;
        return Ok(WorkerOutcome::DeadLettered(reason));
    };

    let create_item = db
        .get_queue_item_for_command(create_command_id)?
        .ok_or_else(|| {
            Error::NotFound(format!("queue item for command {}", create_command_id))
        })?;

    match create_item.status {
        // The create finished but left no lookup: it created the
        // transaction posted, or an earlier update already finalized it.
        QueueStatus::Processed => {
            let reason = format!(
                "create_event_not_found: transaction for ({}, {}) is not pending",
                map.source, map.source_idempk
            );
            db.mark_dead_letter(claimed.id, &reason)?;
            Ok(WorkerOutcome::DeadLettered(reason))
        }
        QueueStatus::DeadLetter => {
            let reason = format!(
                "create_event_not_found: create command {} was dead-lettered",
                create_command_id
            );
            db.mark_dead_letter(claimed.id, &reason)?;
            Ok(WorkerOutcome::DeadLettered(reason))
        }
        // Still in flight: wait behind the create, never ahead of it.
        QueueStatus::Pending
        | QueueStatus::Processing
        | QueueStatus::Failed
        | QueueStatus::OccTimeout => {
            let now = Utc::now();
            let gate = create_item
                .next_retry_after
                .map(|at| at.max(now))
                .unwrap_or(now);
            let retry_at = gate + scheduler::backoff_delay(config, claimed.retry_count);

            info!(
                command_id = claimed.command_id,
                create_command_id,
                retry_at = %retry_at,
                "update deferred behind its create command"
            );
            db.revert_to_pending(
                claimed.id,
                &format!(
                    "waiting for create command {} to finish",
                    create_command_id
                ),
                retry_at,
            )?;
            Ok(WorkerOutcome::Deferred)
        }
    }
}

/// Dry-run update validation for synchronous submission.
///
/// Hard rejections (missing create, finalized transaction, illegal
/// transition, malformed rewrite) error; a create still in flight passes,
/// because the queue would simply wait it out.
pub(crate) fn validate_update(
    db: &Database,
    instance: &Instance,
    map: &TransactionCommandMap,
) -> Result<()> {
    match db.get_pending_lookup(instance.id, &map.source, &map.source_idempk)? {
        Some(lookup) => {
            let tx = db
                .get_transaction(lookup.transaction_id)?
                .ok_or_else(|| {
                    Error::NotFound(format!("transaction {}", lookup.transaction_id))
                })?;
            if !tx.status.can_transition_to(map.payload.status) {
                return Err(Error::InvalidTransition(format!(
                    "transaction {} is {}; cannot move to {}",
                    tx.id, tx.status, map.payload.status
                )));
            }

            let old_entries = db.list_entries(tx.id)?;
            let updates =
                effective_updates(db, instance, &old_entries, map.payload.entries.as_deref())?;
            if map.payload.status != TransactionStatus::Archived {
                let proposed: Vec<ProposedEntry> =
                    updates.iter().map(|(_, p)| p.clone()).collect();
                posting::check_balanced(&proposed)?;
            }
            Ok(())
        }
        None => {
            let create_hash = idempotency_hash(
                CommandAction::CreateTransaction,
                &map.source,
                &map.source_idempk,
                None,
            );
            let Some(create_command_id) =
                db.find_command_by_idempotency(instance.id, &create_hash)?
            else {
                return Err(Error::Validation(ValidationErrors::single(
                    "source_idempk",
                    "create_event_not_found: no pending transaction for this key",
                )));
            };

            let create_item = db
                .get_queue_item_for_command(create_command_id)?
                .ok_or_else(|| {
                    Error::NotFound(format!("queue item for command {}", create_command_id))
                })?;

            match create_item.status {
                QueueStatus::Processed | QueueStatus::DeadLetter => {
                    Err(Error::Validation(ValidationErrors::single(
                        "source_idempk",
                        "create_event_not_found: transaction is not pending",
                    )))
                }
                _ => Ok(()),
            }
        }
    }
}

/// Resolve create-payload entries to accounts and normalize them
fn resolve_entries(
    db: &Database,
    instance: &Instance,
    entries: &[EntryData],
) -> Result<Vec<(Account, ProposedEntry)>> {
    let mut pairs = Vec::with_capacity(entries.len());
    for data in entries {
        let account = db
            .get_account_by_address(instance.id, &data.account_address)?
            .ok_or_else(|| Error::NotFound(format!("account {}", data.account_address)))?;
        let proposed = posting::normalize_entry(&account, data)?;
        pairs.push((account, proposed));
    }
    Ok(pairs)
}

/// Build the position-matched update set for a pending transaction.
///
/// A rewrite must carry the same entry count, in the same account-address
/// order, with the currency of each position unchanged. Without a rewrite
/// the old entry values are re-applied against fresh account snapshots.
fn effective_updates(
    db: &Database,
    instance: &Instance,
    old_entries: &[Entry],
    new_entries: Option<&[EntryData]>,
) -> Result<Vec<(Account, ProposedEntry)>> {
    match new_entries {
        Some(new_entries) => {
            if new_entries.len() != old_entries.len() {
                return Err(Error::Validation(ValidationErrors::single(
                    "payload.entries",
                    &format!(
                        "must contain exactly {} entries to match the original transaction",
                        old_entries.len()
                    ),
                )));
            }

            let mut updates = Vec::with_capacity(new_entries.len());
            for (index, (old, data)) in old_entries.iter().zip(new_entries).enumerate() {
                let account = db
                    .get_account_by_address(instance.id, &data.account_address)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("account {}", data.account_address))
                    })?;
                if account.id != old.account_id {
                    return Err(Error::Validation(ValidationErrors::single(
                        &format!("payload.entries[{}].account_address", index),
                        "must match the original transaction's account order",
                    )));
                }
                if data.currency != old.currency {
                    return Err(Error::Validation(ValidationErrors::single(
                        &format!("payload.entries[{}].currency", index),
                        "is immutable",
                    )));
                }
                let proposed = posting::normalize_entry(&account, data)?;
                updates.push((account, proposed));
            }
            Ok(updates)
        }
        None => {
            let mut updates = Vec::with_capacity(old_entries.len());
            for old in old_entries {
                let account = db.get_account(old.account_id)?.ok_or_else(|| {
                    Error::NotFound(format!("account {}", old.account_id))
                })?;
                updates.push((
                    account,
                    ProposedEntry {
                        account_id: old.account_id,
                        entry_type: old.entry_type,
                        amount: old.amount,
                        currency: old.currency.clone(),
                    },
                ));
            }
            Ok(updates)
        }
    }
}

//! Command workers
//!
//! One worker per `(kind, action)` pairing: account create/update and
//! transaction create/update. [`process_command`] is the shared pipeline —
//! claim, validate, execute inside the OCC retry engine, and land the
//! queue item in its final status. Failures are persisted onto the queue
//! item; synchronous callers that want validation surfaced without a
//! dead-letter record go through [`validate_against_state`] first (see
//! `submit`).

use rusqlite::Connection;
use tracing::{error, info};

use crate::command::{validate_command_map, CommandMap};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Account, Command, CommandQueueItem, Instance, Transaction};
use crate::scheduler;

pub(crate) mod account;
pub(crate) mod transaction;

/// Hook for the external background job queue that fans out journal links
/// to downstream consumers.
///
/// `enqueue` runs on the open posting transaction so the job record is
/// durable iff the journal event is.
pub trait LinkJobQueue: Send + Sync {
    fn enqueue(&self, conn: &Connection, journal_event_id: i64) -> Result<()>;
}

/// For embedders without a job system
#[derive(Debug, Default)]
pub struct NoopLinkQueue;

impl LinkJobQueue for NoopLinkQueue {
    fn enqueue(&self, _conn: &Connection, _journal_event_id: i64) -> Result<()> {
        Ok(())
    }
}

/// What a successful command projected into the ledger
#[derive(Debug, Clone)]
pub enum Projection {
    Account(Account),
    Transaction(Transaction),
}

/// Terminal report of one processing attempt
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Posted and journaled; queue item is `processed`
    Processed(Projection),
    /// Terminal failure; queue item is `dead_letter`
    DeadLettered(String),
    /// OCC retries exhausted; queue item is `occ_timeout` and will be
    /// retried by the scheduler
    OccTimedOut,
    /// Transient failure; queue item is `failed` with a backoff schedule
    Failed(String),
    /// Update command waiting for its create command; queue item reverted
    /// to `pending` with a deferral
    Deferred,
    /// Another processor holds (or already finished) this command
    AlreadyClaimed,
}

/// Worker-internal verdict; the worker has already written any queue
/// status the verdict implies
pub(crate) enum WorkerOutcome {
    Processed(Projection),
    OccTimedOut,
    Deferred,
    DeadLettered(String),
}

/// Process a command from the queue, persisting errors on failure.
///
/// The pipeline: claim the queue item (compare-and-set; a miss is a
/// no-op), decode and validate the command map, resolve the instance, and
/// dispatch to the matching worker. The worker executes posting and
/// journal emission inside a single database transaction wrapped by the
/// OCC retry engine; this function turns the worker's verdict or error
/// into the queue item's final status.
pub fn process_command(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
) -> Result<ProcessOutcome> {
    let queue_item = db
        .get_queue_item_for_command(command.id)?
        .ok_or_else(|| Error::NotFound(format!("queue item for command {}", command.id)))?;

    if !queue_item.status.is_claimable() {
        return Ok(ProcessOutcome::AlreadyClaimed);
    }

    let claimed = match db.claim_queue_item(
        &queue_item,
        &config.processor_id(command.instance_id),
        env!("CARGO_PKG_VERSION"),
    ) {
        Ok(item) => item,
        Err(Error::AlreadyClaimed(_)) => return Ok(ProcessOutcome::AlreadyClaimed),
        Err(e) => return Err(e),
    };

    let map = match CommandMap::from_value(&command.command_map) {
        Ok(map) => map,
        Err(e) => {
            let reason = format!("command map is not decodable: {}", e);
            db.mark_dead_letter(claimed.id, &reason)?;
            return Ok(ProcessOutcome::DeadLettered(reason));
        }
    };

    match run_worker(db, config, links, command, &claimed, &map) {
        Ok(WorkerOutcome::Processed(projection)) => {
            info!(
                command_id = command.id,
                action = %map.action(),
                "command processed"
            );
            Ok(ProcessOutcome::Processed(projection))
        }
        Ok(WorkerOutcome::OccTimedOut) => Ok(ProcessOutcome::OccTimedOut),
        Ok(WorkerOutcome::Deferred) => Ok(ProcessOutcome::Deferred),
        Ok(WorkerOutcome::DeadLettered(reason)) => Ok(ProcessOutcome::DeadLettered(reason)),
        Err(err) if err.is_hard_failure() => {
            let reason = err.to_string();
            info!(
                command_id = command.id,
                %reason,
                "command dead-lettered"
            );
            db.mark_dead_letter(claimed.id, &reason)?;
            Ok(ProcessOutcome::DeadLettered(reason))
        }
        Err(err) => {
            let reason = err.to_string();
            error!(command_id = command.id, %reason, "command failed");
            fail_or_dead_letter(db, config, &claimed, &reason)?;
            Ok(ProcessOutcome::Failed(reason))
        }
    }
}

fn run_worker(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
    claimed: &CommandQueueItem,
    map: &CommandMap,
) -> Result<WorkerOutcome> {
    validate_command_map(map)?;
    let instance = resolve_instance(db, map)?;

    match map {
        CommandMap::CreateAccount(account_map) => {
            account::create(db, config, links, command, claimed, &instance, account_map)
        }
        CommandMap::UpdateAccount(account_map) => {
            account::update(db, config, links, command, claimed, &instance, account_map)
        }
        CommandMap::CreateTransaction(tx_map) => {
            transaction::create(db, config, links, command, claimed, &instance, tx_map)
        }
        CommandMap::UpdateTransaction(tx_map) => {
            transaction::update(db, config, links, command, claimed, &instance, tx_map)
        }
    }
}

/// Transient failure: schedule a retry, or dead-letter once the scheduler
/// retry budget is spent
fn fail_or_dead_letter(
    db: &Database,
    config: &Config,
    claimed: &CommandQueueItem,
    reason: &str,
) -> Result<()> {
    if scheduler::retries_exhausted(config, claimed) {
        db.mark_dead_letter(claimed.id, &scheduler::max_retries_message(config, reason))
    } else {
        db.mark_failed(
            claimed.id,
            reason,
            scheduler::next_retry_at(config, claimed.retry_count),
        )
    }
}

/// Schedule an occ_timeout retry for a claimed item
pub(crate) fn occ_timed_out(
    db: &Database,
    config: &Config,
    claimed: &CommandQueueItem,
) -> Result<WorkerOutcome> {
    db.mark_occ_timeout(
        claimed.id,
        "OCC retries exhausted",
        scheduler::next_retry_at(config, claimed.retry_count),
    )?;
    Ok(WorkerOutcome::OccTimedOut)
}

pub(crate) fn resolve_instance(db: &Database, map: &CommandMap) -> Result<Instance> {
    db.get_instance_by_address(map.instance_address())?
        .ok_or_else(|| Error::NotFound(format!("instance {}", map.instance_address())))
}

/// Dry-run validation against current instance state, without persisting
/// anything.
///
/// Used by synchronous submission with `on_error = fail`: structural
/// problems and state problems that would dead-letter the command are
/// surfaced before a command record is created. Conditions the queue
/// would wait out (an update arriving ahead of its create) pass.
pub fn validate_against_state(db: &Database, map: &CommandMap) -> Result<()> {
    validate_command_map(map)?;
    let instance = resolve_instance(db, map)?;

    match map {
        CommandMap::CreateAccount(account_map) => {
            account::validate_create(db, &instance, account_map)
        }
        CommandMap::UpdateAccount(account_map) => {
            account::validate_update(db, &instance, account_map).map(|_| ())
        }
        CommandMap::CreateTransaction(tx_map) => {
            transaction::validate_create(db, &instance, tx_map).map(|_| ())
        }
        CommandMap::UpdateTransaction(tx_map) => {
            transaction::validate_update(db, &instance, tx_map)
        }
    }
}

//! Account command workers

use super::{occ_timed_out, LinkJobQueue, Projection, WorkerOutcome};
use crate::command::{AccountCommandMap, ValidationErrors};
use crate::config::Config;
use crate::db::{accounts, journal, queue, with_immediate_tx, Database};
use crate::error::{Error, Result};
use crate::models::{Account, Command, CommandQueueItem, Instance};
use crate::occ::{with_occ_retry, OccOutcome};

/// The target address must still be free
pub(crate) fn validate_create(
    db: &Database,
    instance: &Instance,
    map: &AccountCommandMap,
) -> Result<()> {
    if db
        .get_account_by_address(instance.id, &map.payload.address)?
        .is_some()
    {
        return Err(Error::Validation(ValidationErrors::single(
            "payload.address",
            "has already been taken",
        )));
    }
    Ok(())
}

/// The target account must exist and the payload must not try to change
/// an immutable attribute
pub(crate) fn validate_update(
    db: &Database,
    instance: &Instance,
    map: &AccountCommandMap,
) -> Result<Account> {
    let account = db
        .get_account_by_address(instance.id, &map.payload.address)?
        .ok_or_else(|| Error::NotFound(format!("account {}", map.payload.address)))?;

    let mut errors = ValidationErrors::new();
    if map.payload.currency != account.currency {
        errors.add("payload.currency", "is immutable");
    }
    if map.payload.account_type != account.account_type {
        errors.add("payload.type", "is immutable");
    }
    if let Some(normal_balance) = map.payload.normal_balance {
        if normal_balance != account.normal_balance {
            errors.add("payload.normal_balance", "is immutable");
        }
    }
    errors.into_result()?;

    Ok(account)
}

/// CreateAccount worker: insert the account, emit the journal event with
/// its account link, and mark the command processed, all in one
/// transaction.
pub(crate) fn create(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
    claimed: &CommandQueueItem,
    instance: &Instance,
    map: &AccountCommandMap,
) -> Result<WorkerOutcome> {
    let work = || {
        let conn = db.conn()?;
        with_immediate_tx(&conn, |conn| {
            // Checked again under the write lock: another processor may
            // have taken the address since validation.
            if accounts::find_account_by_address(conn, instance.id, &map.payload.address)?
                .is_some()
            {
                return Err(Error::Validation(ValidationErrors::single(
                    "payload.address",
                    "has already been taken",
                )));
            }

            let account = accounts::insert_account(conn, instance.id, &map.payload)?;
            let event = journal::insert_journal_event(
                conn,
                instance.id,
                command.id,
                &command.command_map,
            )?;
            journal::link_account(conn, event.id, account.id)?;
            links.enqueue(conn, event.id)?;
            queue::mark_processed(conn, claimed.id)?;

            Ok(account)
        })
    };

    validate_create(db, instance, map)?;

    match with_occ_retry(db, config, claimed.id, work)? {
        OccOutcome::Ok(account) => Ok(WorkerOutcome::Processed(Projection::Account(account))),
        OccOutcome::Timeout => occ_timed_out(db, config, claimed),
    }
}

/// UpdateAccount worker: rewrite the mutable fields under the account's
/// lock_version and journal the change.
pub(crate) fn update(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    command: &Command,
    claimed: &CommandQueueItem,
    instance: &Instance,
    map: &AccountCommandMap,
) -> Result<WorkerOutcome> {
    validate_update(db, instance, map)?;

    let work = || {
        // Fresh snapshot per attempt; the lock_version read here is what
        // the in-transaction write is guarded on.
        let account = validate_update(db, instance, map)?;

        let conn = db.conn()?;
        with_immediate_tx(&conn, |conn| {
            accounts::update_account_fields(
                conn,
                &account,
                map.payload.name.as_deref(),
                map.payload.description.as_deref(),
                map.payload.allowed_negative,
                map.payload.context.as_ref(),
            )?;

            let event = journal::insert_journal_event(
                conn,
                instance.id,
                command.id,
                &command.command_map,
            )?;
            journal::link_account(conn, event.id, account.id)?;
            links.enqueue(conn, event.id)?;
            queue::mark_processed(conn, claimed.id)?;

            accounts::get_account(conn, account.id)?
                .ok_or_else(|| Error::NotFound(format!("account {}", account.id)))
        })
    };

    match with_occ_retry(db, config, claimed.id, work)? {
        OccOutcome::Ok(account) => Ok(WorkerOutcome::Processed(Projection::Account(account))),
        OccOutcome::Timeout => occ_timed_out(db, config, claimed),
    }
}

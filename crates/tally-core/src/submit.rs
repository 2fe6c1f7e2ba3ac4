//! Command submission API
//!
//! The in-process surface thin HTTP/CLI adapters call with raw parameter
//! maps. [`create_from_params`] durably enqueues and returns immediately;
//! [`process_from_params`] runs the command synchronously and either
//! persists failures for the queue to retry or surfaces validation errors
//! without persisting anything, depending on [`OnError`].

use tracing::info;

use crate::command::{parse_params, CommandMap, ValidationErrors};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Command, Instance};
use crate::workers::{self, LinkJobQueue, ProcessOutcome, Projection};

/// What to do when a synchronously processed command fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Persist the command; the queue item records the failure and the
    /// scheduler retries where the failure class allows it
    #[default]
    Retry,
    /// Validate first and return errors without persisting a command
    Fail,
}

/// Options for [`process_from_params`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    pub on_error: OnError,
}

/// Durably enqueue a command and return it with its queue item pending.
///
/// The command, queue item, and idempotency key commit atomically; a
/// duplicate submission is refused with the existing command's identity.
pub fn create_from_params(db: &Database, params: &serde_json::Value) -> Result<Command> {
    let map = parse_params(params)?;
    let instance = resolve_instance_for_submission(db, &map)?;

    let (command, _queue_item) = db.insert_command(instance.id, &map)?;
    info!(
        command_id = command.id,
        instance = %instance.address,
        action = %map.action(),
        "command enqueued"
    );

    Ok(command)
}

/// Synchronous variant: enqueue and immediately process.
///
/// With `OnError::Fail`, validation runs against current instance state
/// before anything is persisted, so a bad payload never leaves a
/// dead-letter record. With `OnError::Retry`, the command is always
/// persisted and failures live on its queue item.
pub fn process_from_params(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    params: &serde_json::Value,
    options: ProcessOptions,
) -> Result<(Projection, Command)> {
    let map = parse_params(params)?;
    let instance = resolve_instance_for_submission(db, &map)?;

    if options.on_error == OnError::Fail {
        workers::validate_against_state(db, &map)?;
    }

    let (command, _queue_item) = db.insert_command(instance.id, &map)?;

    match workers::process_command(db, config, links, &command)? {
        ProcessOutcome::Processed(projection) => Ok((projection, command)),
        ProcessOutcome::DeadLettered(reason) => Err(Error::CommandFailed {
            command_id: command.id,
            reason,
        }),
        ProcessOutcome::OccTimedOut => Err(Error::CommandFailed {
            command_id: command.id,
            reason: "OCC retries exhausted; scheduled for retry".to_string(),
        }),
        ProcessOutcome::Failed(reason) => Err(Error::CommandFailed {
            command_id: command.id,
            reason,
        }),
        ProcessOutcome::Deferred => Err(Error::CommandFailed {
            command_id: command.id,
            reason: "deferred behind its create command; scheduled for retry".to_string(),
        }),
        ProcessOutcome::AlreadyClaimed => Err(Error::CommandFailed {
            command_id: command.id,
            reason: "already claimed by another processor".to_string(),
        }),
    }
}

/// A submission against an unknown instance is a caller mistake, reported
/// as a field error rather than a queue-level not-found
fn resolve_instance_for_submission(db: &Database, map: &CommandMap) -> Result<Instance> {
    db.get_instance_by_address(map.instance_address())?
        .ok_or_else(|| {
            Error::Validation(ValidationErrors::single(
                "instance_address",
                "does not exist",
            ))
        })
}

//! Command model and validation
//!
//! Callers describe intent as a JSON map with an `action` discriminator.
//! The map decodes into a tagged [`CommandMap`] with a strict schema per
//! action; field-level problems are collected into [`ValidationErrors`]
//! rather than failing one at a time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{AccountType, NormalBalance, TransactionStatus};

/// Account address format: leading alphanumeric, then dotted/namespaced tail
const ADDRESS_PATTERN: &str = "^[A-Za-z0-9][A-Za-z0-9._:-]*$";
/// Source system identifier: lowercase, 2-30 chars
const SOURCE_PATTERN: &str = "^[a-z0-9][a-z0-9_-]{1,29}$";
/// Source idempotency key: 1-128 chars
const IDEMPK_PATTERN: &str = "^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$";

/// The four supported command actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    CreateAccount,
    UpdateAccount,
    CreateTransaction,
    UpdateTransaction,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAccount => "create_account",
            Self::UpdateAccount => "update_account",
            Self::CreateTransaction => "create_transaction",
            Self::UpdateTransaction => "update_transaction",
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Self::UpdateAccount | Self::UpdateTransaction)
    }
}

impl std::str::FromStr for CommandAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create_account" => Ok(Self::CreateAccount),
            "update_account" => Ok(Self::UpdateAccount),
            "create_transaction" => Ok(Self::CreateTransaction),
            "update_transaction" => Ok(Self::UpdateTransaction),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

impl std::fmt::Display for CommandAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account payload carried by create_account / update_account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountData {
    pub address: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides the normal balance derived from `type` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_balance: Option<NormalBalance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_negative: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// A caller's signed-amount intent against an account address.
///
/// The sign expresses "add to" / "subtract from" the account in its own
/// normal-balance terms; the posting engine normalizes it into a typed
/// debit/credit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryData {
    pub account_address: String,
    pub amount: i64,
    pub currency: String,
}

/// Transaction payload carried by create_transaction / update_transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionData {
    pub status: TransactionStatus,
    /// Required on create; optional on update (entry rewrite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryData>>,
}

/// Shared envelope for account commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCommandMap {
    pub instance_address: String,
    pub source: String,
    pub source_idempk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_idempk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_source: Option<String>,
    pub payload: AccountData,
}

/// Shared envelope for transaction commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionCommandMap {
    pub instance_address: String,
    pub source: String,
    pub source_idempk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_idempk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_source: Option<String>,
    pub payload: TransactionData,
}

/// A validated command shape, tagged by action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandMap {
    CreateAccount(AccountCommandMap),
    UpdateAccount(AccountCommandMap),
    CreateTransaction(TransactionCommandMap),
    UpdateTransaction(TransactionCommandMap),
}

impl CommandMap {
    pub fn action(&self) -> CommandAction {
        match self {
            Self::CreateAccount(_) => CommandAction::CreateAccount,
            Self::UpdateAccount(_) => CommandAction::UpdateAccount,
            Self::CreateTransaction(_) => CommandAction::CreateTransaction,
            Self::UpdateTransaction(_) => CommandAction::UpdateTransaction,
        }
    }

    pub fn instance_address(&self) -> &str {
        match self {
            Self::CreateAccount(map) | Self::UpdateAccount(map) => &map.instance_address,
            Self::CreateTransaction(map) | Self::UpdateTransaction(map) => &map.instance_address,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::CreateAccount(map) | Self::UpdateAccount(map) => &map.source,
            Self::CreateTransaction(map) | Self::UpdateTransaction(map) => &map.source,
        }
    }

    pub fn source_idempk(&self) -> &str {
        match self {
            Self::CreateAccount(map) | Self::UpdateAccount(map) => &map.source_idempk,
            Self::CreateTransaction(map) | Self::UpdateTransaction(map) => &map.source_idempk,
        }
    }

    pub fn update_idempk(&self) -> Option<&str> {
        match self {
            Self::CreateAccount(map) | Self::UpdateAccount(map) => map.update_idempk.as_deref(),
            Self::CreateTransaction(map) | Self::UpdateTransaction(map) => {
                map.update_idempk.as_deref()
            }
        }
    }

    /// The stable hash identifying this submission for idempotency
    pub fn idempotency_hash(&self) -> String {
        idempotency_hash(
            self.action(),
            self.source(),
            self.source_idempk(),
            self.update_idempk(),
        )
    }

    /// Serialize back into the stored JSON form
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored command map
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Field-keyed validation messages, accumulated rather than short-circuited
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

/// One problem with one field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: &str) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: &str, message: &str) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// Err(Error::Validation) when any message was recorded
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Decode a raw parameter map into a typed command.
///
/// Unknown keys are ignored; a missing or unrecognized `action` is an
/// `action_not_supported` error, and any other shape problem becomes a
/// field-keyed validation error.
pub fn parse_params(params: &serde_json::Value) -> Result<CommandMap> {
    let object = params.as_object().ok_or_else(|| {
        Error::Validation(ValidationErrors::single("params", "must be a JSON object"))
    })?;

    let action = object
        .get("action")
        .and_then(|value| value.as_str())
        .ok_or_else(|| Error::ActionNotSupported("<missing>".to_string()))?;

    if action.parse::<CommandAction>().is_err() {
        return Err(Error::ActionNotSupported(action.to_string()));
    }

    let map: CommandMap = serde_json::from_value(params.clone()).map_err(|err| {
        Error::Validation(ValidationErrors::single("params", &err.to_string()))
    })?;

    validate_command_map(&map)?;
    Ok(map)
}

/// Structural validation of a decoded command map.
///
/// Checks everything that does not require instance state: key formats,
/// entry counts, duplicate addresses, zero amounts, creatable statuses.
/// Balance equality and address resolution happen in the workers once the
/// instance's accounts are loaded.
pub fn validate_command_map(map: &CommandMap) -> Result<()> {
    let address_re = Regex::new(ADDRESS_PATTERN)?;
    let source_re = Regex::new(SOURCE_PATTERN)?;
    let idempk_re = Regex::new(IDEMPK_PATTERN)?;

    let mut errors = ValidationErrors::new();

    if map.instance_address().is_empty() {
        errors.add("instance_address", "can't be blank");
    }
    if !source_re.is_match(map.source()) {
        errors.add("source", "has invalid format");
    }
    if !idempk_re.is_match(map.source_idempk()) {
        errors.add("source_idempk", "has invalid format");
    }
    if let Some(update_idempk) = map.update_idempk() {
        if !idempk_re.is_match(update_idempk) {
            errors.add("update_idempk", "has invalid format");
        }
    }
    if map.action().is_update() && map.update_idempk().is_none() {
        errors.add("update_idempk", "is required for update commands");
    }

    match map {
        CommandMap::CreateAccount(account_map) | CommandMap::UpdateAccount(account_map) => {
            validate_account_data(&account_map.payload, &address_re, &mut errors);
        }
        CommandMap::CreateTransaction(tx_map) => {
            validate_transaction_data(&tx_map.payload, &address_re, true, &mut errors);
        }
        CommandMap::UpdateTransaction(tx_map) => {
            validate_transaction_data(&tx_map.payload, &address_re, false, &mut errors);
        }
    }

    errors.into_result()
}

fn validate_account_data(payload: &AccountData, address_re: &Regex, errors: &mut ValidationErrors) {
    if !address_re.is_match(&payload.address) {
        errors.add("payload.address", "has invalid format");
    }
    if payload.currency.is_empty() {
        errors.add("payload.currency", "can't be blank");
    }
}

fn validate_transaction_data(
    payload: &TransactionData,
    address_re: &Regex,
    is_create: bool,
    errors: &mut ValidationErrors,
) {
    if is_create {
        if payload.status == TransactionStatus::Archived {
            errors.add("payload.status", "archived transactions cannot be created");
        }
        match &payload.entries {
            None => errors.add("payload.entries", "can't be blank"),
            Some(entries) => validate_entries(entries, address_re, errors),
        }
    } else if let Some(entries) = &payload.entries {
        validate_entries(entries, address_re, errors);
    }
}

fn validate_entries(entries: &[EntryData], address_re: &Regex, errors: &mut ValidationErrors) {
    if entries.len() < 2 {
        errors.add("payload.entries", "must contain at least two entries");
    }

    let mut seen = std::collections::HashSet::new();
    for (index, entry) in entries.iter().enumerate() {
        let field = format!("payload.entries[{}]", index);
        if !address_re.is_match(&entry.account_address) {
            errors.add(&format!("{}.account_address", field), "has invalid format");
        }
        if entry.amount == 0 {
            errors.add(&format!("{}.amount", field), "must be nonzero");
        }
        if entry.currency.is_empty() {
            errors.add(&format!("{}.currency", field), "can't be blank");
        }
        if !seen.insert(entry.account_address.as_str()) {
            errors.add(
                &format!("{}.account_address", field),
                "appears more than once",
            );
        }
    }
}

/// Stable idempotency hash over (action, source, source_idempk, update_idempk?)
pub fn idempotency_hash(
    action: CommandAction,
    source: &str,
    source_idempk: &str,
    update_idempk: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_idempk.as_bytes());
    if let Some(update_idempk) = update_idempk {
        hasher.update([0u8]);
        hasher.update(update_idempk.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_account_params() -> serde_json::Value {
        json!({
            "action": "create_account",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "acct-1",
            "payload": {
                "address": "cash:1",
                "type": "asset",
                "currency": "EUR",
                "name": "Cash"
            }
        })
    }

    #[test]
    fn parses_create_account_params() {
        let map = parse_params(&create_account_params()).unwrap();
        assert_eq!(map.action(), CommandAction::CreateAccount);
        assert_eq!(map.instance_address(), "inst1");
        assert_eq!(map.source(), "api");
        match map {
            CommandMap::CreateAccount(account_map) => {
                assert_eq!(account_map.payload.address, "cash:1");
                assert_eq!(account_map.payload.account_type, AccountType::Asset);
                assert_eq!(account_map.payload.currency, "EUR");
            }
            other => panic!("wrong shape: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_action() {
        let params = json!({"action": "delete_everything", "instance_address": "inst1"});
        match parse_params(&params) {
            Err(Error::ActionNotSupported(action)) => assert_eq!(action, "delete_everything"),
            other => panic!("expected ActionNotSupported, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_action() {
        let params = json!({"instance_address": "inst1"});
        assert!(matches!(
            parse_params(&params),
            Err(Error::ActionNotSupported(_))
        ));
    }

    #[test]
    fn ignores_unknown_top_level_keys() {
        let mut params = create_account_params();
        params["extra_key"] = json!("ignored");
        assert!(parse_params(&params).is_ok());
    }

    #[test]
    fn rejects_bad_source_format() {
        let mut params = create_account_params();
        params["source"] = json!("NOT VALID!");
        match parse_params(&params) {
            Err(Error::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.field == "source"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn source_must_be_at_least_two_chars() {
        let mut params = create_account_params();
        params["source"] = json!("a");
        assert!(matches!(parse_params(&params), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_overlong_source_idempk() {
        let mut params = create_account_params();
        params["source_idempk"] = json!("x".repeat(129));
        assert!(matches!(parse_params(&params), Err(Error::Validation(_))));
    }

    #[test]
    fn transaction_create_requires_two_distinct_entries() {
        let params = json!({
            "action": "create_transaction",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "tx-1",
            "payload": {
                "status": "pending",
                "entries": [
                    {"account_address": "cash:1", "amount": 100, "currency": "EUR"}
                ]
            }
        });
        match parse_params(&params) {
            Err(Error::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.field == "payload.entries"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn transaction_create_rejects_duplicate_addresses() {
        let params = json!({
            "action": "create_transaction",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "tx-1",
            "payload": {
                "status": "pending",
                "entries": [
                    {"account_address": "cash:1", "amount": 100, "currency": "EUR"},
                    {"account_address": "cash:1", "amount": -100, "currency": "EUR"}
                ]
            }
        });
        match parse_params(&params) {
            Err(Error::Validation(errors)) => {
                assert!(errors
                    .iter()
                    .any(|e| e.message == "appears more than once"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn transaction_create_rejects_archived_status() {
        let params = json!({
            "action": "create_transaction",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "tx-1",
            "payload": {
                "status": "archived",
                "entries": [
                    {"account_address": "cash:1", "amount": 100, "currency": "EUR"},
                    {"account_address": "equity:1", "amount": 100, "currency": "EUR"}
                ]
            }
        });
        assert!(matches!(parse_params(&params), Err(Error::Validation(_))));
    }

    #[test]
    fn update_transaction_requires_update_idempk() {
        let params = json!({
            "action": "update_transaction",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "tx-1",
            "payload": {"status": "posted"}
        });
        match parse_params(&params) {
            Err(Error::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.field == "update_idempk"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn update_transaction_entries_are_optional() {
        let params = json!({
            "action": "update_transaction",
            "instance_address": "inst1",
            "source": "api",
            "source_idempk": "tx-1",
            "update_idempk": "u1",
            "payload": {"status": "posted"}
        });
        let map = parse_params(&params).unwrap();
        assert_eq!(map.action(), CommandAction::UpdateTransaction);
    }

    #[test]
    fn command_map_round_trips_through_json() {
        let map = parse_params(&create_account_params()).unwrap();
        let value = map.to_value().unwrap();
        assert_eq!(value["action"], "create_account");
        let decoded = CommandMap::from_value(&value).unwrap();
        assert_eq!(decoded.action(), CommandAction::CreateAccount);
        assert_eq!(decoded.idempotency_hash(), map.idempotency_hash());
    }

    #[test]
    fn idempotency_hash_is_stable_and_distinguishes_keys() {
        let base = idempotency_hash(CommandAction::CreateTransaction, "api", "tx-1", None);
        assert_eq!(
            base,
            idempotency_hash(CommandAction::CreateTransaction, "api", "tx-1", None)
        );
        assert_ne!(
            base,
            idempotency_hash(CommandAction::UpdateTransaction, "api", "tx-1", None)
        );
        assert_ne!(
            base,
            idempotency_hash(CommandAction::CreateTransaction, "api", "tx-2", None)
        );
        assert_ne!(
            base,
            idempotency_hash(CommandAction::CreateTransaction, "api", "tx-1", Some("u1"))
        );
    }
}

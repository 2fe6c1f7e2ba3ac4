//! Domain models for Tally

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A ledger tenant: a self-contained set of accounts and transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    /// Unique human key
    pub address: String,
    /// Opaque tenant configuration
    pub config: Option<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account types in the standard chart of accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Liability => "liability",
            Self::Equity => "equity",
            Self::Revenue => "revenue",
            Self::Expense => "expense",
        }
    }

    /// The normal balance conventionally carried by this account type
    pub fn normal_balance(&self) -> NormalBalance {
        match self {
            Self::Asset | Self::Expense => NormalBalance::Debit,
            Self::Liability | Self::Equity | Self::Revenue => NormalBalance::Credit,
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asset" => Ok(Self::Asset),
            "liability" => Ok(Self::Liability),
            "equity" => Ok(Self::Equity),
            "revenue" => Ok(Self::Revenue),
            "expense" => Ok(Self::Expense),
            _ => Err(format!("Unknown account type: {}", s)),
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side increases an account's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalBalance {
    Debit,
    Credit,
}

impl NormalBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::str::FromStr for NormalBalance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            _ => Err(format!("Unknown normal balance: {}", s)),
        }
    }
}

impl std::fmt::Display for NormalBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Debit/credit side of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            _ => Err(format!("Unknown entry type: {}", s)),
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An embedded debit/credit pair with its derived signed amount.
///
/// `amount = debit - credit` for debit-normal accounts and
/// `credit - debit` for credit-normal accounts. The posted balance only
/// ever grows; pending balances are additionally reversed (by subtraction)
/// when a held transaction is rewritten or leaves the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub amount: i64,
    pub debit: i64,
    pub credit: i64,
}

impl Balance {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Add an entry to this balance and recompute the signed amount
    pub fn apply(&mut self, entry_type: EntryType, amount: i64, normal: NormalBalance) {
        match entry_type {
            EntryType::Debit => self.debit += amount,
            EntryType::Credit => self.credit += amount,
        }
        self.recompute(normal);
    }

    /// Undo a previously applied entry. Only valid for pending balances;
    /// posted debit/credit totals are monotonic.
    pub fn reverse(&mut self, entry_type: EntryType, amount: i64, normal: NormalBalance) {
        match entry_type {
            EntryType::Debit => self.debit -= amount,
            EntryType::Credit => self.credit -= amount,
        }
        self.recompute(normal);
    }

    fn recompute(&mut self, normal: NormalBalance) {
        self.amount = match normal {
            NormalBalance::Debit => self.debit - self.credit,
            NormalBalance::Credit => self.credit - self.debit,
        };
    }
}

/// A balance holder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub instance_id: i64,
    /// Unique per instance; immutable
    pub address: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub account_type: AccountType,
    /// Derived from `account_type` unless explicitly overridden at creation
    pub normal_balance: NormalBalance,
    /// Immutable
    pub currency: String,
    /// Whether `available` may drop below zero
    pub allowed_negative: bool,
    pub posted: Balance,
    pub pending: Balance,
    pub available: i64,
    /// Opaque caller metadata
    pub context: Option<serde_json::Value>,
    /// Monotonic integer for optimistic concurrency control
    pub lock_version: i64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Available funds given posted and pending balances.
    ///
    /// Pending amounts on the account's reducing side reserve funds;
    /// pending amounts on the increasing side do not count until posted.
    /// The formula reads `normal_balance` only, never `account_type`.
    pub fn available_from(normal: NormalBalance, posted: &Balance, pending: &Balance) -> i64 {
        match normal {
            NormalBalance::Debit => posted.amount - pending.credit,
            NormalBalance::Credit => posted.amount - pending.debit,
        }
    }

    /// Recompute `available` from the current posted/pending balances
    pub fn computed_available(&self) -> i64 {
        Self::available_from(self.normal_balance, &self.posted, &self.pending)
    }
}

/// Lifecycle of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Posted,
    Archived,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Posted => "posted",
            Self::Archived => "archived",
        }
    }

    /// Posted and archived are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted | Self::Archived)
    }

    /// Legal status transitions: pending may stay pending (entry rewrite),
    /// post, or archive. Terminal states admit nothing.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Pending | Self::Posted | Self::Archived
            ),
            Self::Posted | Self::Archived => false,
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "posted" => Ok(Self::Posted),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A double-entry transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub instance_id: i64,
    pub status: TransactionStatus,
    pub posted_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A committed debit or credit against an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub transaction_id: i64,
    pub account_id: i64,
    pub entry_type: EntryType,
    /// Always positive; the sign lives in `entry_type`
    pub amount: i64,
    pub currency: String,
    pub inserted_at: DateTime<Utc>,
}

/// Common shape of proposed (not yet persisted) and committed entries.
///
/// Validators that check balance equality and currency agreement accept
/// either through this trait.
pub trait Entryable {
    fn entry_type(&self) -> EntryType;
    fn amount(&self) -> i64;
    fn currency(&self) -> &str;
    fn account_id(&self) -> i64;
}

impl Entryable for Entry {
    fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    fn amount(&self) -> i64 {
        self.amount
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn account_id(&self) -> i64 {
        self.account_id
    }
}

/// Append-only snapshot of an account's balances after an entry applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceHistoryEntry {
    pub id: i64,
    pub account_id: i64,
    pub entry_id: i64,
    pub posted: Balance,
    pub pending: Balance,
    pub available: i64,
    pub inserted_at: DateTime<Utc>,
}

/// An immutable write-ahead record of caller intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub instance_id: i64,
    /// Opaque JSON with an `action` discriminator; never mutated
    pub command_map: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
}

/// Lifecycle states of a command queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    OccTimeout,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::OccTimeout => "occ_timeout",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Statuses a processor may claim from
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::OccTimeout)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::DeadLetter)
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "occ_timeout" => Ok(Self::OccTimeout),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("Unknown queue status: {}", s)),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A diagnostic recorded against a queue item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueError {
    pub message: String,
    pub inserted_at: DateTime<Utc>,
}

/// Mutable lifecycle partner of a Command (1:1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandQueueItem {
    pub id: i64,
    pub command_id: i64,
    pub status: QueueStatus,
    pub processor_id: Option<String>,
    pub processor_version: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    /// Scheduler retries; persists across cycles
    pub retry_count: i64,
    /// In-command OCC conflicts; reset on each fresh claim
    pub occ_retry_count: i64,
    pub next_retry_after: Option<DateTime<Utc>>,
    /// Most recent first
    pub errors: Vec<QueueError>,
    /// Monotonic integer guarding the claim compare-and-set
    pub lock_version: i64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit record of a successful command projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub id: i64,
    pub instance_id: i64,
    /// Snapshot of the command map that produced this event
    pub command_map: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
}

/// Resolves an update command to the still-pending transaction it targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransactionLookup {
    pub instance_id: i64,
    pub source: String,
    pub source_idempk: String,
    pub command_id: i64,
    pub transaction_id: i64,
    pub journal_event_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_normal_balance_derivation() {
        assert_eq!(AccountType::Asset.normal_balance(), NormalBalance::Debit);
        assert_eq!(AccountType::Expense.normal_balance(), NormalBalance::Debit);
        assert_eq!(
            AccountType::Liability.normal_balance(),
            NormalBalance::Credit
        );
        assert_eq!(AccountType::Equity.normal_balance(), NormalBalance::Credit);
        assert_eq!(AccountType::Revenue.normal_balance(), NormalBalance::Credit);
    }

    #[test]
    fn balance_apply_debit_normal() {
        let mut balance = Balance::zero();
        balance.apply(EntryType::Debit, 1000, NormalBalance::Debit);
        assert_eq!(
            balance,
            Balance {
                amount: 1000,
                debit: 1000,
                credit: 0
            }
        );

        balance.apply(EntryType::Credit, 300, NormalBalance::Debit);
        assert_eq!(
            balance,
            Balance {
                amount: 700,
                debit: 1000,
                credit: 300
            }
        );
    }

    #[test]
    fn balance_apply_credit_normal() {
        let mut balance = Balance::zero();
        balance.apply(EntryType::Credit, 1000, NormalBalance::Credit);
        assert_eq!(
            balance,
            Balance {
                amount: 1000,
                debit: 0,
                credit: 1000
            }
        );

        balance.apply(EntryType::Debit, 400, NormalBalance::Credit);
        assert_eq!(
            balance,
            Balance {
                amount: 600,
                debit: 400,
                credit: 1000
            }
        );
    }

    #[test]
    fn balance_reverse_undoes_apply() {
        let mut balance = Balance::zero();
        balance.apply(EntryType::Credit, 100, NormalBalance::Debit);
        balance.reverse(EntryType::Credit, 100, NormalBalance::Debit);
        assert_eq!(balance, Balance::zero());
    }

    #[test]
    fn available_debit_normal_subtracts_pending_credit() {
        let posted = Balance {
            amount: 1000,
            debit: 1000,
            credit: 0,
        };
        let pending = Balance {
            amount: -100,
            debit: 0,
            credit: 100,
        };
        assert_eq!(
            Account::available_from(NormalBalance::Debit, &posted, &pending),
            900
        );
    }

    #[test]
    fn available_credit_normal_subtracts_pending_debit() {
        let posted = Balance {
            amount: 1000,
            debit: 0,
            credit: 1000,
        };
        let pending = Balance {
            amount: -100,
            debit: 100,
            credit: 0,
        };
        assert_eq!(
            Account::available_from(NormalBalance::Credit, &posted, &pending),
            900
        );
    }

    #[test]
    fn available_ignores_incoming_pending_side() {
        // A pending debit on a debit-normal account does not increase
        // available until posted.
        let posted = Balance {
            amount: 500,
            debit: 500,
            credit: 0,
        };
        let pending = Balance {
            amount: 200,
            debit: 200,
            credit: 0,
        };
        assert_eq!(
            Account::available_from(NormalBalance::Debit, &posted, &pending),
            500
        );
    }

    #[test]
    fn transaction_status_transitions() {
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Pending));
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Posted));
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Archived));
        assert!(!TransactionStatus::Posted.can_transition_to(TransactionStatus::Archived));
        assert!(!TransactionStatus::Posted.can_transition_to(TransactionStatus::Posted));
        assert!(!TransactionStatus::Archived.can_transition_to(TransactionStatus::Pending));
    }

    #[test]
    fn queue_status_claimable_set() {
        assert!(QueueStatus::Pending.is_claimable());
        assert!(QueueStatus::Failed.is_claimable());
        assert!(QueueStatus::OccTimeout.is_claimable());
        assert!(!QueueStatus::Processing.is_claimable());
        assert!(!QueueStatus::Processed.is_claimable());
        assert!(!QueueStatus::DeadLetter.is_claimable());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in ["pending", "posted", "archived"] {
            let parsed: TransactionStatus = status.parse().unwrap();
            assert_eq!(parsed.as_str(), status);
        }
        for status in [
            "pending",
            "processing",
            "processed",
            "failed",
            "occ_timeout",
            "dead_letter",
        ] {
            let parsed: QueueStatus = status.parse().unwrap();
            assert_eq!(parsed.as_str(), status);
        }
    }
}

//! Double-entry posting engine
//!
//! Callers express intent as signed amounts against account addresses.
//! Sign normalization turns each intent into a typed debit/credit entry in
//! the account's own normal-balance terms: a positive amount grows the
//! account, a negative amount shrinks it. Posting then applies the
//! transition table for the transaction's status change, account by
//! account: write the entry, move the balances under a lock_version
//! compare-and-set, and snapshot the result into balance history.
//!
//! All functions here expect to run inside the caller's write transaction;
//! the account snapshots they receive were read *before* that transaction
//! began, which is what makes a concurrent writer visible as a stale
//! lock_version.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

use crate::command::{EntryData, ValidationErrors};
use crate::db::{accounts, transactions};
use crate::error::{Error, Result};
use crate::models::{
    Account, Balance, Entry, EntryType, Entryable, NormalBalance, Transaction, TransactionStatus,
};

/// A sign-normalized entry that has not been persisted yet
#[derive(Debug, Clone)]
pub struct ProposedEntry {
    pub account_id: i64,
    pub entry_type: EntryType,
    /// Always positive
    pub amount: i64,
    pub currency: String,
}

impl Entryable for ProposedEntry {
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

/// Normalize a signed caller intent into a typed entry against an account.
///
/// Debit-normal accounts turn positive amounts into debits; credit-normal
/// accounts turn positive amounts into credits. The entry currency must
/// match the account currency exactly.
pub fn normalize_entry(account: &Account, data: &EntryData) -> Result<ProposedEntry> {
    if data.currency != account.currency {
        return Err(Error::Validation(ValidationErrors::single(
            "payload.entries",
            &format!(
                "currency {} does not match account {} currency {}",
                data.currency, account.address, account.currency
            ),
        )));
    }

    let positive = data.amount > 0;
    let entry_type = match account.normal_balance {
        NormalBalance::Debit => {
            if positive {
                EntryType::Debit
            } else {
                EntryType::Credit
            }
        }
        NormalBalance::Credit => {
            if positive {
                EntryType::Credit
            } else {
                EntryType::Debit
            }
        }
    };

    Ok(ProposedEntry {
        account_id: account.id,
        entry_type,
        amount: data.amount.abs(),
        currency: account.currency.clone(),
    })
}

/// Verify the double-entry invariant: per currency, the debit total equals
/// the credit total. Accepts proposed and committed entries alike.
pub fn check_balanced<E: Entryable>(entries: &[E]) -> Result<()> {
    let mut totals: HashMap<&str, (i64, i64)> = HashMap::new();

    for entry in entries {
        let total = totals.entry(entry.currency()).or_insert((0, 0));
        match entry.entry_type() {
            EntryType::Debit => total.0 += entry.amount(),
            EntryType::Credit => total.1 += entry.amount(),
        }
    }

    for (currency, (debits, credits)) in &totals {
        if debits != credits {
            return Err(Error::Validation(ValidationErrors::single(
                "payload.entries",
                &format!(
                    "unbalanced in {}: debits {} != credits {}",
                    currency, debits, credits
                ),
            )));
        }
    }

    Ok(())
}

/// Result of posting a new transaction
#[derive(Debug, Clone)]
pub struct PostingOutcome {
    pub transaction: Transaction,
    pub entries: Vec<Entry>,
}

/// Create a transaction with the requested status and apply every entry.
///
/// `entries` pairs each normalized entry with the account snapshot it was
/// computed from. Pending transactions hold their amounts on the pending
/// balance; posted transactions go straight to the posted balance.
pub fn post_new_transaction(
    conn: &Connection,
    instance_id: i64,
    status: TransactionStatus,
    entries: &[(Account, ProposedEntry)],
) -> Result<PostingOutcome> {
    let posted_at = match status {
        TransactionStatus::Posted => Some(Utc::now()),
        _ => None,
    };
    let transaction = transactions::insert_transaction(conn, instance_id, status, posted_at)?;

    let mut committed = Vec::with_capacity(entries.len());
    for (account, proposed) in entries {
        let entry = transactions::insert_entry(
            conn,
            transaction.id,
            account.id,
            proposed.entry_type,
            proposed.amount,
            &proposed.currency,
        )?;

        let (posted, pending) = match status {
            TransactionStatus::Pending => changed_balances(account, |_, pending, normal| {
                pending.apply(proposed.entry_type, proposed.amount, normal);
            }),
            _ => changed_balances(account, |posted, _, normal| {
                posted.apply(proposed.entry_type, proposed.amount, normal);
            }),
        };

        write_account_change(conn, account, entry.id, posted, pending)?;
        committed.push(entry);
    }

    debug!(
        transaction_id = transaction.id,
        status = %status,
        entries = committed.len(),
        "transaction posted"
    );

    Ok(PostingOutcome {
        transaction,
        entries: committed,
    })
}

/// Apply an update to a still-pending transaction.
///
/// `updates` is position-matched to `old_entries`: each element carries a
/// fresh account snapshot and the effective new entry for that position
/// (the old value when the update did not rewrite entries). The pending
/// side always reverses the old amounts; where the new amounts land
/// depends on the target status.
pub fn apply_pending_update(
    conn: &Connection,
    transaction: &Transaction,
    old_entries: &[Entry],
    updates: &[(Account, ProposedEntry)],
    next_status: TransactionStatus,
) -> Result<Vec<Entry>> {
    if transaction.status != TransactionStatus::Pending {
        return Err(Error::InvalidTransition(format!(
            "transaction {} is {}; only pending transactions can be updated",
            transaction.id, transaction.status
        )));
    }

    let posted_at = match next_status {
        TransactionStatus::Posted => Some(Utc::now()),
        _ => None,
    };
    transactions::set_transaction_status(
        conn,
        transaction.id,
        TransactionStatus::Pending,
        next_status,
        posted_at,
    )?;

    let mut current = Vec::with_capacity(old_entries.len());
    for (old, (account, new)) in old_entries.iter().zip(updates) {
        let (posted, pending) = match next_status {
            TransactionStatus::Pending => changed_balances(account, |_, pending, normal| {
                pending.reverse(old.entry_type, old.amount, normal);
                pending.apply(new.entry_type, new.amount, normal);
            }),
            TransactionStatus::Posted => changed_balances(account, |posted, pending, normal| {
                pending.reverse(old.entry_type, old.amount, normal);
                posted.apply(new.entry_type, new.amount, normal);
            }),
            TransactionStatus::Archived => changed_balances(account, |_, pending, normal| {
                pending.reverse(old.entry_type, old.amount, normal);
            }),
        };

        // Archiving keeps the entry values as written; other targets may
        // carry a rewrite.
        if next_status != TransactionStatus::Archived
            && (new.entry_type != old.entry_type || new.amount != old.amount)
        {
            transactions::update_entry_value(conn, old.id, new.entry_type, new.amount)?;
        }

        write_account_change(conn, account, old.id, posted, pending)?;

        let mut entry = old.clone();
        if next_status != TransactionStatus::Archived {
            entry.entry_type = new.entry_type;
            entry.amount = new.amount;
        }
        current.push(entry);
    }

    debug!(
        transaction_id = transaction.id,
        next_status = %next_status,
        "pending transaction updated"
    );

    Ok(current)
}

/// Clone the account's balances, run the mutation, and return the result
fn changed_balances(
    account: &Account,
    change: impl FnOnce(&mut Balance, &mut Balance, NormalBalance),
) -> (Balance, Balance) {
    let mut posted = account.posted;
    let mut pending = account.pending;
    change(&mut posted, &mut pending, account.normal_balance);
    (posted, pending)
}

/// Enforce the available-funds rule, write the balances under the
/// account's lock_version, and snapshot the result into balance history.
fn write_account_change(
    conn: &Connection,
    account: &Account,
    entry_id: i64,
    posted: Balance,
    pending: Balance,
) -> Result<()> {
    let available = Account::available_from(account.normal_balance, &posted, &pending);
    if !account.allowed_negative && available < 0 {
        return Err(Error::NegativeBalance {
            address: account.address.clone(),
            available,
        });
    }

    accounts::update_account_balances(
        conn,
        account.id,
        account.lock_version,
        &posted,
        &pending,
        available,
    )?;
    transactions::insert_balance_history(conn, account.id, entry_id, &posted, &pending, available)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountType;
    use chrono::Utc;

    fn account(normal: NormalBalance, posted: Balance, pending: Balance) -> Account {
        let available = Account::available_from(normal, &posted, &pending);
        Account {
            id: 1,
            instance_id: 1,
            address: "cash:1".to_string(),
            name: None,
            description: None,
            account_type: AccountType::Asset,
            normal_balance: normal,
            currency: "EUR".to_string(),
            allowed_negative: false,
            posted,
            pending,
            available,
            context: None,
            lock_version: 0,
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn entry_data(amount: i64) -> EntryData {
        EntryData {
            account_address: "cash:1".to_string(),
            amount,
            currency: "EUR".to_string(),
        }
    }

    #[test]
    fn normalize_positive_amount_on_debit_normal_is_debit() {
        let account = account(NormalBalance::Debit, Balance::zero(), Balance::zero());
        let entry = normalize_entry(&account, &entry_data(1000)).unwrap();
        assert_eq!(entry.entry_type, EntryType::Debit);
        assert_eq!(entry.amount, 1000);
    }

    #[test]
    fn normalize_negative_amount_on_debit_normal_is_credit() {
        let account = account(NormalBalance::Debit, Balance::zero(), Balance::zero());
        let entry = normalize_entry(&account, &entry_data(-100)).unwrap();
        assert_eq!(entry.entry_type, EntryType::Credit);
        assert_eq!(entry.amount, 100);
    }

    #[test]
    fn normalize_positive_amount_on_credit_normal_is_credit() {
        let account = account(NormalBalance::Credit, Balance::zero(), Balance::zero());
        let entry = normalize_entry(&account, &entry_data(1000)).unwrap();
        assert_eq!(entry.entry_type, EntryType::Credit);
        assert_eq!(entry.amount, 1000);
    }

    #[test]
    fn normalize_negative_amount_on_credit_normal_is_debit() {
        let account = account(NormalBalance::Credit, Balance::zero(), Balance::zero());
        let entry = normalize_entry(&account, &entry_data(-100)).unwrap();
        assert_eq!(entry.entry_type, EntryType::Debit);
        assert_eq!(entry.amount, 100);
    }

    #[test]
    fn normalize_follows_overridden_normal_balance() {
        // An asset account explicitly overridden to credit-normal behaves
        // like any credit-normal account.
        let mut overridden = account(NormalBalance::Credit, Balance::zero(), Balance::zero());
        overridden.account_type = AccountType::Asset;
        let entry = normalize_entry(&overridden, &entry_data(500)).unwrap();
        assert_eq!(entry.entry_type, EntryType::Credit);
    }

    #[test]
    fn normalize_rejects_currency_mismatch() {
        let account = account(NormalBalance::Debit, Balance::zero(), Balance::zero());
        let mut data = entry_data(100);
        data.currency = "USD".to_string();
        assert!(matches!(
            normalize_entry(&account, &data),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn balanced_entries_pass() {
        let entries = vec![
            ProposedEntry {
                account_id: 1,
                entry_type: EntryType::Debit,
                amount: 1000,
                currency: "EUR".to_string(),
            },
            ProposedEntry {
                account_id: 2,
                entry_type: EntryType::Credit,
                amount: 1000,
                currency: "EUR".to_string(),
            },
        ];
        assert!(check_balanced(&entries).is_ok());
    }

    #[test]
    fn unbalanced_entries_fail() {
        let entries = vec![
            ProposedEntry {
                account_id: 1,
                entry_type: EntryType::Debit,
                amount: 1000,
                currency: "EUR".to_string(),
            },
            ProposedEntry {
                account_id: 2,
                entry_type: EntryType::Credit,
                amount: 999,
                currency: "EUR".to_string(),
            },
        ];
        assert!(matches!(
            check_balanced(&entries),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn balance_is_checked_per_currency() {
        // Balanced in total but not per currency.
        let entries = vec![
            ProposedEntry {
                account_id: 1,
                entry_type: EntryType::Debit,
                amount: 1000,
                currency: "EUR".to_string(),
            },
            ProposedEntry {
                account_id: 2,
                entry_type: EntryType::Credit,
                amount: 1000,
                currency: "USD".to_string(),
            },
        ];
        assert!(matches!(
            check_balanced(&entries),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn symmetric_normalization_balances_a_transfer() {
        // The same signed intent against a debit-normal and a credit-normal
        // account lands on opposite sides, which is what keeps the caller's
        // "add 1000 to both" balanced.
        let cash = account(NormalBalance::Debit, Balance::zero(), Balance::zero());
        let equity = account(NormalBalance::Credit, Balance::zero(), Balance::zero());

        let entries = vec![
            normalize_entry(&cash, &entry_data(1000)).unwrap(),
            normalize_entry(&equity, &entry_data(1000)).unwrap(),
        ];
        assert!(check_balanced(&entries).is_ok());
    }
}

//! Database tests

use super::*;
use crate::models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{parse_params, CommandMap};
    use rusqlite::params;
    use serde_json::json;

    fn account_create_map(instance_address: &str, idempk: &str) -> CommandMap {
        parse_params(&json!({
            "action": "create_account",
            "instance_address": instance_address,
            "source": "api",
            "source_idempk": idempk,
            "payload": {"address": "cash:1", "type": "asset", "currency": "EUR"}
        }))
        .unwrap()
    }

    #[test]
    fn test_in_memory_db() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_instance_by_address("inst1").unwrap().is_none());
        assert!(db.list_queue_items().unwrap().is_empty());
    }

    #[test]
    fn test_schema_prefix_namespaces_the_store() {
        let config = crate::config::Config {
            schema_prefix: "tenant_a".to_string(),
            ..crate::config::Config::default()
        };
        let path = format!("/tmp/tally_prefix_{}.db", std::process::id());
        let _ = std::fs::remove_file(format!("/tmp/tenant_a_tally_prefix_{}.db", std::process::id()));

        let db = Database::open(&path, &config).unwrap();
        assert!(
            db.path().ends_with(&format!("tenant_a_tally_prefix_{}.db", std::process::id())),
            "prefix missing from {}",
            db.path()
        );
    }

    #[test]
    fn test_schema_tables_exist() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();

        for table in [
            "instances",
            "accounts",
            "entries",
            "transactions",
            "balance_history_entries",
            "commands",
            "command_queue_items",
            "journal_events",
            "journal_event_command_links",
            "journal_event_transaction_links",
            "journal_event_account_links",
            "pending_transaction_lookup",
            "idempotency_keys",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_queue_item_schema_columns() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('command_queue_items') \
                 WHERE name IN ('id', 'command_id', 'status', 'processor_id', 'processor_version', \
                                'processing_started_at', 'processing_completed_at', 'retry_count', \
                                'occ_retry_count', 'next_retry_after', 'errors', 'lock_version')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 12, "command_queue_items should have 12 expected columns");
    }

    #[test]
    fn test_instance_address_unique() {
        let db = Database::in_memory().unwrap();
        db.create_instance("inst1", None).unwrap();
        assert!(db.create_instance("inst1", None).is_err());
    }

    #[test]
    fn test_instance_delete_protection() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();

        let conn = db.conn().unwrap();
        conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![instance.id],
        )
        .unwrap();
        drop(conn);

        assert!(matches!(
            db.delete_instance(instance.id),
            Err(crate::error::Error::InstanceInUse(_))
        ));
    }

    #[test]
    fn test_account_address_unique_per_instance() {
        let db = Database::in_memory().unwrap();
        let inst1 = db.create_instance("inst1", None).unwrap();
        let inst2 = db.create_instance("inst2", None).unwrap();
        let conn = db.conn().unwrap();

        conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![inst1.id],
        )
        .unwrap();

        // Same address in another instance is fine
        conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![inst2.id],
        )
        .unwrap();

        // Duplicate within the instance is refused
        let result = conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![inst1.id],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_insert_command_refuses_duplicates() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");

        let (command, queue_item) = db.insert_command(instance.id, &map).unwrap();
        assert_eq!(queue_item.status, QueueStatus::Pending);
        assert_eq!(queue_item.command_id, command.id);

        match db.insert_command(instance.id, &map) {
            Err(crate::error::Error::Duplicate(existing)) => assert_eq!(existing, command.id),
            other => panic!("expected Duplicate, got {:?}", other.map(|_| ())),
        }

        // The refused insert left no partial state behind
        let conn = db.conn().unwrap();
        let commands: i64 = conn
            .query_row("SELECT COUNT(*) FROM commands", [], |row| row.get(0))
            .unwrap();
        assert_eq!(commands, 1);
    }

    #[test]
    fn test_command_map_survives_round_trip() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");

        let (command, _) = db.insert_command(instance.id, &map).unwrap();
        let loaded = db.get_command(command.id).unwrap().unwrap();
        assert_eq!(loaded.command_map["action"], "create_account");
        assert_eq!(loaded.instance_id, instance.id);

        let decoded = CommandMap::from_value(&loaded.command_map).unwrap();
        assert_eq!(decoded.idempotency_hash(), map.idempotency_hash());
    }

    #[test]
    fn test_claim_is_compare_and_set() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.processor_id.as_deref(), Some("event_queue:1"));
        assert!(claimed.processing_started_at.is_some());
        assert_eq!(claimed.retry_count, 0);

        // A second processor holding the stale snapshot loses the race
        assert!(matches!(
            db.claim_queue_item(&queue_item, "event_queue:2", "0.1.0"),
            Err(crate::error::Error::AlreadyClaimed(_))
        ));
    }

    #[test]
    fn test_claim_from_failed_increments_retry_count() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();
        db.mark_failed(claimed.id, "transient", chrono::Utc::now())
            .unwrap();

        let failed = db.get_queue_item(claimed.id).unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 0);

        let reclaimed = db
            .claim_queue_item(&failed, "event_queue:1", "0.1.0")
            .unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.occ_retry_count, 0);
    }

    #[test]
    fn test_claim_resets_occ_retry_count() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();
        db.record_occ_conflict(claimed.id, "OCC conflict detected")
            .unwrap();
        db.record_occ_conflict(claimed.id, "OCC conflict detected")
            .unwrap();
        db.mark_occ_timeout(claimed.id, "OCC retries exhausted", chrono::Utc::now())
            .unwrap();

        let timed_out = db.get_queue_item(claimed.id).unwrap().unwrap();
        assert_eq!(timed_out.status, QueueStatus::OccTimeout);
        assert_eq!(timed_out.occ_retry_count, 2);

        let reclaimed = db
            .claim_queue_item(&timed_out, "event_queue:1", "0.1.0")
            .unwrap();
        assert_eq!(reclaimed.occ_retry_count, 0);
        assert_eq!(reclaimed.retry_count, 1);
    }

    #[test]
    fn test_errors_accumulate_most_recent_first() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();
        db.record_occ_conflict(claimed.id, "first").unwrap();
        db.record_occ_conflict(claimed.id, "second").unwrap();
        db.record_occ_conflict(claimed.id, "third").unwrap();

        let item = db.get_queue_item(claimed.id).unwrap().unwrap();
        let messages: Vec<&str> = item.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_readiness_respects_next_retry_after() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        assert_eq!(db.instances_with_ready_work().unwrap(), vec![instance.id]);

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();

        // Processing items are not ready
        assert!(db.instances_with_ready_work().unwrap().is_empty());

        // Failed with a future retry gate: still not ready
        db.mark_failed(
            claimed.id,
            "transient",
            chrono::Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(db.instances_with_ready_work().unwrap().is_empty());
        assert!(db.next_ready_command(instance.id).unwrap().is_none());

        // Backdate the gate: ready again
        let conn = db.conn().unwrap();
        conn.execute(
            "UPDATE command_queue_items SET next_retry_after = '2020-01-01 00:00:00.000' WHERE id = ?",
            params![claimed.id],
        )
        .unwrap();
        drop(conn);

        assert_eq!(db.instances_with_ready_work().unwrap(), vec![instance.id]);
        assert!(db.next_ready_command(instance.id).unwrap().is_some());
    }

    #[test]
    fn test_next_ready_command_is_oldest_first() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();

        let (first, _) = db
            .insert_command(instance.id, &account_create_map("inst1", "acct-1"))
            .unwrap();
        let (_second, _) = db
            .insert_command(instance.id, &account_create_map("inst1", "acct-2"))
            .unwrap();

        let (next, _) = db.next_ready_command(instance.id).unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[test]
    fn test_dead_letter_is_terminal() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();
        db.mark_dead_letter(claimed.id, "validation failed").unwrap();

        let item = db.get_queue_item(claimed.id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::DeadLetter);
        assert!(item.next_retry_after.is_none());

        // Not ready, not claimable
        assert!(db.next_ready_command(instance.id).unwrap().is_none());
        assert!(matches!(
            db.claim_queue_item(&item, "event_queue:1", "0.1.0"),
            Err(crate::error::Error::AlreadyClaimed(_))
        ));

        let dead = db
            .list_queue_items_by_status(QueueStatus::DeadLetter)
            .unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[test]
    fn test_sweep_stalled_reverts_to_pending() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (_, queue_item) = db.insert_command(instance.id, &map).unwrap();

        let claimed = db
            .claim_queue_item(&queue_item, "event_queue:1", "0.1.0")
            .unwrap();

        // Recent claims are left alone
        assert_eq!(db.sweep_stalled(chrono::Duration::seconds(300)).unwrap(), 0);

        // Backdate the claim far past the stall threshold
        let conn = db.conn().unwrap();
        conn.execute(
            "UPDATE command_queue_items SET processing_started_at = '2020-01-01 00:00:00.000' \
             WHERE id = ?",
            params![claimed.id],
        )
        .unwrap();
        drop(conn);

        assert_eq!(db.sweep_stalled(chrono::Duration::seconds(300)).unwrap(), 1);

        let item = db.get_queue_item(claimed.id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.errors[0].message.contains("stalled"));
    }

    #[test]
    fn test_account_balance_write_detects_stale_version() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let conn = db.conn().unwrap();

        conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![instance.id],
        )
        .unwrap();
        let account_id = conn.last_insert_rowid();

        let balance = Balance {
            amount: 100,
            debit: 100,
            credit: 0,
        };

        // Correct version succeeds and bumps lock_version
        crate::db::accounts::update_account_balances(&conn, account_id, 0, &balance, &Balance::zero(), 100)
            .unwrap();

        // The old version is now stale
        assert!(matches!(
            crate::db::accounts::update_account_balances(
                &conn,
                account_id,
                0,
                &balance,
                &Balance::zero(),
                100
            ),
            Err(crate::error::Error::StaleVersion(_))
        ));

        let account = db.get_account(account_id).unwrap().unwrap();
        assert_eq!(account.lock_version, 1);
        assert_eq!(account.posted.amount, 100);
    }

    #[test]
    fn test_journal_link_uniqueness() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (command, _) = db.insert_command(instance.id, &map).unwrap();

        let conn = db.conn().unwrap();
        let event = crate::db::journal::insert_journal_event(
            &conn,
            instance.id,
            command.id,
            &command.command_map,
        )
        .unwrap();

        // One command emits at most one journal event
        let second = conn.execute(
            "INSERT INTO journal_events (instance_id, command_map) VALUES (?, '{}')",
            params![instance.id],
        );
        assert!(second.is_ok());
        let second_event_id = conn.last_insert_rowid();
        let dup_link = conn.execute(
            "INSERT INTO journal_event_command_links (journal_event_id, command_id) VALUES (?, ?)",
            params![second_event_id, command.id],
        );
        assert!(dup_link.is_err(), "command link must be unique per command");

        // One journal event maps to at most one account link
        conn.execute(
            "INSERT INTO accounts (instance_id, address, type, normal_balance, currency) \
             VALUES (?, 'cash:1', 'asset', 'debit', 'EUR')",
            params![instance.id],
        )
        .unwrap();
        let account_id = conn.last_insert_rowid();
        crate::db::journal::link_account(&conn, event.id, account_id).unwrap();
        assert!(crate::db::journal::link_account(&conn, event.id, account_id).is_err());
    }

    #[test]
    fn test_pending_lookup_round_trip() {
        let db = Database::in_memory().unwrap();
        let instance = db.create_instance("inst1", None).unwrap();
        let map = account_create_map("inst1", "acct-1");
        let (command, _) = db.insert_command(instance.id, &map).unwrap();

        let conn = db.conn().unwrap();
        conn.execute(
            "INSERT INTO transactions (instance_id, status) VALUES (?, 'pending')",
            params![instance.id],
        )
        .unwrap();
        let transaction_id = conn.last_insert_rowid();

        let lookup = PendingTransactionLookup {
            instance_id: instance.id,
            source: "api".to_string(),
            source_idempk: "tx-1".to_string(),
            command_id: command.id,
            transaction_id,
            journal_event_id: None,
        };
        crate::db::journal::insert_pending_lookup(&conn, &lookup).unwrap();

        // Composite key refuses duplicates
        assert!(crate::db::journal::insert_pending_lookup(&conn, &lookup).is_err());

        let found = db
            .get_pending_lookup(instance.id, "api", "tx-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.transaction_id, transaction_id);

        crate::db::journal::clear_pending_lookup(&conn, instance.id, "api", "tx-1").unwrap();
        assert!(db.get_pending_lookup(instance.id, "api", "tx-1").unwrap().is_none());
    }
}

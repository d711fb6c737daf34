use std::{path::Path, time::Duration};

use rusqlite::{Connection, TransactionBehavior};
use serde_json::{json, Value};
use shelf_audit_lib::{
    aggregate::UnitFilter,
    db::models::{ListOrder, Observation},
    store::ObservationStore,
    StoreConfig, StoreError,
};
use tempfile::tempdir;
use tokio::{sync::oneshot, time::timeout};

fn open(dir: &Path) -> ObservationStore {
    ObservationStore::open(&StoreConfig::in_dir(dir)).unwrap()
}

fn remove_database(dir: &Path) {
    for name in ["data.db", "data.db-wal", "data.db-shm"] {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }
}

fn filter(store: &str, product: &str, product_type: Option<&str>, section: Option<&str>) -> UnitFilter {
    UnitFilter {
        store_name: store.into(),
        product: product.into(),
        product_type: product_type.map(str::to_string),
        section: section.map(str::to_string),
    }
}

fn shelf(store: &str, product: &str, section: &str, start: &str, found: i64) -> Value {
    json!({
        "storeName": store,
        "product": product,
        "productType": "Regular",
        "section": section,
        "startTime": start,
        "pickingFound": found
    })
}

async fn list(store: &ObservationStore) -> Vec<Observation> {
    store.list(ListOrder::Asc).await.unwrap()
}

#[tokio::test]
async fn madrid_resync_is_counted_once() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let record = json!({
        "storeName": "Madrid-1",
        "product": "Shoes",
        "startTime": "09:00",
        "pickingFound": 12
    });

    let first = store.save(&record).await.unwrap();
    let second = store.save(&record).await.unwrap();
    assert_eq!(first.id(), second.id());

    let rows = list(&store).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.picking_found, 12);

    let count = store
        .count_units(filter("Madrid-1", "Shoes", None, None))
        .await
        .unwrap();
    assert_eq!(count.total_units, 12);
}

#[tokio::test]
async fn omitted_fields_take_documented_defaults() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store
        .save(&json!({ "storeName": "Sevilla-2", "product": "Bags" }))
        .await
        .unwrap();

    let row = &list(&store).await[0];
    assert_eq!(row.record.product_type, "N/A");
    assert_eq!(row.record.section, "N/A");
    assert_eq!(row.record.space_pass, "N/A");
    assert_eq!(row.record.observations, "");
    assert_eq!(row.record.picking_found, 0);
    assert_eq!(row.record.devices_failures_time, 0);
    assert_eq!(row.record.receiving_requests, "N/A");
    assert!(!row.flagged_observation);
}

#[tokio::test]
async fn section_insensitive_and_full_tuple_grouping() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    for (product, section, start, found) in [
        ("Shoes", "Entrance", "09:00", 4),
        ("Shoes", "Exit", "09:10", 6),
        ("Bags", "Entrance", "09:20", 3),
        ("Bags", "Exit", "09:30", 8),
    ] {
        store.save(&shelf("A", product, section, start, found)).await.unwrap();
    }
    store.save(&shelf("B", "Shoes", "Entrance", "09:00", 50)).await.unwrap();

    let all_shoes = store.count_units(filter("A", "Shoes", None, None)).await.unwrap();
    let any_shoes = store
        .count_units(filter("A", "Shoes", Some("anything"), Some("anything")))
        .await
        .unwrap();
    assert_eq!(all_shoes.total_units, 10);
    assert_eq!(any_shoes.total_units, 10);

    let entrance = store
        .count_units(filter("A", "Bags", Some("Regular"), Some("Entrance")))
        .await
        .unwrap();
    let exit = store
        .count_units(filter("A", "Bags", Some("Regular"), Some("Exit")))
        .await
        .unwrap();
    assert_eq!(entrance.total_units, 3);
    assert_eq!(exit.total_units, 8);
}

#[tokio::test]
async fn flag_changes_only_the_target_row() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    for minute in 0..8 {
        store
            .save(&shelf("A", "Bags", "Entrance", &format!("10:0{minute}"), minute))
            .await
            .unwrap();
    }
    let before = list(&store).await;
    let target = before[6].id;

    let flagged = store.flag_observation(target, "count looks doubled").await.unwrap();
    assert!(flagged.flagged_observation);
    assert_eq!(flagged.record, before[6].record);

    let after = list(&store).await;
    for (old, new) in before.iter().zip(&after) {
        if old.id == target {
            assert_eq!(old.record, new.record);
            assert!(new.flagged_observation);
        } else {
            assert_eq!(old, new);
        }
    }

    let missing = store.flag_observation(9_999, "typo").await.unwrap_err();
    assert!(matches!(missing, StoreError::NotFound { id: 9_999 }));
    assert_eq!(list(&store).await, after);
}

#[tokio::test]
async fn lost_database_is_restored_with_original_ids() {
    let dir = tempdir().unwrap();
    let original = {
        let store = open(dir.path());
        store.save(&shelf("A", "Bags", "Entrance", "09:00", 3)).await.unwrap();
        store.save(&shelf("A", "Bags", "Exit", "09:05", 5)).await.unwrap();
        let second = list(&store).await[1].id;
        store.flag_observation(second, "wrong aisle").await.unwrap();
        let rows = list(&store).await;
        store.close();
        rows
    };

    remove_database(dir.path());

    let store = open(dir.path());
    assert!(list(&store).await.is_empty());

    let report = store.reconcile().await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.renumbered, 0);
    assert_eq!(report.flags_applied, 1);
    assert_eq!(list(&store).await, original);

    // Second pass over the same log writes nothing.
    let again = store.reconcile().await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(again.flags_applied, 0);
    assert!(!again.changed_table());
    assert_eq!(list(&store).await, original);
}

#[tokio::test]
async fn single_deleted_row_comes_back_under_its_id() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    for (section, start) in [("Entrance", "09:00"), ("Exit", "09:05"), ("Back", "09:10")] {
        store.save(&shelf("A", "Bags", section, start, 1)).await.unwrap();
    }
    let original = list(&store).await;
    let lost = original[1].id;

    store
        .database()
        .execute(move |conn| {
            conn.execute("DELETE FROM observations WHERE id = ?1", [lost])?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(list(&store).await.len(), 2);

    let report = store.reconcile().await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(list(&store).await, original);
}

#[tokio::test]
async fn taken_ids_are_renumbered_on_restore() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.save(&shelf("A", "Bags", "Entrance", "09:00", 3)).await.unwrap();
        store.save(&shelf("A", "Bags", "Exit", "09:05", 5)).await.unwrap();
        store.close();
    }
    remove_database(dir.path());

    let store = open(dir.path());
    // Accepted before reconcile ran, so it takes id 1.
    let fresh = store.save(&shelf("B", "Shoes", "Entrance", "11:00", 9)).await.unwrap();
    assert_eq!(fresh.id(), 1);

    let report = store.reconcile().await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.renumbered, 1);

    let rows = list(&store).await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].record.store_name, "B");
    assert_eq!(rows[1].id, 2);
    assert_eq!(rows[1].record.section, "Exit");
    assert!(rows[2].id > 2);
    assert_eq!(rows[2].record.section, "Entrance");
}

#[tokio::test]
async fn legacy_table_lists_with_defaults_for_new_columns() {
    let dir = tempdir().unwrap();
    {
        let conn = Connection::open(dir.path().join("data.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storeName TEXT, product TEXT, productType TEXT, section TEXT,
                spacePass TEXT, ladderRequired TEXT, size25 TEXT, notLocatedUnits TEXT,
                observations TEXT, startTime TEXT, endTime TEXT,
                pickingTime INTEGER, pickingFound INTEGER, pickingNotFound INTEGER,
                reoperatingTime INTEGER, reoperatingManipulated INTEGER,
                shopfloorTime INTEGER, shopfloorManipulated INTEGER,
                transitsTime INTEGER, devicesFailuresTime INTEGER, status TEXT
            );
            INSERT INTO observations (storeName, product, size25, pickingFound, startTime, status)
            VALUES ('Madrid-1', 'Shoes', 'N/A', 5, '08:00', 'synced');",
        )
        .unwrap();
    }

    let store = open(dir.path());
    store
        .save(&json!({
            "storeName": "Madrid-1",
            "product": "Shoes",
            "startTime": "09:00",
            "pickingFound": 7,
            "receivingRequests": "2"
        }))
        .await
        .unwrap();

    let rows = list(&store).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].record.receiving_requests, "N/A");
    assert_eq!(rows[0].record.size25, 0);
    assert!(!rows[0].flagged_observation);
    assert_eq!(rows[1].record.receiving_requests, "2");

    let count = store
        .count_units(filter("Madrid-1", "Shoes", None, None))
        .await
        .unwrap();
    assert_eq!(count.total_units, 12);
}

#[tokio::test]
async fn rebuild_restores_everything_from_the_log() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.save(&shelf("A", "Bags", "Entrance", "09:00", 3)).await.unwrap();
    store.save(&shelf("A", "Bags", "Exit", "09:05", 5)).await.unwrap();
    let original = list(&store).await;

    let report = store.rebuild().await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(list(&store).await, original);
}

#[tokio::test]
async fn failed_commit_is_not_resurrected_by_reconcile() {
    let dir = tempdir().unwrap();
    let accepted = shelf("A", "Bags", "Exit", "09:05", 5);
    {
        let store = open(dir.path());
        // A deferred foreign key that every new row violates, so the insert
        // and the backup append succeed and only COMMIT fails.
        store
            .database()
            .execute(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                    CREATE TABLE guard (
                        obs_id INTEGER REFERENCES observations(id) DEFERRABLE INITIALLY DEFERRED
                    );
                    CREATE TRIGGER guard_insert AFTER INSERT ON observations BEGIN
                        INSERT INTO guard VALUES (NEW.id + 1000000);
                    END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .save(&shelf("A", "Bags", "Entrance", "09:00", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable { .. }));
        assert!(list(&store).await.is_empty());

        store
            .database()
            .execute(|conn| {
                conn.execute_batch(
                    "DROP TRIGGER guard_insert;
                    DROP TABLE guard;
                    PRAGMA foreign_keys = OFF;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        // The rolled-back insert left the sequence alone.
        let saved = store.save(&accepted).await.unwrap();
        assert_eq!(saved.id(), 1);
        assert_eq!(store.backup_log().read_entries().unwrap().entries.len(), 3);
        store.close();
    }
    remove_database(dir.path());

    let store = open(dir.path());
    let report = store.reconcile().await.unwrap();
    assert_eq!(report.voided, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.renumbered, 0);

    let rows = list(&store).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].record.section, "Exit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_saves_keep_one_row() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let record = shelf("Madrid-1", "Shoes", "Entrance", "09:00", 12);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let record = record.clone();
            tokio::spawn(async move { store.save(&record).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| !o.is_duplicate()).count(), 1);
    assert!(outcomes.iter().all(|o| o.id() == outcomes[0].id()));
    assert_eq!(list(&store).await.len(), 1);
    assert_eq!(store.backup_log().read_entries().unwrap().entries.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_finish_while_a_write_is_held_open() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.save(&shelf("A", "Shoes", "Entrance", "09:00", 3)).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel();
    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .database()
                .execute(move |conn| {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    tx.execute("UPDATE observations SET pickingFound = 100", [])?;
                    let _ = started_tx.send(());
                    std::thread::sleep(Duration::from_millis(1500));
                    tx.commit()?;
                    Ok(())
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let rows = timeout(Duration::from_millis(500), store.list(ListOrder::Asc))
        .await
        .expect("list blocked behind the open write")
        .unwrap();
    assert_eq!(rows[0].record.picking_found, 3);

    let count = timeout(
        Duration::from_millis(500),
        store.count_units(filter("A", "Shoes", None, None)),
    )
    .await
    .expect("count_units blocked behind the open write")
    .unwrap();
    assert_eq!(count.total_units, 3);

    writer.await.unwrap().unwrap();
    assert_eq!(list(&store).await[0].record.picking_found, 100);
}

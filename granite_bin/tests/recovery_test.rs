mod common;

use common::{engine_at, TestEngine};
use std::path::Path;
use strata::database::TableKind;
use strata::Error;
use tempfile::tempdir;
use uuid::Uuid;

/// Simulates the post-crash startup sequence: prime the directory, rebuild
/// the managers and replay the log.
fn crash_and_recover(data_dir: &Path) -> TestEngine {
    let engine = engine_at(data_dir);
    engine.rm.recover().expect("recovering from the log");
    engine
}

fn find(engine: &TestEngine, table: &str, key: i64) -> strata::Result<i64> {
    engine
        .db
        .get_table(table)
        .and_then(|table| table.find(key))
        .map(|entry| entry.value)
}

#[test]
fn committed_inserts_survive_a_crash() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let salt = common::salt();
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    for key in 0..500 {
        engine
            .rm
            .insert(client, "accounts", key, key % salt)
            .unwrap();
    }
    engine.rm.commit(client).unwrap();
    drop(engine); // crash: nothing was flushed or closed

    let engine = crash_and_recover(&data);
    for key in 0..500 {
        assert_eq!(find(&engine, "accounts", key).unwrap(), key % salt);
    }
}

#[test]
fn committed_hash_inserts_survive_a_crash() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let salt = common::salt();
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::Hash, "sessions").unwrap();
    engine.rm.begin(client).unwrap();
    for key in 0..300 {
        engine
            .rm
            .insert(client, "sessions", key, key % salt)
            .unwrap();
    }
    engine.rm.commit(client).unwrap();
    drop(engine);

    let engine = crash_and_recover(&data);
    for key in 0..300 {
        assert_eq!(find(&engine, "sessions", key).unwrap(), key % salt);
    }
}

#[test]
fn uncommitted_work_is_undone_even_past_checkpoints() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let salt = common::salt();
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    for key in 0..500 {
        engine
            .rm
            .insert(client, "accounts", key, key % salt)
            .unwrap();
        if key % 100 == 0 {
            engine.rm.checkpoint().unwrap();
        }
    }
    drop(engine); // crash before commit

    let engine = crash_and_recover(&data);
    for key in 0..500 {
        assert!(matches!(
            find(&engine, "accounts", key),
            Err(Error::NotFound(_))
        ));
    }
    // The undo pass sealed the transaction with a synthetic commit, so no
    // transaction (or lock) lingers.
    assert!(engine.tm.transaction(client).is_none());
}

#[test]
fn work_committed_after_a_checkpoint_is_redone() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    for key in 0..100 {
        engine.rm.insert(client, "accounts", key, key + 1).unwrap();
    }
    engine.rm.checkpoint().unwrap();
    for key in 100..200 {
        engine.rm.insert(client, "accounts", key, key + 1).unwrap();
    }
    engine.rm.commit(client).unwrap();
    drop(engine);

    let engine = crash_and_recover(&data);
    for key in 0..200 {
        assert_eq!(find(&engine, "accounts", key).unwrap(), key + 1);
    }
}

#[test]
fn updates_and_deletes_replay_correctly() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    for key in 0..50 {
        engine.rm.insert(client, "accounts", key, 0).unwrap();
    }
    for key in 0..50 {
        engine.rm.update(client, "accounts", key, key * 10).unwrap();
    }
    for key in 0..25 {
        engine.rm.delete(client, "accounts", key).unwrap();
    }
    engine.rm.commit(client).unwrap();
    drop(engine);

    let engine = crash_and_recover(&data);
    for key in 0..25 {
        assert!(matches!(
            find(&engine, "accounts", key),
            Err(Error::NotFound(_))
        ));
    }
    for key in 25..50 {
        assert_eq!(find(&engine, "accounts", key).unwrap(), key * 10);
    }
}

#[test]
fn aborting_rolls_back_an_insert_update_delete_chain() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    engine.rm.insert(client, "accounts", 0, 0).unwrap();
    engine.rm.update(client, "accounts", 0, 1).unwrap();
    engine.rm.delete(client, "accounts", 0).unwrap();
    engine.rm.rollback(client).unwrap();

    assert!(matches!(
        find(&engine, "accounts", 0),
        Err(Error::NotFound(0))
    ));
    // Rolling back released every lock: a new transaction can write the
    // same key immediately.
    assert!(engine.tm.transaction(client).is_none());
    let next = Uuid::new_v4();
    engine.rm.begin(next).unwrap();
    engine.rm.insert(next, "accounts", 0, 5).unwrap();
    engine.rm.commit(next).unwrap();
    assert_eq!(find(&engine, "accounts", 0).unwrap(), 5);
}

#[test]
fn aborted_work_does_not_reappear_after_recovery() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.begin(client).unwrap();
    engine.rm.insert(client, "accounts", 1, 10).unwrap();
    engine.rm.rollback(client).unwrap();
    drop(engine);

    let engine = crash_and_recover(&data);
    assert!(matches!(
        find(&engine, "accounts", 1),
        Err(Error::NotFound(1))
    ));
}

#[test]
fn rollback_without_a_transaction_is_an_error() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir.path().join("data"));
    assert!(matches!(
        engine.rm.rollback(Uuid::new_v4()),
        Err(Error::NoTransaction)
    ));
}

#[test]
fn table_creations_are_replayed() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let client = Uuid::new_v4();

    let engine = engine_at(&data);
    engine.rm.create_table(TableKind::BTree, "accounts").unwrap();
    engine.rm.create_table(TableKind::Hash, "sessions").unwrap();
    engine.rm.begin(client).unwrap();
    engine.rm.insert(client, "accounts", 1, 2).unwrap();
    engine.rm.insert(client, "sessions", 3, 4).unwrap();
    engine.rm.commit(client).unwrap();
    drop(engine);

    let engine = crash_and_recover(&data);
    assert_eq!(find(&engine, "accounts", 1).unwrap(), 2);
    assert_eq!(find(&engine, "sessions", 3).unwrap(), 4);
}

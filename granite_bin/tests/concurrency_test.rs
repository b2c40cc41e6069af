use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata::lock_manager::{LockMode, ResourceLockManager};
use strata::transaction::TransactionManager;
use strata::Error;
use uuid::Uuid;

fn manager() -> Arc<TransactionManager> {
    Arc::new(TransactionManager::new(Arc::new(ResourceLockManager::new())))
}

#[test]
fn conflicting_writer_blocks_until_commit() {
    let tm = manager();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    tm.begin(first).unwrap();
    tm.begin(second).unwrap();
    tm.lock(first, "t", 0, LockMode::Exclusive).unwrap();

    let (started, ready) = mpsc::channel();
    let tm_clone = Arc::clone(&tm);
    let waiter = thread::spawn(move || {
        started.send(()).unwrap();
        tm_clone.lock(second, "t", 0, LockMode::Exclusive)
    });
    ready.recv().unwrap();
    thread::sleep(Duration::from_millis(50));

    // The writer is still parked; committing the holder lets it through.
    tm.commit(first).unwrap();
    waiter.join().unwrap().unwrap();
    tm.commit(second).unwrap();
}

#[test]
fn readers_share_a_resource() {
    let tm = manager();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    tm.begin(first).unwrap();
    tm.begin(second).unwrap();
    tm.lock(first, "t", 3, LockMode::Shared).unwrap();
    // A second shared lock must not block.
    tm.lock(second, "t", 3, LockMode::Shared).unwrap();
    tm.commit(first).unwrap();
    tm.commit(second).unwrap();
}

#[test]
fn crossed_writers_deadlock() {
    let tm = manager();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    tm.begin(first).unwrap();
    tm.begin(second).unwrap();
    tm.lock(first, "t", 0, LockMode::Exclusive).unwrap();
    tm.lock(second, "t", 1, LockMode::Exclusive).unwrap();

    // First transaction blocks waiting for key 1...
    let tm_clone = Arc::clone(&tm);
    let blocked = thread::spawn(move || tm_clone.lock(first, "t", 1, LockMode::Exclusive));
    thread::sleep(Duration::from_millis(100));

    // ...so the second transaction's request for key 0 closes the cycle.
    assert!(matches!(
        tm.lock(second, "t", 0, LockMode::Exclusive),
        Err(Error::Deadlock)
    ));

    // Aborting the second transaction releases key 1 and unblocks the first.
    tm.commit(second).unwrap();
    blocked.join().unwrap().unwrap();
    tm.commit(first).unwrap();
}

#[test]
fn deadlock_refusal_leaves_no_stale_edges() {
    let tm = manager();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    tm.begin(first).unwrap();
    tm.begin(second).unwrap();
    tm.lock(first, "t", 0, LockMode::Exclusive).unwrap();
    tm.lock(second, "t", 1, LockMode::Exclusive).unwrap();

    let tm_clone = Arc::clone(&tm);
    let blocked = thread::spawn(move || tm_clone.lock(first, "t", 1, LockMode::Exclusive));
    thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        tm.lock(second, "t", 0, LockMode::Exclusive),
        Err(Error::Deadlock)
    ));
    tm.commit(second).unwrap();
    blocked.join().unwrap().unwrap();
    tm.commit(first).unwrap();

    // With the refused request's edges withdrawn, a fresh pair of
    // transactions can take the same locks without phantom deadlocks.
    let third = Uuid::new_v4();
    tm.begin(third).unwrap();
    tm.lock(third, "t", 0, LockMode::Exclusive).unwrap();
    tm.lock(third, "t", 1, LockMode::Exclusive).unwrap();
    tm.commit(third).unwrap();
}

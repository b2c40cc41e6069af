#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use strata::database::Database;
use strata::lock_manager::ResourceLockManager;
use strata::recovery::{self, RecoveryManager};
use strata::transaction::TransactionManager;

/// Random salt mixed into test values so expected values cannot be
/// hardcoded anywhere in the engine.
pub fn salt() -> i64 {
    rand::thread_rng().gen_range(1..=1000)
}

/// The managers a server assembles at startup, bundled for tests.
pub struct TestEngine {
    pub db: Arc<Database>,
    pub tm: Arc<TransactionManager>,
    pub rm: Arc<RecoveryManager>,
}

/// Primes `dir` and builds the database, transaction and recovery managers
/// the same way the server entry point does.
pub fn engine_at(dir: &Path) -> TestEngine {
    let db = Arc::new(recovery::prime(dir).expect("priming the database"));
    let tm = Arc::new(TransactionManager::new(Arc::new(ResourceLockManager::new())));
    let rm = Arc::new(
        RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm)).expect("building recovery manager"),
    );
    TestEngine { db, tm, rm }
}

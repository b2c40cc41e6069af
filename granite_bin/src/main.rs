//! The GraniteDB entry point: primes the data directory, recovers from the
//! write-ahead log and serves the interactive REPL on stdin/stdout.

use std::io;
use std::sync::Arc;

use granite_bin::Session;
use strata::lock_manager::ResourceLockManager;
use strata::recovery::{self, RecoveryManager};
use strata::transaction::TransactionManager;

fn main() -> strata::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir =
        std::env::var("GRANITE_DATA_DIR").unwrap_or_else(|_| "granite_data".to_string());
    let db = Arc::new(recovery::prime(&data_dir)?);
    let lock_manager = Arc::new(ResourceLockManager::new());
    let tm = Arc::new(TransactionManager::new(lock_manager));
    let rm = Arc::new(RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm))?);
    rm.recover()?;

    let session = Session::new(Arc::clone(&db), Arc::clone(&tm), rm);
    let stdin = io::stdin();
    let stdout = io::stdout();
    granite_bin::run(&session, stdin.lock(), stdout.lock(), true)?;

    // A clean exit releases the client's locks and closes every table.
    let _ = tm.commit(session.client);
    db.close()
}

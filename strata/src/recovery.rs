//! The recovery manager: writes an edit record ahead of every change,
//! checkpoints the database, rolls back aborted transactions and replays
//! the log after a crash.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::{Database, Table, TableKind};
use crate::lock_manager::LockMode;
use crate::transaction::TransactionManager;
use crate::wal::{read_log, EditAction, EditRecord, LogRecord, LogWriter};
use crate::{Entry, Error, Result, LOG_FILE_NAME};

struct RecoveryInner {
    log: LogWriter,
    /// Undo stack per uncommitted transaction, newest edit last.
    tx_stack: HashMap<Uuid, Vec<EditRecord>>,
}

/// Couples the write-ahead log with the database and transaction manager.
///
/// Every external mutation goes through this type: the edit record (with
/// old and new values) is forced to the log before the index is touched,
/// and a rejected change is neutralized with a compensating record so the
/// log reads as a no-op pair.
pub struct RecoveryManager {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    log_path: PathBuf,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryManager {
    pub fn new(db: Arc<Database>, tm: Arc<TransactionManager>) -> Result<RecoveryManager> {
        let log_path = db.create_log_file()?;
        let log = LogWriter::open(&log_path)?;
        Ok(RecoveryManager {
            db,
            tm,
            log_path,
            inner: Mutex::new(RecoveryInner {
                log,
                tx_stack: HashMap::new(),
            }),
        })
    }

    // Logging primitives.

    fn log_table(&self, kind: TableKind, name: &str) -> Result<()> {
        self.inner.lock().log.append(&LogRecord::Table {
            kind,
            name: name.to_string(),
        })
    }

    fn log_start(&self, client: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.tx_stack.insert(client, Vec::new());
        inner.log.append(&LogRecord::Start { client })
    }

    fn log_commit(&self, client: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.tx_stack.remove(&client);
        inner.log.append(&LogRecord::Commit { client })
    }

    fn log_edit(&self, record: EditRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .tx_stack
            .entry(record.client)
            .or_default()
            .push(record.clone());
        inner.log.append(&LogRecord::Edit(record))
    }

    /// Logs the inverse of a failed edit so the pair replays as a no-op,
    /// then drops both from the in-memory undo stack.
    fn compensate(&self, client: Uuid, inverse: EditRecord) -> Result<()> {
        self.log_edit(inverse)?;
        let mut inner = self.inner.lock();
        if let Some(stack) = inner.tx_stack.get_mut(&client) {
            stack.truncate(stack.len().saturating_sub(2));
        }
        Ok(())
    }

    // Transactional operations.

    /// Logs and creates a table.
    pub fn create_table(&self, kind: TableKind, name: &str) -> Result<Arc<Table>> {
        self.log_table(kind, name)?;
        self.db.create_table(name, kind)
    }

    /// Starts a transaction for the client, logging the start record first.
    pub fn begin(&self, client: Uuid) -> Result<()> {
        self.log_start(client)?;
        if let Err(err) = self.tm.begin(client) {
            self.rollback(client)?;
            return Err(err);
        }
        Ok(())
    }

    /// Commits the client's transaction, logging the commit record first.
    pub fn commit(&self, client: Uuid) -> Result<()> {
        self.log_commit(client)?;
        if let Err(err) = self.tm.commit(client) {
            self.rollback(client)?;
            return Err(err);
        }
        Ok(())
    }

    /// Reads an entry under a shared lock.
    pub fn find(&self, client: Uuid, table_name: &str, key: i64) -> Result<Entry> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(client, table_name, key, LockMode::Shared)?;
        table.find(key)
    }

    /// Logs and applies an insert inside the client's transaction.
    pub fn insert(&self, client: Uuid, table_name: &str, key: i64, value: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        if table.find(key).is_ok() {
            return Err(Error::DuplicateKey(key));
        }
        self.log_edit(EditRecord {
            client,
            table: table_name.to_string(),
            action: EditAction::Insert,
            key,
            old_value: 0,
            new_value: value,
        })?;
        let applied = self
            .tm
            .lock(client, table_name, key, LockMode::Exclusive)
            .and_then(|()| table.insert(key, value));
        if let Err(err) = applied {
            self.compensate(
                client,
                EditRecord {
                    client,
                    table: table_name.to_string(),
                    action: EditAction::Delete,
                    key,
                    old_value: value,
                    new_value: 0,
                },
            )?;
            self.rollback(client)?;
            return Err(err);
        }
        Ok(())
    }

    /// Logs and applies an update inside the client's transaction.
    pub fn update(&self, client: Uuid, table_name: &str, key: i64, value: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        let old = table.find(key)?;
        self.log_edit(EditRecord {
            client,
            table: table_name.to_string(),
            action: EditAction::Update,
            key,
            old_value: old.value,
            new_value: value,
        })?;
        let applied = self
            .tm
            .lock(client, table_name, key, LockMode::Exclusive)
            .and_then(|()| table.update(key, value));
        if let Err(err) = applied {
            self.compensate(
                client,
                EditRecord {
                    client,
                    table: table_name.to_string(),
                    action: EditAction::Update,
                    key,
                    old_value: value,
                    new_value: old.value,
                },
            )?;
            self.rollback(client)?;
            return Err(err);
        }
        Ok(())
    }

    /// Logs and applies a delete inside the client's transaction.
    pub fn delete(&self, client: Uuid, table_name: &str, key: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        let old = table.find(key)?;
        self.log_edit(EditRecord {
            client,
            table: table_name.to_string(),
            action: EditAction::Delete,
            key,
            old_value: old.value,
            new_value: 0,
        })?;
        let applied = self
            .tm
            .lock(client, table_name, key, LockMode::Exclusive)
            .and_then(|()| table.delete(key));
        if let Err(err) = applied {
            self.compensate(
                client,
                EditRecord {
                    client,
                    table: table_name.to_string(),
                    action: EditAction::Insert,
                    key,
                    old_value: 0,
                    new_value: old.value,
                },
            )?;
            self.rollback(client)?;
            return Err(err);
        }
        Ok(())
    }

    // Checkpointing and recovery.

    /// Flushes every table, appends a checkpoint record naming the running
    /// transactions, then snapshots the data directory to its sibling
    /// recovery directory.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for (name, table) in self.db.tables() {
            debug!(table = %name, "flushing table pages for checkpoint");
            let mut all_pages = table.pager().lock_all_pages();
            all_pages.flush()?;
        }
        let clients: Vec<Uuid> = inner.tx_stack.keys().copied().collect();
        inner.log.append(&LogRecord::Checkpoint { clients })?;
        self.snapshot()
    }

    /// Copies the data directory over the sibling recovery directory.
    fn snapshot(&self) -> Result<()> {
        let base = self.db.base_path();
        let recovery_dir = sibling_recovery_dir(base);
        if recovery_dir.exists() {
            fs::remove_dir_all(&recovery_dir)?;
        }
        copy_dir_all(base, &recovery_dir)
    }

    /// Replays the log after a crash: redo everything from the last
    /// checkpoint's coverage window, then undo every transaction that never
    /// committed, logging the undo and sealing it with a synthetic commit.
    pub fn recover(&self) -> Result<()> {
        let records = read_log(&self.log_path)?;

        let mut checkpoint_idx = None;
        for (i, record) in records.iter().enumerate() {
            if matches!(record, LogRecord::Checkpoint { .. }) {
                checkpoint_idx = Some(i);
            }
        }
        // The redo pass must cover every transaction active at the
        // checkpoint, so it begins at the earliest of their start records.
        let redo_start = match checkpoint_idx {
            None => 0,
            Some(cp) => {
                let LogRecord::Checkpoint { clients } = &records[cp] else {
                    unreachable!("checkpoint_idx points at a checkpoint record");
                };
                let mut start = cp;
                for client in clients {
                    let found = records[..cp].iter().rposition(
                        |record| matches!(record, LogRecord::Start { client: c } if c == client),
                    );
                    if let Some(pos) = found {
                        start = start.min(pos);
                    }
                }
                start
            }
        };
        info!(records = records.len(), redo_start, "recovering from log");

        let mut active: HashSet<Uuid> = HashSet::new();
        for record in &records[redo_start..] {
            match record {
                LogRecord::Start { client } => {
                    active.insert(*client);
                    let _ = self.tm.begin(*client);
                }
                LogRecord::Commit { client } => {
                    active.remove(client);
                    let _ = self.tm.commit(*client);
                }
                LogRecord::Checkpoint { clients } => {
                    for client in clients {
                        active.insert(*client);
                        let _ = self.tm.begin(*client);
                    }
                }
                LogRecord::Table { .. } | LogRecord::Edit(_) => self.redo(record)?,
            }
        }

        // Undo pass: newest record first, for transactions still active.
        let mut i = records.len();
        while !active.is_empty() && i > 0 {
            i -= 1;
            match &records[i] {
                LogRecord::Start { client } if active.contains(client) => {
                    self.tm.commit(*client)?;
                    self.log_commit(*client)?;
                    active.remove(client);
                }
                LogRecord::Edit(edit) if active.contains(&edit.client) => {
                    self.undo(edit)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-applies a table or edit record without logging it again. Redo is
    /// idempotent: a colliding insert becomes an update, an update of a
    /// missing key becomes an insert, deletes and table creations tolerate
    /// already-applied state.
    fn redo(&self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Table { kind, name } => match self.db.create_table(name, *kind) {
                Ok(_) => Ok(()),
                Err(Error::TableExists(_)) => Ok(()),
                Err(err) => Err(err),
            },
            LogRecord::Edit(edit) => {
                let table = self.db.get_table(&edit.table)?;
                match edit.action {
                    EditAction::Insert => table
                        .insert(edit.key, edit.new_value)
                        .or_else(|_| table.update(edit.key, edit.new_value)),
                    EditAction::Update => table
                        .update(edit.key, edit.new_value)
                        .or_else(|_| table.insert(edit.key, edit.new_value)),
                    EditAction::Delete => match table.delete(edit.key) {
                        Err(Error::NotFound(_)) => Ok(()),
                        other => other,
                    },
                }
            }
            _ => Ok(()),
        }
    }

    /// Performs the inverse of an edit through the normal transactional
    /// path, so the undo is itself logged and re-runnable.
    fn undo(&self, record: &EditRecord) -> Result<()> {
        match record.action {
            EditAction::Insert => self.delete(record.client, &record.table, record.key),
            EditAction::Update => {
                self.update(record.client, &record.table, record.key, record.old_value)
            }
            EditAction::Delete => {
                self.insert(record.client, &record.table, record.key, record.old_value)
            }
        }
    }

    /// Rolls back the client's uncommitted transaction: undoes its edits in
    /// reverse, releases its locks and seals the log with a commit record.
    pub fn rollback(&self, client: Uuid) -> Result<()> {
        let stack = self
            .inner
            .lock()
            .tx_stack
            .get(&client)
            .cloned()
            .ok_or(Error::NoTransaction)?;
        for record in stack.iter().rev() {
            self.undo(record)?;
        }
        self.inner.lock().tx_stack.remove(&client);
        self.tm.commit(client)?;
        self.inner.lock().log.append(&LogRecord::Commit { client })?;
        Ok(())
    }
}

/// Prepares a data directory for opening. When a sibling recovery snapshot
/// exists the current log is copied into it (preserving records written
/// after the snapshot) and the snapshot replaces the data directory;
/// otherwise the snapshot directory is created for later checkpoints.
pub fn prime(folder: impl AsRef<Path>) -> Result<Database> {
    let base = folder.as_ref();
    let recovery_dir = sibling_recovery_dir(base);
    if !recovery_dir.exists() {
        fs::create_dir_all(&recovery_dir)?;
        return Database::open(base);
    }
    let log_src = base.join(LOG_FILE_NAME);
    if log_src.exists() {
        fs::copy(&log_src, recovery_dir.join(LOG_FILE_NAME))?;
    }
    if base.exists() {
        fs::remove_dir_all(base)?;
    }
    copy_dir_all(&recovery_dir, base)?;
    Database::open(base)
}

fn sibling_recovery_dir(base: &Path) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push("-recovery");
    base.parent().unwrap_or_else(|| Path::new("")).join(name)
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

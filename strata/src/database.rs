//! The table registry: maps table names to their index files inside one
//! data directory.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::btree::BTreeIndex;
use crate::entry::Entry;
use crate::hash::HashIndex;
use crate::pager::Pager;
use crate::{Error, Result, LOG_FILE_NAME};

/// Which index structure backs a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    BTree,
    Hash,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::BTree => "btree",
            TableKind::Hash => "hash",
        })
    }
}

impl FromStr for TableKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<TableKind> {
        match s {
            "btree" => Ok(TableKind::BTree),
            "hash" => Ok(TableKind::Hash),
            _ => Err(Error::ParseLog(s.to_string())),
        }
    }
}

/// A named table: one of the two index structures.
pub enum Table {
    BTree(BTreeIndex),
    Hash(HashIndex),
}

impl Table {
    pub fn kind(&self) -> TableKind {
        match self {
            Table::BTree(_) => TableKind::BTree,
            Table::Hash(_) => TableKind::Hash,
        }
    }

    /// The pager backing this table's index.
    pub fn pager(&self) -> &Arc<Pager> {
        match self {
            Table::BTree(index) => index.pager(),
            Table::Hash(index) => index.pager(),
        }
    }

    pub fn find(&self, key: i64) -> Result<Entry> {
        match self {
            Table::BTree(index) => index.find(key),
            Table::Hash(index) => index.find(key),
        }
    }

    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        match self {
            Table::BTree(index) => index.insert(key, value),
            Table::Hash(index) => index.insert(key, value),
        }
    }

    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        match self {
            Table::BTree(index) => index.update(key, value),
            Table::Hash(index) => index.update(key, value),
        }
    }

    pub fn delete(&self, key: i64) -> Result<()> {
        match self {
            Table::BTree(index) => index.delete(key),
            Table::Hash(index) => index.delete(key),
        }
    }

    pub fn select(&self) -> Result<Vec<Entry>> {
        match self {
            Table::BTree(index) => index.select(),
            Table::Hash(index) => index.select(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Table::BTree(index) => index.close(),
            Table::Hash(index) => index.close(),
        }
    }
}

/// A set of tables backed by files in one data directory.
pub struct Database {
    base_path: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Opens a database over `folder`, creating the directory as needed.
    pub fn open(folder: impl AsRef<Path>) -> Result<Database> {
        let base_path = folder.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Database {
            base_path,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Where this database's write-ahead log lives.
    pub fn log_path(&self) -> PathBuf {
        self.base_path.join(LOG_FILE_NAME)
    }

    /// Creates the log file if it does not exist yet.
    pub fn create_log_file(&self) -> Result<PathBuf> {
        let path = self.log_path();
        if !path.exists() {
            OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(path)
    }

    /// Creates a new table of the given kind.
    pub fn create_table(&self, name: &str, kind: TableKind) -> Result<Arc<Table>> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidTableName);
        }
        let path = self.base_path.join(name);
        if path.exists() {
            return Err(Error::TableExists(name.to_string()));
        }
        let table = Arc::new(match kind {
            TableKind::BTree => Table::BTree(BTreeIndex::open(&path)?),
            TableKind::Hash => Table::Hash(HashIndex::open(&path)?),
        });
        self.tables.write().insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Returns the named table, lazily opening it from disk. A `.meta`
    /// companion file marks a hash table; anything else is a B+Tree.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let path = self.base_path.join(name);
        if !path.exists() {
            return Err(Error::TableNotFound(name.to_string()));
        }
        let mut meta_path = path.as_os_str().to_os_string();
        meta_path.push(".meta");
        let table = Arc::new(if PathBuf::from(meta_path).exists() {
            Table::Hash(HashIndex::open(&path)?)
        } else {
            Table::BTree(BTreeIndex::open(&path)?)
        });
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// A snapshot of every open table.
    pub fn tables(&self) -> Vec<(String, Arc<Table>)> {
        self.tables
            .read()
            .iter()
            .map(|(name, table)| (name.clone(), Arc::clone(table)))
            .collect()
    }

    /// Closes every table. The first failure is reported, but every table
    /// still gets its close attempt.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for (_, table) in self.tables() {
            if let Err(err) = table.close() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

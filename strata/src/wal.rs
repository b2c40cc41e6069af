//! The write-ahead log: textual, line-oriented records plus the appender
//! that forces every record to disk before returning.
//!
//! Record forms, one per line:
//!
//! ```text
//! < create <type> table <name> >
//! < <uuid>, <table>, INSERT|UPDATE|DELETE, <key>, <oldval>, <newval> >
//! < <uuid> start >
//! < <uuid> commit >
//! < <uuid1>, <uuid2>, ... checkpoint >     (or "< checkpoint >" if none)
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use uuid::Uuid;

use crate::database::TableKind;
use crate::{Error, Result};

/// The kind of change an edit record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EditAction::Insert => "INSERT",
            EditAction::Update => "UPDATE",
            EditAction::Delete => "DELETE",
        })
    }
}

impl FromStr for EditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<EditAction> {
        match s {
            "INSERT" => Ok(EditAction::Insert),
            "UPDATE" => Ok(EditAction::Update),
            "DELETE" => Ok(EditAction::Delete),
            _ => Err(Error::ParseLog(s.to_string())),
        }
    }
}

/// One entry change inside a transaction, capturing both the prior and the
/// new value so it can be both redone and undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub client: Uuid,
    pub table: String,
    pub action: EditAction,
    pub key: i64,
    pub old_value: i64,
    pub new_value: i64,
}

/// A record of the write-ahead log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Creation of a table.
    Table { kind: TableKind, name: String },
    /// An entry change inside a transaction.
    Edit(EditRecord),
    /// Start of a transaction.
    Start { client: Uuid },
    /// Commit of a transaction.
    Commit { client: Uuid },
    /// The set of transactions running at checkpoint time.
    Checkpoint { clients: Vec<Uuid> },
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { kind, name } => write!(f, "< create {kind} table {name} >"),
            LogRecord::Edit(edit) => write!(
                f,
                "< {}, {}, {}, {}, {}, {} >",
                edit.client, edit.table, edit.action, edit.key, edit.old_value, edit.new_value
            ),
            LogRecord::Start { client } => write!(f, "< {client} start >"),
            LogRecord::Commit { client } => write!(f, "< {client} commit >"),
            LogRecord::Checkpoint { clients } => {
                if clients.is_empty() {
                    return f.write_str("< checkpoint >");
                }
                let ids: Vec<String> = clients.iter().map(Uuid::to_string).collect();
                write!(f, "< {} checkpoint >", ids.join(", "))
            }
        }
    }
}

impl FromStr for LogRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<LogRecord> {
        let parse_err = || Error::ParseLog(line.to_string());
        let inner = line
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .map(str::trim)
            .ok_or_else(parse_err)?;

        if let Some(rest) = inner.strip_prefix("create ") {
            let mut fields = rest.split_whitespace();
            let kind: TableKind = fields.next().ok_or_else(parse_err)?.parse()?;
            if fields.next() != Some("table") {
                return Err(parse_err());
            }
            let name = fields.next().ok_or_else(parse_err)?.to_string();
            if fields.next().is_some() {
                return Err(parse_err());
            }
            return Ok(LogRecord::Table { kind, name });
        }
        if let Some(id) = inner.strip_suffix(" start") {
            let client = Uuid::parse_str(id).map_err(|_| parse_err())?;
            return Ok(LogRecord::Start { client });
        }
        if let Some(id) = inner.strip_suffix(" commit") {
            let client = Uuid::parse_str(id).map_err(|_| parse_err())?;
            return Ok(LogRecord::Commit { client });
        }
        if inner == "checkpoint" {
            return Ok(LogRecord::Checkpoint {
                clients: Vec::new(),
            });
        }
        if let Some(ids) = inner.strip_suffix(" checkpoint") {
            let clients = ids
                .split(", ")
                .map(|id| Uuid::parse_str(id.trim_end_matches(',')).map_err(|_| parse_err()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(LogRecord::Checkpoint { clients });
        }

        let fields: Vec<&str> = inner.split(", ").collect();
        if fields.len() != 6 {
            return Err(parse_err());
        }
        let client = Uuid::parse_str(fields[0]).map_err(|_| parse_err())?;
        let action: EditAction = fields[2].parse()?;
        let parse_num = |s: &str| s.parse::<i64>().map_err(|_| parse_err());
        Ok(LogRecord::Edit(EditRecord {
            client,
            table: fields[1].to_string(),
            action,
            key: parse_num(fields[3])?,
            old_value: parse_num(fields[4])?,
            new_value: parse_num(fields[5])?,
        }))
    }
}

/// Appends records to the log file, forcing each one to disk before
/// returning so a record is durable by the time its caller proceeds.
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<LogWriter> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(LogWriter { file })
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        writeln!(self.file, "{record}")?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads and parses every record in the log file, in order.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}

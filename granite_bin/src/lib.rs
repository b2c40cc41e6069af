//! Line-oriented interactive front end for GraniteDB.
//!
//! Each session runs one client (identified by a v4 UUID) against the
//! engine's recovery-managed operation surface. Command errors are written
//! to the output stream prefixed with `ERROR: `.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use uuid::Uuid;

use strata::database::Database;
use strata::lock_manager::LockMode;
use strata::recovery::RecoveryManager;
use strata::transaction::TransactionManager;

/// Prompt printed before each command when running interactively.
pub const PROMPT: &str = "granite> ";

const HELP: &str = "\
create: Create a table. usage: create <btree|hash> table <table>
find: Find an element. usage: find <key> from <table>
insert: Insert an element. usage: insert <key> <value> into <table>
update: Update an element. usage: update <table> <key> <value>
delete: Delete an element. usage: delete <key> from <table>
select: Select elements from a table. usage: select from <table>
transaction: Handle transactions. usage: transaction <begin|commit>
lock: Grab a write lock on a resource. usage: lock <table> <key>
checkpoint: Save a checkpoint of the database state. usage: checkpoint
abort: Roll back the current transaction. usage: abort
crash: Crash the database. usage: crash
";

/// One client's connection to the database.
pub struct Session {
    pub db: Arc<Database>,
    pub tm: Arc<TransactionManager>,
    pub rm: Arc<RecoveryManager>,
    pub client: Uuid,
}

impl Session {
    pub fn new(
        db: Arc<Database>,
        tm: Arc<TransactionManager>,
        rm: Arc<RecoveryManager>,
    ) -> Session {
        Session {
            db,
            tm,
            rm,
            client: Uuid::new_v4(),
        }
    }
}

/// Executes a single command line and returns its output text.
pub fn execute(session: &Session, line: &str) -> Result<String, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = fields.first() else {
        return Ok(String::new());
    };
    match command {
        ".help" => Ok(HELP.to_string()),
        "create" => handle_create(session, &fields),
        "find" => handle_find(session, &fields),
        "insert" => handle_insert(session, &fields),
        "update" => handle_update(session, &fields),
        "delete" => handle_delete(session, &fields),
        "select" => handle_select(session, &fields),
        "transaction" => handle_transaction(session, &fields),
        "lock" => handle_lock(session, &fields),
        "checkpoint" => handle_checkpoint(session, &fields),
        "abort" => handle_abort(session, &fields),
        "crash" => panic!("it's the end of the world!"),
        _ => Err(format!("command not found: {command}")),
    }
}

/// Runs the read-eval-print loop until the input stream ends.
pub fn run(
    session: &Session,
    input: impl BufRead,
    mut output: impl Write,
    show_prompt: bool,
) -> io::Result<()> {
    if show_prompt {
        write!(output, "{PROMPT}")?;
        output.flush()?;
    }
    for line in input.lines() {
        let line = line?;
        match execute(session, &line) {
            Ok(text) => write!(output, "{text}")?,
            Err(message) => writeln!(output, "ERROR: {message}")?,
        }
        if show_prompt {
            write!(output, "{PROMPT}")?;
        }
        output.flush()?;
    }
    Ok(())
}

fn parse_key(field: &str) -> Result<i64, String> {
    field
        .parse::<i64>()
        .map_err(|err| format!("invalid number {field}: {err}"))
}

fn handle_create(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 4 || fields[2] != "table" || (fields[1] != "btree" && fields[1] != "hash") {
        return Err("usage: create <btree|hash> table <table>".to_string());
    }
    let kind = fields[1].parse().map_err(|_| "create error: internal error".to_string())?;
    session
        .rm
        .create_table(kind, fields[3])
        .map(|_| format!("{} table {} created.\n", fields[1], fields[3]))
        .map_err(|err| format!("create error: {err}"))
}

fn handle_find(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 4 || fields[2] != "from" {
        return Err("usage: find <key> from <table>".to_string());
    }
    let key = parse_key(fields[1])?;
    session
        .rm
        .find(session.client, fields[3], key)
        .map(|entry| format!("found entry: ({}, {})\n", entry.key, entry.value))
        .map_err(|err| format!("find error: {err}"))
}

fn handle_insert(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 5 || fields[3] != "into" {
        return Err("usage: insert <key> <value> into <table>".to_string());
    }
    let key = parse_key(fields[1])?;
    let value = parse_key(fields[2])?;
    session
        .rm
        .insert(session.client, fields[4], key, value)
        .map(|()| String::new())
        .map_err(|err| format!("insert error: {err}"))
}

fn handle_update(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 4 {
        return Err("usage: update <table> <key> <value>".to_string());
    }
    let key = parse_key(fields[2])?;
    let value = parse_key(fields[3])?;
    session
        .rm
        .update(session.client, fields[1], key, value)
        .map(|()| String::new())
        .map_err(|err| format!("update error: {err}"))
}

fn handle_delete(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 4 || fields[2] != "from" {
        return Err("usage: delete <key> from <table>".to_string());
    }
    let key = parse_key(fields[1])?;
    session
        .rm
        .delete(session.client, fields[3], key)
        .map(|()| String::new())
        .map_err(|err| format!("delete error: {err}"))
}

fn handle_select(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 3 || fields[1] != "from" {
        return Err("usage: select from <table>".to_string());
    }
    // Select takes no entry locks; it may see an inconsistent snapshot.
    let table = session
        .db
        .get_table(fields[2])
        .map_err(|err| format!("select error: {err}"))?;
    let entries = table.select().map_err(|err| format!("select error: {err}"))?;
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!("({}, {})\n", entry.key, entry.value));
    }
    Ok(out)
}

fn handle_transaction(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 2 || (fields[1] != "begin" && fields[1] != "commit") {
        return Err("usage: transaction <begin|commit>".to_string());
    }
    let result = match fields[1] {
        "begin" => session.rm.begin(session.client),
        _ => session.rm.commit(session.client),
    };
    result
        .map(|()| String::new())
        .map_err(|err| format!("transaction error: {err}"))
}

fn handle_lock(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 3 {
        return Err("usage: lock <table> <key>".to_string());
    }
    let key = parse_key(fields[2])?;
    session
        .db
        .get_table(fields[1])
        .map_err(|err| format!("lock error: {err}"))?;
    session
        .tm
        .lock(session.client, fields[1], key, LockMode::Exclusive)
        .map(|()| String::new())
        .map_err(|err| format!("lock error: {err}"))
}

fn handle_checkpoint(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 1 {
        return Err("usage: checkpoint".to_string());
    }
    session
        .rm
        .checkpoint()
        .map(|()| String::new())
        .map_err(|err| format!("checkpoint error: {err}"))
}

fn handle_abort(session: &Session, fields: &[&str]) -> Result<String, String> {
    if fields.len() != 1 {
        return Err("usage: abort".to_string());
    }
    if session.tm.transaction(session.client).is_none() {
        return Err("no running transaction to abort".to_string());
    }
    session
        .rm
        .rollback(session.client)
        .map(|()| String::new())
        .map_err(|err| format!("abort error: {err}"))
}

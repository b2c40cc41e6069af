//! # Strata Storage Engine
//! The storage engine for GraniteDB.
//! This crate manages the on-disk and in-memory representation of data:
//! a buffer pool of fixed-size pages, two paged index structures, strict
//! two-phase locking and an undo/redo write-ahead log.

/// The B+Tree index implementation.
pub mod btree;
/// The table registry tying indexes to a data directory.
pub mod database;
/// The fixed-width key/value entry codec.
pub mod entry;
/// The engine-wide error type.
pub mod error;
/// The extendible hash index implementation.
pub mod hash;
/// Resource-granular locks and the waits-for graph.
pub mod lock_manager;
/// The page abstraction shared by the pager and the indexes.
pub mod page;
/// The pager: a bounded frame pool over a page file.
pub mod pager;
/// The recovery manager: checkpointing, crash recovery and rollback.
pub mod recovery;
/// Per-client transactions and strict 2PL.
pub mod transaction;
/// Log record codec and the append-only log writer.
pub mod wal;

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A page's position within its backing file. The first page is page 0.
pub type PageNum = i64;

/// Sentinel page number for "no page".
pub const NO_PAGE: PageNum = -1;

/// The maximum number of pages resident in a pager's buffer at once.
pub const MAX_PAGES_IN_BUFFER: usize = 32;

/// Name of the write-ahead log file inside a data directory.
pub const LOG_FILE_NAME: &str = "db.log";

pub use entry::Entry;
pub use error::{Error, Result};
pub use page::Page;

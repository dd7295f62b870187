//! SQLite-backed relational engine adapter
//!
//! One writer connection plus a pool of read-only connections (file
//! databases only; WAL lets readers run beside the writer). Every write
//! runs in a transaction whose commit point is owned by its cancel token,
//! so a cancelled operation always rolls back as a whole.

use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use rusqlite::{params, Connection, InterruptHandle, OpenFlags, OptionalExtension, Transaction};

use super::errors::{StorageError, StorageResult};
use crate::errors::{TablesmithError, TablesmithResult};
use crate::identifier::PhysicalIdent;
use crate::observability::Logger;

/// Metadata layout version stored in `__tablesmith_meta`
const METADATA_VERSION: i64 = 1;

/// How often a waiter retries a busy connection
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Metadata tables, created on open
const METADATA_DDL: &str = "
CREATE TABLE IF NOT EXISTS __tablesmith_meta (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS __tablesmith_projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS __tablesmith_tables (
    table_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    logical_name TEXT NOT NULL,
    physical_name TEXT NOT NULL UNIQUE,
    definition TEXT NOT NULL,
    UNIQUE (project_id, logical_name)
);
CREATE TABLE IF NOT EXISTS __tablesmith_versions (
    table_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    entry TEXT NOT NULL,
    PRIMARY KEY (table_id, version)
);
";

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTING: u8 = 2;
const COMMITTED: u8 = 3;

#[derive(Default)]
struct CancelState {
    phase: AtomicU8,
    interrupt: Mutex<Option<InterruptHandle>>,
}

/// Cancellation shared between a blocking operation and its deadline.
///
/// Cancelling interrupts whatever statement runs on the attached
/// connection. Once a transaction reaches its commit point the token can
/// no longer be cancelled, and the operation's own outcome stands.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("phase", &self.0.phase.load(Ordering::SeqCst))
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and interrupts the attached connection. Returns
    /// false when a commit already started or finished.
    pub fn cancel(&self) -> bool {
        let swapped = self.0.phase.compare_exchange(
            RUNNING,
            CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match swapped {
            Ok(_) => {
                if let Ok(slot) = self.0.interrupt.lock() {
                    if let Some(handle) = slot.as_ref() {
                        handle.interrupt();
                    }
                }
                true
            }
            Err(phase) => phase == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.phase.load(Ordering::SeqCst) == CANCELLED
    }

    /// Fails with `Cancelled` once the flag is raised
    pub fn checkpoint(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Claims the commit point; fails if cancellation won the race
    fn begin_commit(&self) -> StorageResult<u8> {
        self.0
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |phase| {
                (phase != CANCELLED).then_some(COMMITTING)
            })
            .map_err(|_| StorageError::Cancelled)
    }

    fn end_commit(&self, previous: u8, committed: bool) {
        let phase = if committed { COMMITTED } else { previous };
        self.0.phase.store(phase, Ordering::SeqCst);
    }

    /// Routes interrupts to `conn` until the returned guard drops
    fn attach(&self, conn: &Connection) -> Attachment<'_> {
        if let Ok(mut slot) = self.0.interrupt.lock() {
            *slot = Some(conn.get_interrupt_handle());
        }
        Attachment { token: self }
    }
}

struct Attachment<'a> {
    token: &'a CancelToken,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.token.0.interrupt.lock() {
            *slot = None;
        }
    }
}

/// Handle to the relational engine
#[derive(Clone)]
pub struct StorageEngine {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    read_cursor: Arc<AtomicUsize>,
    location: String,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("location", &self.location)
            .field("readers", &self.readers.len())
            .finish()
    }
}

impl StorageEngine {
    /// Opens (or creates) a database file with `read_pool_size` read-only
    /// connections beside the writer
    pub fn open(path: &Path, busy_timeout: Duration, read_pool_size: usize) -> StorageResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        let writer = prepare_writer(connection, busy_timeout)?;

        let mut readers = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size {
            let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
            let reader = Connection::open_with_flags(path, flags)?;
            reader.busy_timeout(busy_timeout)?;
            readers.push(Mutex::new(reader));
        }
        Ok(Self::assemble(writer, readers, path.display().to_string()))
    }

    /// Opens a private in-memory database; reads share the writer
    pub fn open_in_memory() -> StorageResult<Self> {
        let connection = Connection::open_in_memory()?;
        let writer = prepare_writer(connection, Duration::from_secs(5))?;
        Ok(Self::assemble(writer, Vec::new(), ":memory:".to_string()))
    }

    fn assemble(writer: Connection, readers: Vec<Mutex<Connection>>, location: String) -> Self {
        let pool = readers.len().to_string();
        Logger::info(
            "STORAGE_OPENED",
            &[("location", location.as_str()), ("readers", pool.as_str())],
        );
        Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            read_cursor: Arc::new(AtomicUsize::new(0)),
            location,
        }
    }

    /// Next read connection, round-robin; the writer when there is no pool
    fn reader(&self) -> &Mutex<Connection> {
        if self.readers.is_empty() {
            return &self.writer;
        }
        let index = self.read_cursor.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[index]
    }

    /// Runs a closure on the writer connection, outside any deadline.
    /// Used for startup and metadata reads.
    pub fn read<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let guard = self.writer.lock().map_err(|_| StorageError::Poisoned)?;
        f(&guard)
    }

    /// Runs `f` against one consistent read snapshot taken from the read
    /// pool. Waiting for a connection and every statement honor `cancel`.
    pub fn snapshot<T, E, F>(&self, cancel: &CancelToken, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let mut guard = acquire(self.reader(), cancel)?;
        let attachment = cancel.attach(&guard);
        let result = read_snapshot(&mut guard, cancel, f);
        drop(attachment);
        reset(&guard);
        result
    }

    /// Runs `f` inside one write transaction.
    ///
    /// The token is checked while waiting for the writer and claims the
    /// commit point before commit; a raised flag rolls the whole
    /// transaction back.
    pub fn transaction<T, F>(&self, cancel: &CancelToken, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
    {
        self.try_transaction(cancel, f)
    }

    /// `transaction` for closures with their own error type. Any error
    /// drops the transaction, which rolls it back.
    pub fn try_transaction<T, E, F>(&self, cancel: &CancelToken, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    {
        let mut guard = acquire(&self.writer, cancel)?;
        let attachment = cancel.attach(&guard);
        let result = write_transaction(&mut guard, cancel, f);
        drop(attachment);
        reset(&guard);
        result
    }

    /// Names of every physical table in the database
    pub fn physical_tables(&self) -> StorageResult<Vec<String>> {
        self.read(|conn| list_tables(conn))
    }
}

fn prepare_writer(mut connection: Connection, busy_timeout: Duration) -> StorageResult<Connection> {
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    connection.busy_timeout(busy_timeout)?;
    initialize_metadata(&mut connection)?;
    Ok(connection)
}

/// Waits for a connection until it is free or the token is cancelled
fn acquire<'a>(
    slot: &'a Mutex<Connection>,
    cancel: &CancelToken,
) -> StorageResult<MutexGuard<'a, Connection>> {
    loop {
        match slot.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(StorageError::Poisoned),
            Err(TryLockError::WouldBlock) => {
                cancel.checkpoint()?;
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
        }
    }
}

fn read_snapshot<T, E, F>(conn: &mut Connection, cancel: &CancelToken, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&Connection) -> Result<T, E>,
{
    cancel.checkpoint()?;
    let tx = conn.transaction().map_err(StorageError::from)?;
    let value = f(&*tx)?;
    cancel.checkpoint()?;
    Ok(value)
}

fn write_transaction<T, E, F>(conn: &mut Connection, cancel: &CancelToken, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    cancel.checkpoint()?;
    let tx = conn.transaction().map_err(StorageError::from)?;
    let value = f(&tx)?;
    let previous = cancel.begin_commit()?;
    let committed = tx.commit().map_err(StorageError::from);
    cancel.end_commit(previous, committed.is_ok());
    committed?;
    Ok(value)
}

/// An interrupted statement can leave the transaction open; the next
/// user of the connection must start clean.
fn reset(conn: &Connection) {
    if !conn.is_autocommit() {
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            let detail = e.to_string();
            Logger::warn("STORAGE_RESET_FAILED", &[("detail", detail.as_str())]);
        }
    }
}

fn initialize_metadata(connection: &mut Connection) -> StorageResult<()> {
    let tx = connection.transaction()?;
    tx.execute_batch(METADATA_DDL)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM __tablesmith_meta LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO __tablesmith_meta (version) VALUES (?1)",
                params![METADATA_VERSION],
            )?;
        }
        Some(v) if v == METADATA_VERSION => {}
        Some(v) => {
            return Err(StorageError::Corrupt(format!(
                "unsupported metadata version {}",
                v
            )));
        }
    }
    tx.commit()?;
    Ok(())
}

/// Lists user-visible tables (excludes engine-internal ones)
pub fn list_tables(conn: &Connection) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Whether the physical table holds any row (live or soft-deleted)
pub fn table_has_rows(conn: &Connection, table: &PhysicalIdent) -> StorageResult<bool> {
    let sql = format!("SELECT EXISTS (SELECT 1 FROM {} LIMIT 1)", table.quoted());
    let exists: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(exists != 0)
}

/// Runs a blocking storage closure on the blocking pool with a deadline.
///
/// At the deadline the closure's token is cancelled, which interrupts its
/// statement, and the caller gets `Timeout` at once; the abandoned closure
/// rolls back on its own. If the closure already claimed its commit point
/// the real outcome is awaited instead, so a committed write is never
/// reported as a timeout.
pub async fn run_blocking<T, F>(
    operation: &'static str,
    timeout: Duration,
    f: F,
) -> TablesmithResult<T>
where
    F: FnOnce(CancelToken) -> TablesmithResult<T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || f(token));

    let joined = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(joined) => joined,
        Err(_) if cancel.cancel() => {
            let timeout_ms = timeout.as_millis().to_string();
            Logger::warn(
                "OPERATION_TIMEOUT",
                &[("operation", operation), ("timeout_ms", timeout_ms.as_str())],
            );
            return Err(TablesmithError::timeout(operation));
        }
        Err(_) => handle.await,
    };

    match joined {
        Ok(result) => result,
        Err(join_err) => {
            let detail = join_err.to_string();
            Logger::error(
                "BLOCKING_TASK_FAILED",
                &[("operation", operation), ("detail", detail.as_str())],
            );
            Err(TablesmithError::internal(format!("{} failed", operation)))
        }
    }
}

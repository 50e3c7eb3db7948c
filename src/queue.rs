//! Durable FIFO of frames on top of SQLite.
//!
//! Each entry is one row of `packets (id, data)`. Ids come from an
//! `AUTOINCREMENT` primary key, so SQLite never hands out an id twice for the
//! lifetime of the file, even after the table has been drained and the
//! process restarted. Every operation is a single auto-committed statement
//! run with `synchronous=FULL`, which makes each enqueue or remove atomic on
//! disk.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::StoreError;
use crate::frame::Frame;

#[cfg(test)]
#[path = "queue_tests.rs"]
mod queue_tests;

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS packets (id INTEGER PRIMARY KEY AUTOINCREMENT, data BLOB NOT NULL)";

/// Store-assigned entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: EntryId,
    pub frame: Frame,
}

struct Inner {
    conn: Mutex<Connection>,
    path: PathBuf,
    enqueued: Notify,
}

/// Handle to the packet store. Clones share one connection.
#[derive(Clone)]
pub struct DurableQueue {
    inner: Arc<Inner>,
}

impl DurableQueue {
    /// Open or create the store at `path`. Safe to call on a file left by a
    /// previous run in any state.
    pub fn initialize<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let open_err = |source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        };

        let mut conn = Connection::open(path).map_err(open_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        conn.execute_batch("PRAGMA synchronous=FULL;").map_err(open_err)?;
        migrate_legacy_table(&mut conn).map_err(open_err)?;
        conn.execute_batch(CREATE_TABLE).map_err(open_err)?;

        let queue = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                path: path.to_path_buf(),
                enqueued: Notify::new(),
            }),
        };
        tracing::debug!(path = %path.display(), pending = queue.len()?, "Packet store opened");
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append a frame. Returns once the row is committed.
    pub fn enqueue(&self, frame: &Frame) -> Result<EntryId, StoreError> {
        let id = {
            let conn = self.inner.conn.lock();
            conn.execute("INSERT INTO packets (data) VALUES (?1)", params![frame.as_bytes()])?;
            EntryId(conn.last_insert_rowid())
        };
        self.inner.enqueued.notify_one();
        Ok(id)
    }

    /// The entry with the smallest id, left in place.
    pub fn peek_oldest(&self) -> Result<Option<QueueEntry>, StoreError> {
        let row = {
            let conn = self.inner.conn.lock();
            conn.query_row(
                "SELECT id, data FROM packets ORDER BY id ASC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, blob_bytes(row.get_ref(1)?))),
            )
            .optional()?
        };

        match row {
            None => Ok(None),
            Some((id, data)) => {
                let frame = Frame::new(data).map_err(|source| StoreError::Corrupt { id, source })?;
                Ok(Some(QueueEntry {
                    id: EntryId(id),
                    frame,
                }))
            }
        }
    }

    /// Delete an entry. `false` means it was already gone.
    pub fn remove(&self, id: EntryId) -> Result<bool, StoreError> {
        let conn = self.inner.conn.lock();
        let changed = conn.execute("DELETE FROM packets WHERE id = ?1", params![id.0])?;
        Ok(changed == 1)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.inner.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Run a store operation on the blocking pool so async pumps never stall
    /// the runtime on disk I/O.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DurableQueue) -> Result<T, StoreError> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(&queue))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Resolves after the next successful [`enqueue`](Self::enqueue). An
    /// enqueue that happened while nobody was waiting is remembered, so a
    /// drain loop that checks the store and then waits cannot miss it.
    pub fn notified(&self) -> Notified<'_> {
        self.inner.enqueued.notified()
    }
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueue")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

// Rows written by other tools may hold text or NULL; anything that is not a
// non-empty byte string is rejected later as an invalid frame.
fn blob_bytes(value: ValueRef<'_>) -> Vec<u8> {
    match value {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => bytes.to_vec(),
        _ => Vec::new(),
    }
}

/// Stores written by earlier releases hold `packets (data BLOB)` with only
/// an implicit rowid, which SQLite may reuse once the table is empty. Move
/// them onto the AUTOINCREMENT schema, keeping rowids as ids.
fn migrate_legacy_table(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare("PRAGMA table_info(packets)")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    if columns.is_empty() || columns.iter().any(|c| c == "id") {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE packets_migrated (id INTEGER PRIMARY KEY AUTOINCREMENT, data BLOB NOT NULL);",
    )?;
    let kept = tx.execute(
        "INSERT INTO packets_migrated (id, data) \
         SELECT rowid, data FROM packets WHERE data IS NOT NULL AND length(data) > 0 ORDER BY rowid",
        [],
    )?;
    let total: i64 = tx.query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))?;
    tx.execute_batch("DROP TABLE packets; ALTER TABLE packets_migrated RENAME TO packets;")?;
    tx.commit()?;

    let dropped = usize::try_from(total).unwrap_or(0).saturating_sub(kept);
    if dropped > 0 {
        tracing::warn!(dropped, "Discarded empty rows while migrating legacy packet table");
    }
    tracing::info!(entries = kept, "Migrated legacy packet table");
    Ok(())
}

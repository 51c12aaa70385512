use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::core::cursor::Cursor;
use crate::core::models::{now_micros, NewResponse, NewThread, Response, Thread, ThreadId};
use crate::error::{Result, SyncError};

/// The authoritative store. Owns canonical state; everything the client
/// holds is a projection of what these calls return.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Up to `limit` threads ordered `(created_at DESC, id DESC)`, strictly
    /// after `before` in that order when given.
    async fn fetch_threads(&self, limit: u32, before: Option<Cursor>) -> Result<Vec<Thread>>;

    /// All responses under a thread, oldest first.
    async fn fetch_responses(&self, thread_id: ThreadId) -> Result<Vec<Response>>;

    /// Unread responses from other people under threads owned by `owner_id`.
    async fn fetch_inbox(&self, owner_id: &str) -> Result<Vec<Response>>;

    /// Atomically confirm every unread response under `thread_id` not
    /// authored by `viewer_id`. Returns the number of rows stamped.
    async fn mark_read(&self, thread_id: ThreadId, viewer_id: &str) -> Result<u64>;
}

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY,
    created_at INTEGER NOT NULL,
    owner_id TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_threads_feed
    ON threads(created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS responses (
    id INTEGER PRIMARY KEY,
    thread_id INTEGER NOT NULL,
    author_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    read_at INTEGER,
    FOREIGN KEY (thread_id) REFERENCES threads(id)
);

CREATE INDEX IF NOT EXISTS idx_responses_thread
    ON responses(thread_id, created_at);
";

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum StoreCmd {
    FetchThreads {
        limit: u32,
        before: Option<Cursor>,
        reply: oneshot::Sender<Result<Vec<Thread>>>,
    },
    FetchResponses {
        thread_id: ThreadId,
        reply: oneshot::Sender<Result<Vec<Response>>>,
    },
    FetchInbox {
        owner_id: String,
        reply: oneshot::Sender<Result<Vec<Response>>>,
    },
    MarkRead {
        thread_id: ThreadId,
        viewer_id: String,
        reply: oneshot::Sender<Result<u64>>,
    },
    InsertThread {
        thread: NewThread,
        reply: oneshot::Sender<Result<Thread>>,
    },
    InsertResponse {
        response: NewResponse,
        reply: oneshot::Sender<Result<Response>>,
    },
    DeleteThread {
        thread_id: ThreadId,
        reply: oneshot::Sender<Result<bool>>,
    },
}

// ---------------------------------------------------------------------------
// SqliteStore: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

fn unavailable() -> SyncError {
    SyncError::StoreUnavailable("store thread stopped".into())
}

impl SqliteStore {
    /// Open (or create) the database file and spawn the background thread.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Config(format!("Failed to create data dir: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to open db: {e}")))?;
        Self::start(conn)
    }

    /// Private in-memory database, gone when the handle is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to open db: {e}")))?;
        Self::start(conn)
    }

    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("feedsync").join("feed.db")
    }

    fn start(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to init schema: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("feedsync-store".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to spawn store thread: {e}")))?;

        Ok(SqliteStore { tx })
    }

    async fn call<T>(&self, cmd: StoreCmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx.send(cmd).map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())?
    }

    // -- write helpers (seeding, tests, CLI) ---------------------------------

    pub async fn insert_thread(&self, thread: NewThread) -> Result<Thread> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCmd::InsertThread { thread, reply }, rx).await
    }

    pub async fn insert_response(&self, response: NewResponse) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCmd::InsertResponse { response, reply }, rx)
            .await
    }

    /// Remove a thread and its responses. Returns false if it didn't exist.
    pub async fn delete_thread(&self, thread_id: ThreadId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCmd::DeleteThread { thread_id, reply }, rx)
            .await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                StoreCmd::FetchThreads {
                    limit,
                    before,
                    reply,
                } => {
                    let _ = reply.send(Self::do_fetch_threads(&conn, limit, before));
                }
                StoreCmd::FetchResponses { thread_id, reply } => {
                    let _ = reply.send(Self::do_fetch_responses(&conn, thread_id));
                }
                StoreCmd::FetchInbox { owner_id, reply } => {
                    let _ = reply.send(Self::do_fetch_inbox(&conn, &owner_id));
                }
                StoreCmd::MarkRead {
                    thread_id,
                    viewer_id,
                    reply,
                } => {
                    let _ = reply.send(Self::do_mark_read(&conn, thread_id, &viewer_id));
                }
                StoreCmd::InsertThread { thread, reply } => {
                    let _ = reply.send(Self::do_insert_thread(&conn, thread));
                }
                StoreCmd::InsertResponse { response, reply } => {
                    let _ = reply.send(Self::do_insert_response(&conn, response));
                }
                StoreCmd::DeleteThread { thread_id, reply } => {
                    let _ = reply.send(Self::do_delete_thread(&conn, thread_id));
                }
            }
        }
        log::debug!("Store thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_fetch_threads(
        conn: &Connection,
        limit: u32,
        before: Option<Cursor>,
    ) -> Result<Vec<Thread>> {
        let rows = match before {
            // Row-value comparison keeps (created_at, id) a single total order.
            Some(c) => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, created_at, owner_id, content FROM threads
                         WHERE (created_at, id) < (?1, ?2)
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?3",
                    )
                    .map_err(store_err("prepare"))?;
                let rows = stmt
                    .query_map(rusqlite::params![c.created_at, c.id, limit], thread_from_row)
                    .map_err(store_err("query"))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(store_err("row"))?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, created_at, owner_id, content FROM threads
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?1",
                    )
                    .map_err(store_err("prepare"))?;
                let rows = stmt
                    .query_map([limit], thread_from_row)
                    .map_err(store_err("query"))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(store_err("row"))?;
                rows
            }
        };
        Ok(rows)
    }

    fn do_fetch_responses(conn: &Connection, thread_id: ThreadId) -> Result<Vec<Response>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, thread_id, author_id, created_at, content, read_at
                 FROM responses
                 WHERE thread_id = ?1
                 ORDER BY created_at, id",
            )
            .map_err(store_err("prepare"))?;
        let rows = stmt
            .query_map([thread_id], response_from_row)
            .map_err(store_err("query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("row"))?;
        Ok(rows)
    }

    fn do_fetch_inbox(conn: &Connection, owner_id: &str) -> Result<Vec<Response>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT r.id, r.thread_id, r.author_id, r.created_at, r.content, r.read_at
                 FROM responses r
                 JOIN threads t ON t.id = r.thread_id
                 WHERE t.owner_id = ?1
                   AND r.author_id != ?1
                   AND r.read_at IS NULL
                 ORDER BY r.created_at, r.id",
            )
            .map_err(store_err("prepare"))?;
        let rows = stmt
            .query_map([owner_id], response_from_row)
            .map_err(store_err("query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("row"))?;
        Ok(rows)
    }

    fn do_mark_read(conn: &Connection, thread_id: ThreadId, viewer_id: &str) -> Result<u64> {
        let affected = conn
            .execute(
                "UPDATE responses SET read_at = ?3
                 WHERE thread_id = ?1 AND author_id != ?2 AND read_at IS NULL",
                rusqlite::params![thread_id, viewer_id, now_micros()],
            )
            .map_err(store_err("mark read"))?;
        Ok(affected as u64)
    }

    fn do_insert_thread(conn: &Connection, thread: NewThread) -> Result<Thread> {
        conn.execute(
            "INSERT INTO threads (created_at, owner_id, content) VALUES (?1, ?2, ?3)",
            rusqlite::params![thread.created_at, thread.owner_id, thread.content],
        )
        .map_err(store_err("insert thread"))?;
        Ok(Thread {
            id: conn.last_insert_rowid(),
            created_at: thread.created_at,
            owner_id: thread.owner_id,
            content: thread.content,
        })
    }

    fn do_insert_response(conn: &Connection, response: NewResponse) -> Result<Response> {
        conn.execute(
            "INSERT INTO responses (thread_id, author_id, created_at, content)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                response.thread_id,
                response.author_id,
                response.created_at,
                response.content,
            ],
        )
        .map_err(store_err("insert response"))?;
        Ok(Response {
            id: conn.last_insert_rowid(),
            thread_id: response.thread_id,
            author_id: response.author_id,
            created_at: response.created_at,
            content: response.content,
            read_at: None,
        })
    }

    fn do_delete_thread(conn: &Connection, thread_id: ThreadId) -> Result<bool> {
        let tx = conn
            .unchecked_transaction()
            .map_err(store_err("tx"))?;
        tx.execute("DELETE FROM responses WHERE thread_id = ?1", [thread_id])
            .map_err(store_err("delete responses"))?;
        let removed = tx
            .execute("DELETE FROM threads WHERE id = ?1", [thread_id])
            .map_err(store_err("delete thread"))?;
        tx.commit().map_err(store_err("commit"))?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ThreadStore for SqliteStore {
    async fn fetch_threads(&self, limit: u32, before: Option<Cursor>) -> Result<Vec<Thread>> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreCmd::FetchThreads {
                limit,
                before,
                reply,
            },
            rx,
        )
        .await
    }

    async fn fetch_responses(&self, thread_id: ThreadId) -> Result<Vec<Response>> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCmd::FetchResponses { thread_id, reply }, rx)
            .await
    }

    async fn fetch_inbox(&self, owner_id: &str) -> Result<Vec<Response>> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreCmd::FetchInbox {
                owner_id: owner_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn mark_read(&self, thread_id: ThreadId, viewer_id: &str) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreCmd::MarkRead {
                thread_id,
                viewer_id: viewer_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }
}

fn thread_from_row(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        created_at: row.get(1)?,
        owner_id: row.get(2)?,
        content: row.get(3)?,
    })
}

fn response_from_row(row: &rusqlite::Row) -> rusqlite::Result<Response> {
    Ok(Response {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        author_id: row.get(2)?,
        created_at: row.get(3)?,
        content: row.get(4)?,
        read_at: row.get(5)?,
    })
}

fn store_err(what: &'static str) -> impl Fn(rusqlite::Error) -> SyncError {
    move |e| SyncError::StoreUnavailable(format!("Store {what} error: {e}"))
}

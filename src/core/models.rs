use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::cursor::CursorToken;

pub type ThreadId = i64;
pub type ResponseId = i64;

/// An originating post. Timestamps are microseconds since the Unix epoch,
/// carried as the exact integer the store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub created_at: i64,
    pub owner_id: String,
    pub content: String,
}

/// A reply under a thread. Unread until `read_at` is set; never unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub thread_id: ThreadId,
    pub author_id: String,
    pub created_at: i64,
    pub content: String,
    pub read_at: Option<i64>,
}

impl Response {
    /// Whether this response counts towards `viewer`'s unread total.
    /// Your own replies are never unread to you.
    pub fn is_unread_for(&self, viewer: &str) -> bool {
        self.read_at.is_none() && self.author_id != viewer
    }
}

/// Insert payloads for the store.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub created_at: i64,
    pub owner_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NewResponse {
    pub thread_id: ThreadId,
    pub author_id: String,
    pub created_at: i64,
    pub content: String,
}

/// One page of the thread feed. `next_cursor` is `None` at the end of the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<Thread>,
    pub next_cursor: Option<CursorToken>,
}

impl Page {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// Unread responses for `viewer`, recomputed from the rows every time.
pub fn unread_count(responses: &[Response], viewer: &str) -> u64 {
    responses.iter().filter(|r| r.is_unread_for(viewer)).count() as u64
}

/// Stamp every unread response of `thread_id` (not authored by `viewer`)
/// with a provisional read confirmation. Returns how many rows changed.
pub fn stamp_read(responses: &mut [Response], thread_id: ThreadId, viewer: &str, at: i64) -> usize {
    let mut stamped = 0;
    for r in responses
        .iter_mut()
        .filter(|r| r.thread_id == thread_id && r.is_unread_for(viewer))
    {
        r.read_at = Some(at);
        stamped += 1;
    }
    stamped
}

pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

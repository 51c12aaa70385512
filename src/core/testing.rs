//! Fault-injecting store wrapper shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::core::cursor::Cursor;
use crate::core::models::{Response, Thread, ThreadId};
use crate::core::store::{SqliteStore, ThreadStore};
use crate::error::{Result, SyncError};

pub(crate) struct FaultyStore {
    pub inner: SqliteStore,
    pub fetch_calls: AtomicU32,
    pub commit_calls: AtomicU32,
    fetch_failures: AtomicU32,
    pub fail_commits: AtomicBool,
    commit_delay_ms: AtomicU64,
    commit_gated: AtomicBool,
    commit_gate: Semaphore,
}

impl FaultyStore {
    pub fn new() -> Self {
        FaultyStore {
            inner: SqliteStore::open_in_memory().expect("in-memory sqlite"),
            fetch_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
            fail_commits: AtomicBool::new(false),
            commit_delay_ms: AtomicU64::new(0),
            commit_gated: AtomicBool::new(false),
            commit_gate: Semaphore::new(0),
        }
    }

    /// The next `n` fetch calls fail with `StoreUnavailable`.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Park every commit until [`release_commit`](Self::release_commit).
    pub fn hold_commits(&self) {
        self.commit_gated.store(true, Ordering::SeqCst);
    }

    pub fn release_commit(&self) {
        self.commit_gate.add_permits(1);
    }

    fn before_fetch(&self) -> Result<()> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SyncError::StoreUnavailable("injected fetch failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for FaultyStore {
    async fn fetch_threads(&self, limit: u32, before: Option<Cursor>) -> Result<Vec<Thread>> {
        self.before_fetch()?;
        self.inner.fetch_threads(limit, before).await
    }

    async fn fetch_responses(&self, thread_id: ThreadId) -> Result<Vec<Response>> {
        self.before_fetch()?;
        self.inner.fetch_responses(thread_id).await
    }

    async fn fetch_inbox(&self, owner_id: &str) -> Result<Vec<Response>> {
        self.before_fetch()?;
        self.inner.fetch_inbox(owner_id).await
    }

    async fn mark_read(&self, thread_id: ThreadId, viewer_id: &str) -> Result<u64> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.commit_gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.commit_gate.acquire().await {
                permit.forget();
            }
        }
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("injected commit failure".into()));
        }
        self.inner.mark_read(thread_id, viewer_id).await
    }
}

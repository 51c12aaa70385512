use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::core::models::{now_micros, stamp_read, unread_count, ThreadId};
use crate::core::store::ThreadStore;
use crate::error::{Result, SyncError};
use crate::sync::cache::{CacheKey, CacheValue, Coordinator};

/// Read state of one thread from one viewer's perspective.
///
/// ```text
/// Unread(n>0) --begin_mark--> MarkingInFlight --confirm--> Read
///                                   |
///                                   +--roll_back(store count)--> Unread(n) | Read
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Unread(u64),
    /// Optimistically read; `unread` is what it was before the mark.
    MarkingInFlight { unread: u64 },
    Read,
}

impl ReadState {
    pub fn from_unread(count: u64) -> Self {
        if count == 0 {
            ReadState::Read
        } else {
            ReadState::Unread(count)
        }
    }

    /// What the viewer sees right now. In-flight marks already show as zero.
    pub fn unread(&self) -> u64 {
        match self {
            ReadState::Unread(n) => *n,
            ReadState::MarkingInFlight { .. } | ReadState::Read => 0,
        }
    }

    /// Only a thread with something unread can start a mark.
    pub fn begin_mark(self) -> Option<Self> {
        match self {
            ReadState::Unread(n) => Some(ReadState::MarkingInFlight { unread: n }),
            ReadState::MarkingInFlight { .. } | ReadState::Read => None,
        }
    }

    pub fn confirm(self) -> Self {
        match self {
            ReadState::MarkingInFlight { .. } => ReadState::Read,
            other => other,
        }
    }

    /// Commit failed: adopt whatever the store says now.
    pub fn roll_back(self, store_unread: u64) -> Self {
        match self {
            ReadState::MarkingInFlight { .. } => ReadState::from_unread(store_unread),
            other => other,
        }
    }
}

/// Holds a thread's pending slot while its mark settles. Dropped without
/// [`finish`](Self::finish) (the caller went away mid-commit), it also throws
/// out the optimistic rows so the next read goes back to the store.
struct PendingMark<'a> {
    reconciler: &'a Reconciler,
    slot: (ThreadId, String),
    finished: bool,
}

impl PendingMark<'_> {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for PendingMark<'_> {
    fn drop(&mut self) {
        self.reconciler.pending().remove(&self.slot);
        if self.finished {
            return;
        }
        let (thread_id, viewer) = &self.slot;
        log::warn!("Read mark for thread {} abandoned before it settled", thread_id);
        let coordinator = &self.reconciler.coordinator;
        coordinator.discard(&CacheKey::thread_detail(*thread_id, viewer.as_str()));
        coordinator.discard(&CacheKey::unread_count(viewer.as_str()));
    }
}

/// Applies read actions optimistically, commits them, and rolls back to the
/// store's view when a commit fails.
pub struct Reconciler {
    coordinator: Coordinator,
    store: Arc<dyn ThreadStore>,
    commit_timeout: Duration,
    pending: Mutex<HashMap<(ThreadId, String), ReadState>>,
}

impl Reconciler {
    pub fn new(coordinator: Coordinator, store: Arc<dyn ThreadStore>, commit_timeout: Duration) -> Self {
        Reconciler {
            coordinator,
            store,
            commit_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<(ThreadId, String), ReadState>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget in-flight marks. Their commits still complete but no longer
    /// report a pending state.
    pub fn clear(&self) {
        self.pending().clear();
    }

    /// Unread count of a loaded thread, from its cached (possibly optimistic) rows.
    pub fn thread_unread(&self, thread_id: ThreadId, viewer: &str) -> Option<u64> {
        let key = CacheKey::thread_detail(thread_id, viewer);
        self.coordinator
            .get(&key)
            .and_then(|l| l.value.responses().map(|r| unread_count(r, viewer)))
    }

    pub fn read_state(&self, thread_id: ThreadId, viewer: &str) -> Option<ReadState> {
        if let Some(state) = self.pending().get(&(thread_id, viewer.to_string())) {
            return Some(*state);
        }
        self.thread_unread(thread_id, viewer)
            .map(ReadState::from_unread)
    }

    /// Unread responses across `user_id`'s threads, counted from the rows.
    pub async fn unread_total(&self, user_id: &str) -> Result<u64> {
        let lookup = self
            .coordinator
            .read(&CacheKey::unread_count(user_id))
            .await?;
        Ok(lookup
            .value
            .responses()
            .map(|r| unread_count(r, user_id))
            .unwrap_or(0))
    }

    /// Mark every response under `thread_id` read for `viewer`.
    ///
    /// The cached projection is updated before the commit goes out. If the
    /// commit fails or times out the thread is refetched from the store and
    /// `CommitFailed` is returned.
    pub async fn mark_thread_read(&self, thread_id: ThreadId, viewer: &str) -> Result<ReadState> {
        let detail = CacheKey::thread_detail(thread_id, viewer);
        let inbox = CacheKey::unread_count(viewer);

        let loaded = self.coordinator.read(&detail).await?;
        let unread = loaded
            .value
            .responses()
            .map(|r| unread_count(r, viewer))
            .unwrap_or(0);

        let slot = (thread_id, viewer.to_string());
        let marking = {
            let mut pending = self.pending();
            if let Some(state) = pending.get(&slot) {
                log::debug!("Thread {} already being marked read", thread_id);
                return Ok(*state);
            }
            match ReadState::from_unread(unread).begin_mark() {
                Some(state) => {
                    pending.insert(slot.clone(), state);
                    state
                }
                None => return Ok(ReadState::Read),
            }
        };
        let guard = PendingMark {
            reconciler: self,
            slot,
            finished: false,
        };

        let stamp = now_micros();
        let stamp_rows = |v: &mut CacheValue| {
            v.responses_mut()
                .is_some_and(|rows| stamp_read(rows, thread_id, viewer, stamp) > 0)
        };
        self.coordinator.mutate(&detail, &stamp_rows);
        self.coordinator.mutate(&inbox, &stamp_rows);
        log::debug!("Thread {} marked read locally ({} unread)", thread_id, unread);

        let commit =
            tokio::time::timeout(self.commit_timeout, self.store.mark_read(thread_id, viewer)).await;
        let reason = match commit {
            Ok(Ok(affected)) => {
                log::debug!("Thread {} read commit stamped {} rows", thread_id, affected);
                guard.finish();
                return Ok(marking.confirm());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.commit_timeout),
        };

        self.roll_back(thread_id, viewer, marking).await;
        guard.finish();
        Err(SyncError::CommitFailed(reason))
    }

    /// Throw away the optimistic rows and reload the thread (and the viewer's
    /// inbox, if loaded) from the store.
    async fn roll_back(
        &self,
        thread_id: ThreadId,
        viewer: &str,
        marking: ReadState,
    ) {
        log::warn!("Read commit for thread {} failed, refetching", thread_id);
        let detail = CacheKey::thread_detail(thread_id, viewer);
        let inbox = CacheKey::unread_count(viewer);

        let state = match self.coordinator.revalidate(&detail).await {
            Ok(value) => marking.roll_back(
                value
                    .responses()
                    .map(|r| unread_count(r, viewer))
                    .unwrap_or(0),
            ),
            Err(e) => {
                // Nothing trustworthy to show; drop the optimistic rows.
                log::error!("Refetch of thread {} after failed commit: {}", thread_id, e);
                self.coordinator.discard(&detail);
                let previous = match marking {
                    ReadState::MarkingInFlight { unread } => unread,
                    other => other.unread(),
                };
                marking.roll_back(previous)
            }
        };

        if self.coordinator.get(&inbox).is_some() {
            if let Err(e) = self.coordinator.revalidate(&inbox).await {
                log::error!("Refetch of inbox {} after failed commit: {}", viewer, e);
                self.coordinator.discard(&inbox);
            }
        }

        log::info!("Thread {} rolled back to {:?}", thread_id, state);
    }
}

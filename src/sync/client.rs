use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::cursor::{self, CursorToken};
use crate::core::models::{unread_count, Page, Response, ThreadId};
use crate::core::store::ThreadStore;
use crate::error::{Result, SyncError};
use crate::sync::cache::{CacheKey, CacheValue, Coordinator, Freshness};
use crate::sync::pager::QueryEngine;
use crate::sync::push::Topic;
use crate::sync::reconcile::{ReadState, Reconciler};

/// A page of the feed plus how much to trust it.
#[derive(Debug, Clone, Serialize)]
pub struct PageView {
    #[serde(flatten)]
    pub page: Page,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub thread_id: ThreadId,
    pub responses: Vec<Response>,
    pub unread: u64,
    pub freshness: Freshness,
}

/// What the rest of the application talks to. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    viewer: String,
    engine: Arc<QueryEngine>,
    coordinator: Coordinator,
    reconciler: Arc<Reconciler>,
    sweep_interval: Duration,
}

impl SyncClient {
    pub fn new(store: Arc<dyn ThreadStore>, config: &Config, viewer: impl Into<String>) -> Self {
        let engine = Arc::new(QueryEngine::from_config(store.clone(), config));
        let coordinator = Coordinator::new(
            engine.clone(),
            config.stale_policy(),
            config.cache_capacity,
        );
        let reconciler = Arc::new(Reconciler::new(
            coordinator.clone(),
            store,
            config.commit_timeout(),
        ));
        SyncClient {
            viewer: viewer.into(),
            engine,
            coordinator,
            reconciler,
            sweep_interval: config.sweep_interval(),
        }
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Keys whose cached value changed, for re-rendering.
    pub fn updates(&self) -> broadcast::Receiver<CacheKey> {
        self.coordinator.updates()
    }

    /// Cache key for a feed page, after size clamping and cursor decoding.
    pub fn page_key(&self, page_size: u32, cursor: Option<&CursorToken>) -> Result<CacheKey> {
        let size = self.engine.limits().resolve(page_size)?;
        let before = cursor.map(cursor::decode).transpose()?;
        Ok(CacheKey::thread_list(size, before))
    }

    pub async fn fetch_page(&self, page_size: u32, cursor: Option<&CursorToken>) -> Result<PageView> {
        let key = self.page_key(page_size, cursor)?;
        let lookup = self.coordinator.read(&key).await?;
        let CacheValue::Page(page) = lookup.value else {
            return Err(SyncError::StoreUnavailable(format!("{key:?} holds no page")));
        };
        Ok(PageView {
            page,
            freshness: lookup.freshness,
        })
    }

    pub async fn thread(&self, thread_id: ThreadId) -> Result<ThreadView> {
        let key = CacheKey::thread_detail(thread_id, self.viewer.as_str());
        let lookup = self.coordinator.read(&key).await?;
        let CacheValue::Responses(responses) = lookup.value else {
            return Err(SyncError::StoreUnavailable(format!("{key:?} holds no responses")));
        };
        Ok(ThreadView {
            thread_id,
            unread: unread_count(&responses, &self.viewer),
            responses,
            freshness: lookup.freshness,
        })
    }

    pub async fn mark_thread_read(&self, thread_id: ThreadId) -> Result<ReadState> {
        self.reconciler
            .mark_thread_read(thread_id, &self.viewer)
            .await
    }

    pub async fn get_unread_total(&self, user_id: &str) -> Result<u64> {
        self.reconciler.unread_total(user_id).await
    }

    pub fn thread_unread(&self, thread_id: ThreadId) -> Option<u64> {
        self.reconciler.thread_unread(thread_id, &self.viewer)
    }

    pub fn read_state(&self, thread_id: ThreadId) -> Option<ReadState> {
        self.reconciler.read_state(thread_id, &self.viewer)
    }

    pub fn subscribe(&self, key: &CacheKey) -> usize {
        self.coordinator.subscribe(key)
    }

    pub fn unsubscribe(&self, key: &CacheKey) -> usize {
        self.coordinator.unsubscribe(key)
    }

    pub fn invalidate(&self, scope: &Topic) -> usize {
        self.coordinator.invalidate(scope)
    }

    /// Feed one raw push-channel topic in.
    pub fn handle_push(&self, topic: &str) -> Result<usize> {
        let scope: Topic = topic.parse()?;
        Ok(self.coordinator.invalidate(&scope))
    }

    /// Session end (logout, user switch).
    pub fn clear(&self) {
        self.coordinator.clear();
        self.reconciler.clear();
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.coordinator.spawn_sweeper(self.sweep_interval)
    }
}

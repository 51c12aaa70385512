use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::core::cursor::{self, Cursor, CursorToken};
use crate::core::models::{Page, Response, ThreadId};
use crate::core::store::ThreadStore;
use crate::error::{Result, SyncError};
use crate::sync::cache::{CacheKey, CacheValue, Loader};

/// Page-size bounds applied before anything reaches the store.
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default_size: u32,
    pub max_size: u32,
    /// Reject oversized requests with `CapacityExceeded` instead of clamping.
    pub reject_oversized: bool,
}

impl PageLimits {
    pub fn resolve(&self, requested: u32) -> Result<u32> {
        if requested == 0 {
            return Ok(self.default_size.min(self.max_size).max(1));
        }
        if requested <= self.max_size {
            return Ok(requested);
        }
        if self.reject_oversized {
            return Err(SyncError::CapacityExceeded {
                requested,
                max: self.max_size,
            });
        }
        log::debug!("Clamping page size {} to {}", requested, self.max_size);
        Ok(self.max_size)
    }
}

/// Bounded retries with exponential backoff for transient store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any single store call.
    pub timeout: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Issues bounded keyset range queries against the store.
pub struct QueryEngine {
    store: Arc<dyn ThreadStore>,
    limits: PageLimits,
    retry: RetryPolicy,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn ThreadStore>, limits: PageLimits, retry: RetryPolicy) -> Self {
        QueryEngine {
            store,
            limits,
            retry,
        }
    }

    pub fn from_config(store: Arc<dyn ThreadStore>, config: &Config) -> Self {
        Self::new(store, config.page_limits(), config.retry_policy())
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Fetch the page after `cursor` (or the newest page when `None`).
    pub async fn fetch_page(&self, page_size: u32, cursor: Option<&CursorToken>) -> Result<Page> {
        let before = cursor.map(cursor::decode).transpose()?;
        self.fetch_page_from(page_size, before).await
    }

    pub async fn fetch_page_from(&self, page_size: u32, before: Option<Cursor>) -> Result<Page> {
        let size = self.limits.resolve(page_size)?;

        // Peek one row ahead instead of counting.
        let mut rows = self
            .with_retry("fetch_threads", || {
                self.store.fetch_threads(size.saturating_add(1), before)
            })
            .await?;

        let next_cursor = if rows.len() > size as usize {
            rows.truncate(size as usize);
            rows.last().map(cursor::encode)
        } else {
            None
        };
        Ok(Page { rows, next_cursor })
    }

    pub async fn fetch_thread(&self, thread_id: ThreadId) -> Result<Vec<Response>> {
        self.with_retry("fetch_responses", || self.store.fetch_responses(thread_id))
            .await
    }

    pub async fn fetch_inbox(&self, owner_id: &str) -> Result<Vec<Response>> {
        self.with_retry("fetch_inbox", || self.store.fetch_inbox(owner_id))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.retry.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => SyncError::StoreUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.retry.timeout
                )),
            };

            attempt += 1;
            if !err.is_transient() || attempt >= attempts {
                if err.is_transient() {
                    log::error!("{} failed after {} attempts: {}", op, attempt, err);
                }
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt - 1);
            log::warn!(
                "{} failed (attempt {}/{}), retrying in {:?}: {}",
                op,
                attempt,
                attempts,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Loader for QueryEngine {
    async fn load(&self, key: &CacheKey) -> Result<CacheValue> {
        match key {
            CacheKey::ThreadList { page_size, cursor } => self
                .fetch_page_from(*page_size, *cursor)
                .await
                .map(CacheValue::Page),
            CacheKey::ThreadDetail { thread_id, .. } => self
                .fetch_thread(*thread_id)
                .await
                .map(CacheValue::Responses),
            CacheKey::UnreadCount { viewer } => {
                self.fetch_inbox(viewer).await.map(CacheValue::Responses)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::core::models::NewThread;
    use crate::core::testing::FaultyStore;

    fn limits() -> PageLimits {
        PageLimits {
            default_size: 20,
            max_size: 50,
            reject_oversized: false,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }

    async fn seeded(count: i64) -> Arc<FaultyStore> {
        let store = Arc::new(FaultyStore::new());
        for i in 1..=count {
            store
                .inner
                .insert_thread(NewThread {
                    created_at: 1_000 + i,
                    owner_id: "alice".into(),
                    content: format!("thread {i}"),
                })
                .await
                .unwrap();
        }
        store
    }

    fn ids(page: &Page) -> Vec<i64> {
        page.rows.iter().map(|t| t.id).collect()
    }

    #[test]
    fn page_size_resolution() {
        let l = limits();
        assert_eq!(l.resolve(0).unwrap(), 20);
        assert_eq!(l.resolve(7).unwrap(), 7);
        assert_eq!(l.resolve(50).unwrap(), 50);
        assert_eq!(l.resolve(500).unwrap(), 50);

        let strict = PageLimits {
            reject_oversized: true,
            ..l
        };
        assert_eq!(
            strict.resolve(51).unwrap_err(),
            SyncError::CapacityExceeded {
                requested: 51,
                max: 50
            }
        );
    }

    #[tokio::test]
    async fn walks_five_rows_in_pages_of_two() {
        let store = seeded(5).await;
        let engine = QueryEngine::new(store.clone(), limits(), retry());

        let first = engine.fetch_page(2, None).await.unwrap();
        assert_eq!(ids(&first), vec![5, 4]);
        assert_eq!(first.next_cursor.as_ref().unwrap().as_str(), "1004:4");

        let second = engine
            .fetch_page(2, first.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(ids(&second), vec![3, 2]);
        assert_eq!(second.next_cursor.as_ref().unwrap().as_str(), "1002:2");

        let third = engine
            .fetch_page(2, second.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(ids(&third), vec![1]);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn exact_multiple_ends_without_dangling_cursor() {
        let store = seeded(4).await;
        let engine = QueryEngine::new(store, limits(), retry());

        let first = engine.fetch_page(2, None).await.unwrap();
        let second = engine
            .fetch_page(2, first.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(ids(&second), vec![2, 1]);
        assert!(!second.has_more());
    }

    #[tokio::test]
    async fn no_skip_or_duplicate_under_concurrent_inserts() {
        let store = seeded(9).await;
        let engine = QueryEngine::new(store.clone(), limits(), retry());
        let original: HashSet<i64> = (1..=9).collect();

        let mut seen = Vec::new();
        let mut cursor: Option<CursorToken> = None;
        let mut round = 0;
        loop {
            let page = engine.fetch_page(2, cursor.as_ref()).await.unwrap();
            seen.extend(ids(&page));

            // New rows land between fetches, some sharing the newest timestamp.
            round += 1;
            for created_at in [1_009, 5_000 + round] {
                store
                    .inner
                    .insert_thread(NewThread {
                        created_at,
                        owner_id: "bob".into(),
                        content: "late".into(),
                    })
                    .await
                    .unwrap();
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 9);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), original);
    }

    #[tokio::test]
    async fn delete_between_pages_does_not_shift_boundary() {
        let store = seeded(6).await;
        let engine = QueryEngine::new(store.clone(), limits(), retry());

        let first = engine.fetch_page(2, None).await.unwrap();
        assert_eq!(ids(&first), vec![6, 5]);
        store.inner.delete_thread(5).await.unwrap();
        store.inner.delete_thread(4).await.unwrap();

        let second = engine
            .fetch_page(2, first.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(ids(&second), vec![3, 2]);
    }

    #[tokio::test]
    async fn malformed_cursor_never_reaches_store() {
        let store = seeded(3).await;
        let engine = QueryEngine::new(store.clone(), limits(), retry());

        let err = engine
            .fetch_page(2, Some(&CursorToken::from("not-a-cursor")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedCursor(_)));
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let store = seeded(3).await;
        store.fail_next_fetches(2);
        let engine = QueryEngine::new(store.clone(), limits(), retry());

        let started = tokio::time::Instant::now();
        let page = engine.fetch_page(10, None).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2, 1]);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 3);
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = seeded(3).await;
        store.fail_next_fetches(10);
        let engine = QueryEngine::new(store.clone(), limits(), retry());

        let err = engine.fetch_page(10, None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oversized_request_is_clamped() {
        let store = seeded(5).await;
        let engine = QueryEngine::new(
            store,
            PageLimits {
                default_size: 2,
                max_size: 3,
                reject_oversized: false,
            },
            retry(),
        );
        let page = engine.fetch_page(1_000, None).await.unwrap();
        assert_eq!(ids(&page), vec![5, 4, 3]);
        assert!(page.has_more());
    }

    #[tokio::test]
    async fn unbounded_max_page_size_does_not_overflow() {
        let store = seeded(3).await;
        let engine = QueryEngine::new(
            store,
            PageLimits {
                default_size: 20,
                max_size: u32::MAX,
                reject_oversized: true,
            },
            retry(),
        );
        let page = engine.fetch_page(u32::MAX, None).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2, 1]);
        assert!(!page.has_more());
    }

    #[tokio::test]
    async fn loader_serves_every_key_class() {
        let store = seeded(2).await;
        let engine = QueryEngine::new(store, limits(), retry());

        let list = engine
            .load(&CacheKey::thread_list(1, None))
            .await
            .unwrap();
        assert_eq!(list.page().unwrap().rows.len(), 1);

        let detail = engine
            .load(&CacheKey::thread_detail(1, "alice"))
            .await
            .unwrap();
        assert!(detail.responses().unwrap().is_empty());

        let inbox = engine.load(&CacheKey::unread_count("alice")).await.unwrap();
        assert!(inbox.responses().unwrap().is_empty());
    }
}

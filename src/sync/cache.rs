//! Cache & invalidation coordinator.
//!
//! Every read and write of a cache key goes through [`Coordinator`], which
//! serializes them under one lock that is never held across an await.
//!
//! ## Ordering
//!
//! Each fetch or local mutation takes a [`Ticket`] when it is *issued*. A
//! result only lands if its ticket is newer than the one held by the entry,
//! so a slow response to an old request can never overwrite a newer value
//! (last-write-wins by issue order, not completion order).
//!
//! ## Staleness
//!
//! Invalidation marks entries dirty but keeps the value so it can still be
//! served (stale-while-revalidate). Keys with live subscribers are refetched
//! in the background; unwatched keys just stay dirty until someone reads or
//! subscribes again.
//!
//! ## Eviction
//!
//! `IndexMap` keeps entries in access order. When a capacity bound is set,
//! the least recently used entry *without subscribers* is dropped first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::cursor::Cursor;
use crate::core::models::{Page, Response, ThreadId};
use crate::error::Result;
use crate::sync::push::Topic;

/// Tagged query shape + parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ThreadList {
        page_size: u32,
        cursor: Option<Cursor>,
    },
    ThreadDetail {
        thread_id: ThreadId,
        viewer: String,
    },
    UnreadCount {
        viewer: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    ThreadList,
    ThreadDetail,
    UnreadCount,
}

impl CacheKey {
    pub fn thread_list(page_size: u32, cursor: Option<Cursor>) -> Self {
        CacheKey::ThreadList { page_size, cursor }
    }

    pub fn thread_detail(thread_id: ThreadId, viewer: impl Into<String>) -> Self {
        CacheKey::ThreadDetail {
            thread_id,
            viewer: viewer.into(),
        }
    }

    pub fn unread_count(viewer: impl Into<String>) -> Self {
        CacheKey::UnreadCount {
            viewer: viewer.into(),
        }
    }

    pub fn class(&self) -> KeyClass {
        match self {
            CacheKey::ThreadList { .. } => KeyClass::ThreadList,
            CacheKey::ThreadDetail { .. } => KeyClass::ThreadDetail,
            CacheKey::UnreadCount { .. } => KeyClass::UnreadCount,
        }
    }

    /// Push topic whose events invalidate this key.
    pub fn topic(&self) -> Topic {
        match self {
            CacheKey::ThreadList { .. } => Topic::Threads,
            CacheKey::ThreadDetail { thread_id, .. } => Topic::Thread(*thread_id),
            CacheKey::UnreadCount { viewer } => Topic::Inbox(viewer.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Page(Page),
    /// Response rows. Unread counts are always derived from these.
    Responses(Vec<Response>),
}

impl CacheValue {
    pub fn page(&self) -> Option<&Page> {
        match self {
            CacheValue::Page(p) => Some(p),
            CacheValue::Responses(_) => None,
        }
    }

    pub fn responses(&self) -> Option<&[Response]> {
        match self {
            CacheValue::Responses(r) => Some(r),
            CacheValue::Page(_) => None,
        }
    }

    pub fn responses_mut(&mut self) -> Option<&mut Vec<Response>> {
        match self {
            CacheValue::Responses(r) => Some(r),
            CacheValue::Page(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Dirty or past its staleness window; a refresh is due.
    Stale,
    /// Stale for longer than its staleness window. Show an "out of date" hint.
    OutOfDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: CacheValue,
    pub freshness: Freshness,
    pub fetched_at: Instant,
}

/// Revalidation window per key class.
#[derive(Debug, Clone, Copy)]
pub struct StalePolicy {
    pub thread_list: Duration,
    pub thread_detail: Duration,
    pub unread_count: Duration,
}

impl StalePolicy {
    pub fn uniform(window: Duration) -> Self {
        StalePolicy {
            thread_list: window,
            thread_detail: window,
            unread_count: window,
        }
    }

    pub fn stale_after(&self, class: KeyClass) -> Duration {
        match class {
            KeyClass::ThreadList => self.thread_list,
            KeyClass::ThreadDetail => self.thread_detail,
            KeyClass::UnreadCount => self.unread_count,
        }
    }
}

/// Knows how to fetch the authoritative value for a key.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<CacheValue>;
}

/// Issue-order stamp for fetches and mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Copy)]
struct Dirty {
    since: Instant,
    /// Latest invalidation. Only a fetch issued after this clears the flag.
    ticket: Ticket,
}

struct Entry {
    value: CacheValue,
    fetched_at: Instant,
    dirty: Option<Dirty>,
    ticket: Ticket,
}

impl Entry {
    fn freshness(&self, window: Duration, now: Instant) -> Freshness {
        let stale_since = match self.dirty {
            Some(d) => Some(d.since),
            None => {
                let expiry = self.fetched_at + window;
                (now > expiry).then_some(expiry)
            }
        };
        match stale_since {
            None => Freshness::Fresh,
            Some(since) if now.saturating_duration_since(since) > window => Freshness::OutOfDate,
            Some(_) => Freshness::Stale,
        }
    }
}

struct State {
    entries: IndexMap<CacheKey, Entry>,
    subscribers: HashMap<CacheKey, usize>,
    topics: HashMap<Topic, usize>,
    /// Keys with a background refetch running → whether another pass was requested.
    in_flight: HashMap<CacheKey, bool>,
    next_ticket: u64,
    /// Results issued at or before this ticket predate the last clear.
    cleared_at: Ticket,
    /// Bumped by every clear. Background loops from an older epoch stop.
    epoch: u64,
}

impl State {
    fn issue(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket(self.next_ticket)
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(idx) = self.entries.get_index_of(key) {
            let last = self.entries.len() - 1;
            self.entries.move_index(idx, last);
        }
    }

    fn evict(&mut self, capacity: Option<usize>) -> Vec<CacheKey> {
        let Some(cap) = capacity else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.entries.len() > cap {
            let victim = self
                .entries
                .keys()
                .position(|k| !self.subscribers.contains_key(k));
            match victim.and_then(|idx| self.entries.shift_remove_index(idx)) {
                Some((key, _)) => evicted.push(key),
                // everything left is watched
                None => break,
            }
        }
        evicted
    }
}

struct Inner {
    state: Mutex<State>,
    loader: Arc<dyn Loader>,
    policy: StalePolicy,
    capacity: Option<usize>,
    updates: broadcast::Sender<CacheKey>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(loader: Arc<dyn Loader>, policy: StalePolicy, capacity: Option<usize>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Coordinator {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: IndexMap::new(),
                    subscribers: HashMap::new(),
                    topics: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_ticket: 0,
                    cleared_at: Ticket(0),
                    epoch: 0,
                }),
                loader,
                policy,
                capacity,
                updates,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announces every key whose held value changed.
    pub fn updates(&self) -> broadcast::Receiver<CacheKey> {
        self.inner.updates.subscribe()
    }

    /// Stamp a request at issue time. Pass the ticket to [`apply`](Self::apply)
    /// when the result comes back.
    pub fn issue_ticket(&self) -> Ticket {
        self.state().issue()
    }

    // -- lookups --------------------------------------------------------------

    /// Pure lookup: never fetches.
    pub fn get(&self, key: &CacheKey) -> Option<CacheLookup> {
        let now = Instant::now();
        let window = self.inner.policy.stale_after(key.class());
        let mut state = self.state();
        let lookup = state.entries.get(key).map(|e| CacheLookup {
            value: e.value.clone(),
            freshness: e.freshness(window, now),
            fetched_at: e.fetched_at,
        })?;
        state.touch(key);
        Some(lookup)
    }

    /// Consumer read path. A miss is fetched in the foreground. A stale hit is
    /// returned as-is while one background revalidation runs.
    pub async fn read(&self, key: &CacheKey) -> Result<CacheLookup> {
        if let Some(hit) = self.get(key) {
            if hit.freshness != Freshness::Fresh {
                self.spawn_revalidate(key.clone());
            }
            return Ok(hit);
        }

        let ticket = self.issue_ticket();
        let value = self.inner.loader.load(key).await?;
        self.apply(key.clone(), ticket, value.clone());
        Ok(self.get(key).unwrap_or_else(|| CacheLookup {
            value,
            freshness: Freshness::Fresh,
            fetched_at: Instant::now(),
        }))
    }

    /// Forced foreground refetch. Returns whatever the entry holds afterwards.
    pub async fn revalidate(&self, key: &CacheKey) -> Result<CacheValue> {
        let ticket = self.issue_ticket();
        let value = self.inner.loader.load(key).await?;
        if self.apply(key.clone(), ticket, value.clone()) {
            return Ok(value);
        }
        Ok(self.get(key).map(|l| l.value).unwrap_or(value))
    }

    pub fn is_dirty(&self, key: &CacheKey) -> bool {
        self.state()
            .entries
            .get(key)
            .is_some_and(|e| e.dirty.is_some())
    }

    pub fn is_revalidating(&self, key: &CacheKey) -> bool {
        self.state().in_flight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- writes ---------------------------------------------------------------

    /// Store `value` as fetched now.
    pub fn set(&self, key: CacheKey, value: CacheValue) {
        let ticket = self.issue_ticket();
        self.apply(key, ticket, value);
    }

    /// Land a fetch result issued under `ticket`. Returns false if a newer
    /// value already landed (or the cache was cleared since).
    pub fn apply(&self, key: CacheKey, ticket: Ticket, value: CacheValue) -> bool {
        let now = Instant::now();
        let mut state = self.state();
        if ticket <= state.cleared_at {
            log::debug!("Dropping result for {:?} issued before clear", key);
            return false;
        }
        match state.entries.get_mut(&key) {
            Some(entry) if entry.ticket > ticket => {
                log::debug!("Discarding superseded result for {:?}", key);
                return false;
            }
            Some(entry) => {
                entry.value = value;
                entry.fetched_at = now;
                entry.ticket = ticket;
                if entry.dirty.is_some_and(|d| d.ticket < ticket) {
                    entry.dirty = None;
                }
            }
            None => {
                state.entries.insert(
                    key.clone(),
                    Entry {
                        value,
                        fetched_at: now,
                        dirty: None,
                        ticket,
                    },
                );
            }
        }
        state.touch(&key);
        let evicted = state.evict(self.inner.capacity);
        drop(state);

        for k in evicted {
            log::debug!("Evicted {:?}", k);
        }
        let _ = self.inner.updates.send(key);
        true
    }

    /// Apply a local (optimistic) change to a cached value. The mutation takes
    /// a ticket, so fetches issued before it can no longer overwrite it.
    /// `f` returns whether it changed anything. Returns false on a miss.
    pub fn mutate<F>(&self, key: &CacheKey, f: F) -> bool
    where
        F: FnOnce(&mut CacheValue) -> bool,
    {
        let mut state = self.state();
        let ticket = state.issue();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if !f(&mut entry.value) {
            return false;
        }
        entry.ticket = ticket;
        drop(state);

        let _ = self.inner.updates.send(key.clone());
        true
    }

    /// Drop a single entry outright.
    pub fn discard(&self, key: &CacheKey) -> bool {
        self.state().entries.shift_remove(key).is_some()
    }

    /// Session end: forget every entry, subscription and in-flight result.
    pub fn clear(&self) {
        let mut state = self.state();
        let ticket = state.issue();
        state.cleared_at = ticket;
        state.epoch += 1;
        let dropped = state.entries.len();
        state.entries.clear();
        state.subscribers.clear();
        state.topics.clear();
        state.in_flight.clear();
        log::info!("Cache cleared ({} entries)", dropped);
    }

    // -- invalidation ---------------------------------------------------------

    /// Mark every key in `scope` dirty. Returns how many entries were marked.
    pub fn invalidate(&self, scope: &Topic) -> usize {
        self.invalidate_where(|k| k.topic() == *scope)
    }

    pub fn invalidate_key(&self, key: &CacheKey) -> usize {
        self.invalidate_where(|k| k == key)
    }

    pub fn invalidate_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let now = Instant::now();
        let mut state = self.state();
        let ticket = state.issue();
        let mut marked = 0;
        let mut refetch = Vec::new();

        let State {
            entries,
            subscribers,
            ..
        } = &mut *state;
        for (key, entry) in entries.iter_mut().filter(|(k, _)| pred(k)) {
            match entry.dirty.as_mut() {
                Some(d) => d.ticket = ticket,
                None => entry.dirty = Some(Dirty { since: now, ticket }),
            }
            marked += 1;
            if subscribers.contains_key(key) {
                refetch.push(key.clone());
            }
        }
        drop(state);

        if marked > 0 {
            log::debug!(
                "Invalidated {} entries, {} watched",
                marked,
                refetch.len()
            );
        }
        for key in refetch {
            self.spawn_revalidate(key);
        }
        marked
    }

    // -- subscriptions --------------------------------------------------------

    /// Register interest in `key`. A dirty or aged entry is revalidated as
    /// soon as someone starts watching it. Returns the new subscriber count.
    pub fn subscribe(&self, key: &CacheKey) -> usize {
        let now = Instant::now();
        let window = self.inner.policy.stale_after(key.class());
        let mut state = self.state();

        let count = {
            let c = state.subscribers.entry(key.clone()).or_insert(0);
            *c += 1;
            *c
        };
        if count == 1 {
            *state.topics.entry(key.topic()).or_insert(0) += 1;
        }
        let needs_refresh = state
            .entries
            .get(key)
            .is_some_and(|e| e.freshness(window, now) != Freshness::Fresh);
        drop(state);

        if needs_refresh {
            self.spawn_revalidate(key.clone());
        }
        count
    }

    /// Returns the remaining subscriber count.
    pub fn unsubscribe(&self, key: &CacheKey) -> usize {
        let mut state = self.state();
        let remaining = match state.subscribers.get_mut(key) {
            Some(c) => {
                *c -= 1;
                *c
            }
            None => return 0,
        };
        if remaining == 0 {
            state.subscribers.remove(key);
            let topic = key.topic();
            if let Some(n) = state.topics.get_mut(&topic) {
                *n -= 1;
                if *n == 0 {
                    state.topics.remove(&topic);
                }
            }
            let evicted = state.evict(self.inner.capacity);
            drop(state);
            for k in evicted {
                log::debug!("Evicted {:?}", k);
            }
        }
        remaining
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.state().subscribers.get(key).copied().unwrap_or(0)
    }

    /// Push topics that at least one watched key depends on.
    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.state().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    // -- background revalidation ---------------------------------------------

    /// Revalidate watched entries whose window has passed. Covers push events
    /// that never arrived. Returns how many refetches were started.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let due: Vec<CacheKey> = {
            let state = self.state();
            state
                .entries
                .iter()
                .filter(|(k, _)| state.subscribers.contains_key(*k))
                .filter(|(k, e)| {
                    e.freshness(self.inner.policy.stale_after(k.class()), now) != Freshness::Fresh
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &due {
            self.spawn_revalidate(key.clone());
        }
        due.len()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let started = this.sweep();
                if started > 0 {
                    log::debug!("Sweep revalidating {} entries", started);
                }
            }
        })
    }

    fn spawn_revalidate(&self, key: CacheKey) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime; {:?} stays dirty until next read", key);
            return;
        };
        let epoch = {
            let mut state = self.state();
            if let Some(rerun) = state.in_flight.get_mut(&key) {
                *rerun = true;
                return;
            }
            state.in_flight.insert(key.clone(), false);
            state.epoch
        };
        let this = self.clone();
        handle.spawn(async move { this.revalidate_loop(key, epoch).await });
    }

    async fn revalidate_loop(self, key: CacheKey, epoch: u64) {
        loop {
            let ticket = self.issue_ticket();
            match self.inner.loader.load(&key).await {
                Ok(value) => {
                    self.apply(key.clone(), ticket, value);
                }
                Err(e) => {
                    log::warn!("Background revalidation of {:?} failed: {}", key, e);
                }
            }
            let done = {
                let mut state = self.state();
                if state.epoch != epoch {
                    log::debug!("Cache cleared, dropping refetch loop for {:?}", key);
                    break;
                }
                match state.in_flight.get_mut(&key) {
                    Some(rerun) if *rerun => {
                        *rerun = false;
                        false
                    }
                    _ => {
                        state.in_flight.remove(&key);
                        true
                    }
                }
            };
            if done {
                break;
            }
        }
    }
}

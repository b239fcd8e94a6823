//! Tri-state relevance of actors and posts, fronted by bounded caches.

use std::{
    collections::VecDeque,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::info;

use crate::{
    store::{StoreHandle, StoreResult, models::Actor},
    types::Did,
};

/// Whether an entity matters to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relevance {
    /// In the tracked network.
    Relevant,
    /// Stored, but outside the network.
    Irrelevant,
    /// Not stored yet.
    Absent,
}

impl Relevance {
    /// Relevance of an actor row, or of a missing one.
    pub fn of_actor(actor: Option<&Actor>) -> Self {
        match actor {
            None => Self::Absent,
            Some(a) if a.in_network() => Self::Relevant,
            Some(_) => Self::Irrelevant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PostEntry {
    Present(Did),
    Absent,
}

/// Insertion-ordered map that evicts its oldest entry past `capacity`.
///
/// Overwrites and removals leave stale slots in `order`; they are skipped at eviction and
/// compacted once the queue grows to twice the capacity.
#[derive(Debug)]
pub(crate) struct FifoCache<K, V> {
    capacity: usize,
    map: HashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    next_stamp: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> FifoCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
            next_stamp: 0,
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|(v, _)| v.clone())
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.map.insert(key.clone(), (value, stamp));
        self.order.push_back((key, stamp));

        while self.map.len() > self.capacity {
            let Some((old, old_stamp)) = self.order.pop_front() else {
                break;
            };
            if self.map.get(&old).is_some_and(|(_, s)| *s == old_stamp) {
                self.map.remove(&old);
            }
        }
        if self.order.len() > self.capacity * 2 {
            let map = &self.map;
            self.order
                .retain(|(k, s)| map.get(k).is_some_and(|(_, live)| live == s));
        }
    }

    pub(crate) fn remove(&mut self, key: &K) {
        self.map.remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

/// Hit/miss totals since start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Actor lookups served from cache.
    pub actor_hits: u64,
    /// Actor lookups that went to the store.
    pub actor_misses: u64,
    /// Post lookups served from cache.
    pub post_hits: u64,
    /// Post lookups that went to the store.
    pub post_misses: u64,
}

/// Actor and post relevance caches over a [`StoreHandle`].
///
/// Each cache sits behind its own async mutex, held across check, fetch and insert so a miss is
/// fetched once. When both are needed the post lock is taken first.
pub struct RelevanceCaches {
    store: StoreHandle,
    actors: Mutex<FifoCache<Did, Relevance>>,
    posts: Mutex<FifoCache<String, PostEntry>>,
    actor_counters: Counters,
    post_counters: Counters,
    stats_interval: Duration,
    last_report: Mutex<Instant>,
}

impl RelevanceCaches {
    /// Two caches of `capacity` entries each, reporting stats every `stats_interval`.
    pub fn new(store: StoreHandle, capacity: usize, stats_interval: Duration) -> Self {
        Self {
            store,
            actors: Mutex::new(FifoCache::new(capacity)),
            posts: Mutex::new(FifoCache::new(capacity)),
            actor_counters: Counters::default(),
            post_counters: Counters::default(),
            stats_interval,
            last_report: Mutex::new(Instant::now()),
        }
    }

    /// Totals so far.
    pub fn stats(&self) -> CacheStats {
        let (actor_hits, actor_misses) = self.actor_counters.snapshot();
        let (post_hits, post_misses) = self.post_counters.snapshot();
        CacheStats {
            actor_hits,
            actor_misses,
            post_hits,
            post_misses,
        }
    }

    /// Relevance of `did`, loading it on a miss.
    pub async fn actor_relevance(&self, did: &str) -> StoreResult<Relevance> {
        let mut cache = self.actors.lock().await;
        let key = did.to_string();
        if let Some(r) = cache.get(&key) {
            self.actor_counters.hit();
            return Ok(r);
        }
        self.actor_counters.miss();

        let lookup = vec![key.clone()];
        let found = self.store.call(move |s| s.actors_by_did(&lookup)).await?;
        let relevance = Relevance::of_actor(found.first());
        cache.insert(key, relevance);
        drop(cache);

        self.maybe_report().await;
        Ok(relevance)
    }

    /// Author of a stored post, or `None` when the post is absent.
    pub async fn post_author(&self, uri: &str) -> StoreResult<Option<Did>> {
        let mut cache = self.posts.lock().await;
        let key = uri.to_string();
        if let Some(entry) = cache.get(&key) {
            self.post_counters.hit();
            return Ok(match entry {
                PostEntry::Present(author) => Some(author),
                PostEntry::Absent => None,
            });
        }
        self.post_counters.miss();

        let lookup = vec![key.clone()];
        let found = self.store.call(move |s| s.post_authors(&lookup)).await?;
        let author = found.into_iter().next().map(|(_, author)| author);
        cache.insert(
            key,
            match &author {
                Some(a) => PostEntry::Present(a.clone()),
                None => PostEntry::Absent,
            },
        );
        drop(cache);

        self.maybe_report().await;
        Ok(author)
    }

    /// Absent when the post is not stored, otherwise the relevance of its author.
    pub async fn post_relevance(&self, uri: &str) -> StoreResult<Relevance> {
        match self.post_author(uri).await? {
            None => Ok(Relevance::Absent),
            Some(author) => self.actor_relevance(&author).await,
        }
    }

    /// Loads every uncached entity among `dids` and `uris` with one bulk lookup per cache.
    ///
    /// Authors of the primed posts are primed too.
    pub async fn prime(&self, dids: &[Did], uris: &[String]) -> StoreResult<()> {
        let mut posts = self.posts.lock().await;

        let mut wanted_posts: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for uri in uris {
            if !posts.contains(uri) && seen.insert(uri.as_str()) {
                wanted_posts.push(uri.clone());
            }
        }

        if !wanted_posts.is_empty() {
            let lookup = wanted_posts.clone();
            let found: HashMap<String, Did> = self
                .store
                .call(move |s| s.post_authors(&lookup))
                .await?
                .into_iter()
                .collect();
            for uri in wanted_posts {
                let entry = match found.get(&uri) {
                    Some(author) => PostEntry::Present(author.clone()),
                    None => PostEntry::Absent,
                };
                posts.insert(uri, entry);
            }
        }

        let mut authors: Vec<Did> = dids.to_vec();
        for uri in uris {
            if let Some(PostEntry::Present(author)) = posts.get(uri) {
                authors.push(author);
            }
        }

        let mut actors = self.actors.lock().await;
        drop(posts);

        let mut seen = HashSet::new();
        let wanted_actors: Vec<Did> = authors
            .into_iter()
            .filter(|d| !actors.contains(d) && seen.insert(d.clone()))
            .collect();

        if !wanted_actors.is_empty() {
            let lookup = wanted_actors.clone();
            let found: HashMap<Did, Actor> = self
                .store
                .call(move |s| s.actors_by_did(&lookup))
                .await?
                .into_iter()
                .map(|a| (a.did.clone(), a))
                .collect();
            for did in wanted_actors {
                let relevance = Relevance::of_actor(found.get(&did));
                actors.insert(did, relevance);
            }
        }

        Ok(())
    }

    /// Forgets cached actors.
    pub async fn invalidate_actors(&self, dids: &[Did]) {
        let mut cache = self.actors.lock().await;
        for did in dids {
            cache.remove(did);
        }
    }

    /// Forgets cached posts.
    pub async fn invalidate_posts(&self, uris: &[String]) {
        let mut cache = self.posts.lock().await;
        for uri in uris {
            cache.remove(uri);
        }
    }

    /// Number of cached `(actors, posts)`.
    pub async fn sizes(&self) -> (usize, usize) {
        let posts = self.posts.lock().await.len();
        let actors = self.actors.lock().await.len();
        (actors, posts)
    }

    async fn maybe_report(&self) {
        let Ok(mut last) = self.last_report.try_lock() else {
            return;
        };
        if last.elapsed() < self.stats_interval {
            return;
        }
        *last = Instant::now();
        let stats = self.stats();
        info!(
            actor_hits = stats.actor_hits,
            actor_misses = stats.actor_misses,
            post_hits = stats.post_hits,
            post_misses = stats.post_misses,
            "relevance cache stats"
        );
    }
}

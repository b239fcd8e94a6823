//! Durable store abstraction and its SQLite implementation.

/// Row types.
pub mod models;
/// SQLite implementation.
pub mod sqlite;

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::types::{Did, FeedVersion, Seq};

use self::models::{
    Actor, Like, Post, PostScore, QueuedUnknown, ServedPost, UnknownKind, UnknownThing,
};

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failed.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A JSON column did not round-trip.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The blocking task panicked or was cancelled.
    #[error("join error: {0}")]
    Join(String),
    /// Anything else.
    #[error("{0}")]
    Message(String),
}

/// Result of a store call.
pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional key/value and relational store the core runs against.
///
/// Multi-row writes are atomic. Every insert keyed by URI is insert-or-ignore so replays after a
/// crash are no-ops.
pub trait Store: Send {
    /// Saved cursor of `service`.
    fn load_cursor(&self, service: &str) -> StoreResult<Option<Seq>>;
    /// Upserts the checkpoint; a lower cursor than the stored one is ignored.
    fn save_cursor(&mut self, service: &str, cursor: Seq) -> StoreResult<()>;

    /// Stored actors among `dids`.
    fn actors_by_did(&self, dids: &[Did]) -> StoreResult<Vec<Actor>>;
    /// Inserts or fully replaces an actor row, moderation flags included.
    fn put_actor(&mut self, actor: &Actor) -> StoreResult<()>;
    /// Inserts `actor` when new; otherwise refreshes profile fields and counts only.
    ///
    /// Returns true when a row was inserted.
    fn upsert_observed_actor(&mut self, actor: &Actor) -> StoreResult<bool>;
    /// Marks accounts as deleted, inserting tombstones for unknown ones.
    fn tombstone_actors(&mut self, dids: &[Did]) -> StoreResult<usize>;

    /// `(uri, author)` pairs for the stored posts among `uris`.
    fn post_authors(&self, uris: &[String]) -> StoreResult<Vec<(String, Did)>>;
    /// Stored posts among `uris`.
    fn posts_by_uri(&self, uris: &[String]) -> StoreResult<Vec<Post>>;
    /// Inserts new posts; known URIs are ignored.
    fn insert_posts(&mut self, posts: &[Post]) -> StoreResult<usize>;
    /// Inserts or refreshes the mutable fields of a post fetched from the network.
    fn upsert_post(&mut self, post: &Post) -> StoreResult<()>;
    /// Marks posts deleted, keeping the rows.
    fn soft_delete_posts(&mut self, uris: &[String]) -> StoreResult<usize>;
    /// Pins or unpins a post. Returns false for an unknown URI.
    fn set_pinned(&mut self, uri: &str, pinned: bool) -> StoreResult<bool>;
    /// Live, unpinned posts indexed inside `(since, until)`.
    fn posts_between(&self, since: OffsetDateTime, until: OffsetDateTime) -> StoreResult<Vec<Post>>;
    /// Live pinned posts, newest first.
    fn pinned_posts(&self) -> StoreResult<Vec<Post>>;
    /// Top-level posts among `uris` indexed before `indexed_before` and not rescanned since
    /// `rescan_before`.
    fn stale_posts(
        &self,
        uris: &[String],
        indexed_before: OffsetDateTime,
        rescan_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    /// Inserts new likes; known URIs are ignored.
    fn insert_likes(&mut self, likes: &[Like]) -> StoreResult<usize>;
    /// Removes likes.
    fn delete_likes(&mut self, uris: &[String]) -> StoreResult<usize>;
    /// Stored likes among `uris`.
    fn likes_by_uri(&self, uris: &[String]) -> StoreResult<Vec<Like>>;
    /// Likes created inside `(since, until)`.
    fn likes_between(&self, since: OffsetDateTime, until: OffsetDateTime) -> StoreResult<Vec<Like>>;

    /// Records posts handed out to clients.
    fn record_served(&mut self, served: &[ServedPost]) -> StoreResult<()>;
    /// Most recent feed that served `post_uri` to `client` at or after `since`.
    fn served_feed(
        &self,
        post_uri: &str,
        client: &str,
        since: OffsetDateTime,
    ) -> StoreResult<Option<String>>;

    /// Queues work; an existing `(identifier, kind)` entry keeps its place and gains a payload
    /// if it had none.
    fn enqueue_unknown(&mut self, things: &[UnknownThing]) -> StoreResult<usize>;
    /// Up to `limit` queue entries after `after_id`, oldest first.
    fn unknown_page(&self, after_id: i64, limit: usize) -> StoreResult<Vec<QueuedUnknown>>;
    /// Removes finished queue entries.
    fn resolve_unknown(&mut self, ids: &[i64]) -> StoreResult<usize>;
    /// Drops the queued `kind` entries for `identifiers`, deferred payloads included.
    fn forget_unknown(&mut self, kind: UnknownKind, identifiers: &[String]) -> StoreResult<usize>;
    /// Queue length.
    fn unknown_count(&self) -> StoreResult<usize>;

    /// Writes one feed version atomically; a duplicate row fails the whole write with
    /// [`StoreError::Conflict`].
    fn insert_scores(&mut self, rows: &[PostScore]) -> StoreResult<usize>;
    /// Removes score rows created before `created_before`.
    fn prune_scores(&mut self, created_before: OffsetDateTime) -> StoreResult<usize>;
    /// Newest version of `feed`.
    fn latest_version(&self, feed: &str) -> StoreResult<Option<FeedVersion>>;
    /// URIs of one feed version ordered by score, highest first.
    fn score_page(
        &self,
        feed: &str,
        version: FeedVersion,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>>;
}

/// Shared async handle over a [`Store`].
///
/// Calls run on the blocking pool under one lock, so the synchronous store never stalls the
/// runtime.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Box<dyn Store>>>,
}

impl StoreHandle {
    /// Wraps `store` for shared async use.
    pub fn new(store: impl Store + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    /// Runs `f` against the store on the blocking pool.
    pub async fn call<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn Store) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut store = inner.blocking_lock();
            f(store.as_mut())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

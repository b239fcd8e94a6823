//! Accept / discard / defer decisions over classified batches and their durable application.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    firehose::{
        classify::{CreateOp, OpsByType},
        records::{LikeRecord, PostRecord},
    },
    relevance::{Relevance, RelevanceCaches},
    store::{
        StoreError, StoreHandle,
        models::{DeferredOp, Like, Post, UnknownKind, UnknownThing},
    },
    types::Did,
};

/// Likes are attributed to a feed that served the post this recently.
pub const ATTRIBUTION_WINDOW: Duration = Duration::minutes(5);

/// Failures while applying a batch.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of the relevance rule for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Store it.
    Accept,
    /// Drop it.
    Discard,
    /// Waiting on the listed absent references.
    Defer(Vec<UnknownThing>),
}

/// Counts of what one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Posts stored.
    pub posts_accepted: usize,
    /// Posts with nothing relevant about them.
    pub posts_discarded: usize,
    /// Posts queued until their references are known.
    pub posts_deferred: usize,
    /// Posts soft-deleted.
    pub posts_deleted: usize,
    /// Likes stored.
    pub likes_accepted: usize,
    /// Likes with nothing relevant about them.
    pub likes_discarded: usize,
    /// Likes queued until their post is known.
    pub likes_deferred: usize,
    /// Likes removed.
    pub likes_deleted: usize,
    /// Follow creates and deletes seen.
    pub follows: usize,
}

/// Decisions for a batch, not yet written.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Accepted posts.
    pub posts: Vec<Post>,
    /// Accepted likes, attributed on commit.
    pub likes: Vec<CreateOp<LikeRecord>>,
    /// Queue entries: deferred candidates and their absent references.
    pub queued: Vec<UnknownThing>,
    /// URIs of candidates that were deferred.
    pub deferred: HashSet<String>,
    /// Posts to soft-delete.
    pub deleted_posts: Vec<String>,
    /// Likes to remove.
    pub deleted_likes: Vec<String>,
    /// Counts so far.
    pub report: ApplyReport,
}

/// Applies classified batches against the store through the relevance caches.
pub struct Ingestor {
    store: StoreHandle,
    caches: Arc<RelevanceCaches>,
}

impl Ingestor {
    /// Builds an ingestor deciding through `caches`.
    pub fn new(store: StoreHandle, caches: Arc<RelevanceCaches>) -> Self {
        Self { store, caches }
    }

    /// Relevance caches this ingestor decides through.
    pub fn caches(&self) -> &Arc<RelevanceCaches> {
        &self.caches
    }

    /// Evaluates and writes one batch. Replaying a batch is a no-op.
    pub async fn apply(&self, ops: OpsByType) -> Result<ApplyReport, IngestError> {
        let eval = self.evaluate(&ops, OffsetDateTime::now_utc()).await?;
        self.commit(eval).await
    }

    /// Decides every create in `ops`.
    ///
    /// Posts accepted earlier in the batch count as stored for later candidates.
    pub async fn evaluate(
        &self,
        ops: &OpsByType,
        now: OffsetDateTime,
    ) -> Result<Evaluation, IngestError> {
        let mut dids: Vec<Did> = Vec::new();
        let mut uris: Vec<String> = Vec::new();
        for op in &ops.posts.created {
            dids.push(op.author.clone());
            uris.extend(post_refs(&op.record));
        }
        for op in &ops.likes.created {
            dids.push(op.author.clone());
            uris.push(op.record.subject.uri.clone());
        }
        self.caches.prime(&dids, &uris).await?;

        let mut eval = Evaluation::default();
        let mut overlay: HashMap<String, Did> = HashMap::new();

        for op in &ops.posts.created {
            let refs = post_refs(&op.record);
            match self.decide(&op.author, &refs, &overlay).await? {
                Decision::Accept => {
                    overlay.insert(op.uri.clone(), op.author.clone());
                    eval.posts.push(Post::from_create(op, now));
                    eval.report.posts_accepted += 1;
                }
                Decision::Discard => eval.report.posts_discarded += 1,
                Decision::Defer(absent) => {
                    debug!(uri = %op.uri, absent = absent.len(), "deferring post");
                    eval.deferred.insert(op.uri.clone());
                    eval.queued.push(UnknownThing::deferred(DeferredOp::Post(op.clone())));
                    eval.queued.extend(absent);
                    eval.report.posts_deferred += 1;
                }
            }
        }

        for op in &ops.likes.created {
            let refs = [op.record.subject.uri.clone()];
            match self.decide(&op.author, &refs, &overlay).await? {
                Decision::Accept => {
                    eval.likes.push(op.clone());
                    eval.report.likes_accepted += 1;
                }
                Decision::Discard => eval.report.likes_discarded += 1,
                Decision::Defer(absent) => {
                    debug!(uri = %op.uri, absent = absent.len(), "deferring like");
                    eval.deferred.insert(op.uri.clone());
                    eval.queued.push(UnknownThing::deferred(DeferredOp::Like(op.clone())));
                    eval.queued.extend(absent);
                    eval.report.likes_deferred += 1;
                }
            }
        }

        eval.deleted_posts = ops.posts.deleted.iter().map(|d| d.uri.clone()).collect();
        eval.deleted_likes = ops.likes.deleted.iter().map(|d| d.uri.clone()).collect();
        eval.report.follows = ops.follows.created.len() + ops.follows.deleted.len();

        Ok(eval)
    }

    /// Relevance rule over a candidate's author and referenced posts.
    ///
    /// Nothing relevant discards; otherwise any absent entity defers; otherwise accepts.
    pub async fn decide(
        &self,
        author: &Did,
        refs: &[String],
        overlay: &HashMap<String, Did>,
    ) -> Result<Decision, IngestError> {
        let mut any_relevant = false;
        let mut absent = Vec::new();

        match self.caches.actor_relevance(author).await? {
            Relevance::Relevant => any_relevant = true,
            Relevance::Irrelevant => {}
            Relevance::Absent => absent.push(UnknownThing::actor(author.clone())),
        }

        for uri in refs {
            let ref_author = match overlay.get(uri) {
                Some(a) => Some(a.clone()),
                None => self.caches.post_author(uri).await?,
            };
            let Some(ref_author) = ref_author else {
                absent.push(UnknownThing::post(uri.clone()));
                continue;
            };
            match self.caches.actor_relevance(&ref_author).await? {
                Relevance::Relevant => any_relevant = true,
                Relevance::Irrelevant => {}
                Relevance::Absent => absent.push(UnknownThing::actor(ref_author)),
            }
        }

        Ok(if !any_relevant {
            Decision::Discard
        } else if !absent.is_empty() {
            Decision::Defer(absent)
        } else {
            Decision::Accept
        })
    }

    /// Writes an evaluation and invalidates the cache entries it touched.
    pub async fn commit(&self, eval: Evaluation) -> Result<ApplyReport, IngestError> {
        let Evaluation {
            posts,
            likes,
            queued,
            deleted_posts,
            deleted_likes,
            mut report,
            ..
        } = eval;

        let touched: Vec<String> = posts
            .iter()
            .map(|p| p.uri.clone())
            .chain(deleted_posts.iter().cloned())
            .collect();

        let (posts_deleted, likes_deleted) = self
            .store
            .call(move |s| {
                s.insert_posts(&posts)?;

                let mut rows = Vec::with_capacity(likes.len());
                for op in likes {
                    let now = OffsetDateTime::now_utc();
                    let attributed_feed =
                        s.served_feed(&op.record.subject.uri, &op.author, now - ATTRIBUTION_WINDOW)?;
                    let created_at = op.record.created().unwrap_or(now);
                    rows.push(Like {
                        uri: op.uri,
                        cid: op.cid,
                        liker: op.author,
                        post_uri: op.record.subject.uri,
                        post_cid: op.record.subject.cid,
                        created_at,
                        attributed_feed,
                    });
                }
                s.insert_likes(&rows)?;

                if !queued.is_empty() {
                    s.enqueue_unknown(&queued)?;
                }
                let posts_deleted = s.soft_delete_posts(&deleted_posts)?;
                let likes_deleted = s.delete_likes(&deleted_likes)?;
                // A delete also cancels a create still waiting in the queue.
                s.forget_unknown(UnknownKind::Post, &deleted_posts)?;
                s.forget_unknown(UnknownKind::Like, &deleted_likes)?;
                Ok((posts_deleted, likes_deleted))
            })
            .await?;

        self.caches.invalidate_posts(&touched).await;

        report.posts_deleted = posts_deleted;
        report.likes_deleted = likes_deleted;
        Ok(report)
    }
}

/// Posts a post points at: reply root, reply parent, quote.
pub fn post_refs(record: &PostRecord) -> Vec<String> {
    let mut refs = Vec::new();
    if let Some(reply) = &record.reply {
        refs.push(reply.root.uri.clone());
        if reply.parent.uri != reply.root.uri {
            refs.push(reply.parent.uri.clone());
        }
    }
    if let Some(quoted) = record.quoted() {
        refs.push(quoted.uri.clone());
    }
    refs
}

//! Drains the queue of deferred work until entities reach a terminal state.

use std::sync::Arc;

use hashbrown::HashSet;
use time::OffsetDateTime;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    config::BackfillConfig,
    firehose::classify::OpsByType,
    ingest::{IngestError, Ingestor, post_refs},
    resolver::Resolver,
    shutdown::Shutdown,
    store::{
        StoreError, StoreHandle,
        models::{DeferredOp, Post, QueuedUnknown, UnknownKind, UnknownThing},
    },
    types::{AtUri, Did},
};

/// Failures that stop a drain.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Re-evaluating deferred candidates failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// What one [`Backfill::drain`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Passes run.
    pub passes: usize,
    /// Profiles fetched and stored.
    pub actors_stored: usize,
    /// Accounts the network no longer has.
    pub actors_missing: usize,
    /// Posts fetched and stored.
    pub posts_stored: usize,
    /// Posts the network no longer has.
    pub posts_missing: usize,
    /// Deferred candidates accepted on re-evaluation.
    pub candidates_accepted: usize,
    /// Deferred candidates discarded or dropped.
    pub candidates_dropped: usize,
    /// Queue entries left after the drain.
    pub remaining: usize,
}

impl DrainReport {
    fn resolved(&self) -> usize {
        self.actors_stored
            + self.actors_missing
            + self.posts_stored
            + self.posts_missing
            + self.candidates_accepted
            + self.candidates_dropped
    }
}

/// Resolves the unknown-entity queue through a [`Resolver`].
pub struct Backfill {
    store: StoreHandle,
    ingestor: Arc<Ingestor>,
    resolver: Arc<dyn Resolver>,
    config: BackfillConfig,
}

impl Backfill {
    /// Builds a backfill over `store`, re-deciding candidates through `ingestor`.
    pub fn new(
        store: StoreHandle,
        ingestor: Arc<Ingestor>,
        resolver: Arc<dyn Resolver>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            store,
            ingestor,
            resolver,
            config,
        }
    }

    /// Runs passes over the queue while they make progress, up to `max_passes`.
    pub async fn drain(&self) -> Result<DrainReport, BackfillError> {
        let mut report = DrainReport::default();
        for _ in 0..self.config.max_passes {
            let before = report.resolved();
            self.pass(&mut report).await?;
            report.passes += 1;
            if report.resolved() == before {
                break;
            }
        }
        report.remaining = self.store.call(|s| s.unknown_count()).await?;
        Ok(report)
    }

    /// Drains on an interval until shutdown. Errors are logged and the loop carries on.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(interval_secs = self.config.interval_secs, "backfill loop started");
        loop {
            if shutdown.is_set() {
                break;
            }
            match self.drain().await {
                Ok(report) if report.resolved() > 0 => info!(
                    passes = report.passes,
                    actors_stored = report.actors_stored,
                    actors_missing = report.actors_missing,
                    posts_stored = report.posts_stored,
                    posts_missing = report.posts_missing,
                    accepted = report.candidates_accepted,
                    dropped = report.candidates_dropped,
                    remaining = report.remaining,
                    "backfill drained"
                ),
                Ok(report) => debug!(remaining = report.remaining, "backfill idle"),
                Err(err) => error!(error = %err, "backfill drain failed"),
            }
            if !shutdown.sleep(Duration::from_secs(self.config.interval_secs)).await {
                break;
            }
        }
        info!("backfill loop stopped");
    }

    async fn pass(&self, report: &mut DrainReport) -> Result<(), BackfillError> {
        let page_size = self.config.page_size;
        let mut after = 0;
        loop {
            let page = self
                .store
                .call(move |s| s.unknown_page(after, page_size))
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = last.id;
            self.process_page(page, report).await?;
        }
    }

    async fn process_page(
        &self,
        page: Vec<QueuedUnknown>,
        report: &mut DrainReport,
    ) -> Result<(), BackfillError> {
        let mut actors = Vec::new();
        let mut posts = Vec::new();
        let mut candidates = Vec::new();
        let mut orphaned = Vec::new();

        for entry in page {
            match (entry.thing.kind, entry.thing.payload) {
                (_, Some(op)) => candidates.push((entry.id, op)),
                (UnknownKind::Actor, None) => actors.push((entry.id, entry.thing.identifier)),
                (UnknownKind::Post, None) => posts.push((entry.id, entry.thing.identifier)),
                (UnknownKind::Like, None) => {
                    warn!(uri = %entry.thing.identifier, "queued like without payload, dropping");
                    orphaned.push(entry.id);
                }
            }
        }

        if !orphaned.is_empty() {
            report.candidates_dropped += orphaned.len();
            self.store.call(move |s| s.resolve_unknown(&orphaned)).await?;
        }
        self.resolve_actors(actors, report).await?;
        self.resolve_posts(posts, report).await?;
        self.reevaluate(candidates, report).await?;
        Ok(())
    }

    async fn resolve_actors(
        &self,
        entries: Vec<(i64, Did)>,
        report: &mut DrainReport,
    ) -> Result<(), BackfillError> {
        if entries.is_empty() {
            return Ok(());
        }

        let dids: Vec<Did> = entries.iter().map(|(_, d)| d.clone()).collect();
        let lookup = dids.clone();
        let known: HashSet<Did> = self
            .store
            .call(move |s| s.actors_by_did(&lookup))
            .await?
            .into_iter()
            .map(|a| a.did)
            .collect();

        let (already, wanted): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, d)| known.contains(d));
        let mut done: Vec<i64> = already.iter().map(|(id, _)| *id).collect();

        let wanted_dids: Vec<Did> = wanted.iter().map(|(_, d)| d.clone()).collect();
        let mut found = Vec::new();
        let mut missing = Vec::new();
        if !wanted_dids.is_empty() {
            match self.resolver.fetch_profiles(&wanted_dids).await {
                Ok(profiles) => {
                    let returned: HashSet<Did> = profiles.iter().map(|p| p.did.clone()).collect();
                    missing = wanted_dids
                        .iter()
                        .filter(|d| !returned.contains(*d))
                        .cloned()
                        .collect();
                    found = profiles;
                    done.extend(wanted.iter().map(|(id, _)| *id));
                }
                Err(err) => {
                    warn!(error = %err, count = wanted_dids.len(), "profile lookup failed");
                }
            }
        }

        report.actors_stored += found.len();
        report.actors_missing += missing.len();
        self.store
            .call(move |s| {
                for profile in &found {
                    s.upsert_observed_actor(&profile.to_external_actor())?;
                }
                s.tombstone_actors(&missing)?;
                s.resolve_unknown(&done)?;
                Ok(())
            })
            .await?;
        self.ingestor.caches().invalidate_actors(&dids).await;
        Ok(())
    }

    async fn resolve_posts(
        &self,
        entries: Vec<(i64, String)>,
        report: &mut DrainReport,
    ) -> Result<(), BackfillError> {
        if entries.is_empty() {
            return Ok(());
        }

        let uris: Vec<String> = entries.iter().map(|(_, u)| u.clone()).collect();
        let lookup = uris.clone();
        let known: HashSet<String> = self
            .store
            .call(move |s| s.post_authors(&lookup))
            .await?
            .into_iter()
            .map(|(uri, _)| uri)
            .collect();

        let (already, wanted): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, u)| known.contains(u));
        let mut done: Vec<i64> = already.iter().map(|(id, _)| *id).collect();
        let wanted_uris: Vec<String> = wanted.iter().map(|(_, u)| u.clone()).collect();

        let fetched = if wanted_uris.is_empty() {
            Vec::new()
        } else {
            match self.resolver.fetch_posts(&wanted_uris).await {
                Ok(posts) => posts,
                Err(err) => {
                    warn!(error = %err, count = wanted_uris.len(), "post lookup failed");
                    self.store.call(move |s| s.resolve_unknown(&done)).await?;
                    return Ok(());
                }
            }
        };

        let now = OffsetDateTime::now_utc();
        let caches = self.ingestor.caches();
        let mut stored = Vec::new();
        let mut waiting_on = Vec::new();
        let mut returned = HashSet::new();

        for remote in fetched {
            returned.insert(remote.uri.clone());
            let mut absent = Vec::new();
            for r in post_refs(&remote.record) {
                if caches.post_author(&r).await?.is_none() {
                    absent.push(r);
                }
            }
            if absent.is_empty() {
                stored.push(remote);
            } else {
                debug!(uri = %remote.uri, absent = absent.len(), "fetched post waits on references");
                waiting_on.extend(absent.into_iter().map(UnknownThing::post));
            }
        }

        let mut tombstones = Vec::new();
        for (id, uri) in &wanted {
            if stored.iter().any(|p| &p.uri == uri) {
                done.push(*id);
            } else if !returned.contains(uri) {
                let Some(author) = AtUri::authority_of(uri) else {
                    warn!(%uri, "dropping queued post with no account in its uri");
                    done.push(*id);
                    continue;
                };
                tombstones.push(Post::tombstone(uri, author.to_string(), now));
                done.push(*id);
            }
        }

        report.posts_stored += stored.len();
        report.posts_missing += tombstones.len();

        let mut touched_posts: Vec<String> = stored.iter().map(|p| p.uri.clone()).collect();
        touched_posts.extend(tombstones.iter().map(|p| p.uri.clone()));
        let touched_actors: Vec<Did> = stored.iter().map(|p| p.author.did.clone()).collect();

        self.store
            .call(move |s| {
                for remote in &stored {
                    s.upsert_observed_actor(&remote.author.to_external_actor())?;
                    s.upsert_post(&remote.to_post(now))?;
                }
                s.insert_posts(&tombstones)?;
                if !waiting_on.is_empty() {
                    s.enqueue_unknown(&waiting_on)?;
                }
                s.resolve_unknown(&done)?;
                Ok(())
            })
            .await?;

        caches.invalidate_posts(&touched_posts).await;
        caches.invalidate_actors(&touched_actors).await;
        Ok(())
    }

    async fn reevaluate(
        &self,
        candidates: Vec<(i64, DeferredOp)>,
        report: &mut DrainReport,
    ) -> Result<(), BackfillError> {
        if candidates.is_empty() {
            return Ok(());
        }

        let mut ops = OpsByType::default();
        let mut ids = Vec::with_capacity(candidates.len());
        for (id, op) in candidates {
            match op {
                DeferredOp::Post(c) => {
                    ids.push((id, c.uri.clone()));
                    ops.posts.created.push(c);
                }
                DeferredOp::Like(c) => {
                    ids.push((id, c.uri.clone()));
                    ops.likes.created.push(c);
                }
            }
        }

        let eval = self
            .ingestor
            .evaluate(&ops, OffsetDateTime::now_utc())
            .await?;
        let still_deferred = eval.deferred.clone();
        let accepted = eval.report.posts_accepted + eval.report.likes_accepted;
        let dropped = eval.report.posts_discarded + eval.report.likes_discarded;
        self.ingestor.commit(eval).await?;

        let done: Vec<i64> = ids
            .into_iter()
            .filter(|(_, uri)| !still_deferred.contains(uri))
            .map(|(id, _)| id)
            .collect();
        report.candidates_accepted += accepted;
        report.candidates_dropped += dropped;
        self.store.call(move |s| s.resolve_unknown(&done)).await?;
        Ok(())
    }
}

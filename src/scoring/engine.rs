//! Periodic feed ranking over the lookback window.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::{
    config::ScoringConfig,
    relevance::RelevanceCaches,
    resolver::Resolver,
    shutdown::Shutdown,
    store::{
        StoreError, StoreHandle,
        models::{Actor, Like, Post, PostScore},
    },
    types::{Did, FeedVersion},
};

use super::{
    decay::{decay, rank_decay},
    feeds::{DecayParameters, FeedParameters, apply_remix, ratio_mix},
};

/// In-network posts per slot of out-of-network ones when mixing.
pub const IN_NETWORK_MIX: usize = 7;
/// Out-of-network slots per [`IN_NETWORK_MIX`] in-network ones.
pub const OUT_OF_NETWORK_MIX: usize = 1;

/// Failures of a scoring run.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A post eligible for ranking and the signal behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Post address.
    pub uri: String,
    /// Author DID.
    pub author: Did,
    /// Quoted post, if any.
    pub quote: Option<String>,
    /// When the post was stored.
    pub indexed_at: OffsetDateTime,
    /// Carries self-labels.
    pub labelled: bool,
    /// Attached images.
    pub media_count: u32,
    /// Images with alt text.
    pub media_with_alt_text_count: u32,
    /// Qualifying likes in the window.
    pub likes: u64,
    /// Author follower count.
    pub author_followers: i64,
    /// Author is in the focus population.
    pub author_in_focus: bool,
}

/// A ranked post.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    /// Post address.
    pub uri: String,
    /// Author DID.
    pub author: Did,
    /// Quoted post, if any.
    pub quote: Option<String>,
    /// When the post was stored.
    pub indexed_at: OffsetDateTime,
    /// Labelled post by an out-of-focus author.
    pub limited: bool,
    /// Rank score, highest first.
    pub score: f64,
}

/// Rows one run ranks over.
#[derive(Debug, Default, Clone)]
pub struct ScoringInput {
    /// Live, unpinned posts in the window.
    pub posts: Vec<Post>,
    /// Likes in the window.
    pub likes: Vec<Like>,
    /// Authors and likers by DID.
    pub actors: HashMap<Did, Actor>,
    /// Newest first.
    pub pinned: Vec<Post>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    InNetwork,
    OutOfNetwork,
}

/// `0.7` for media without any alt text, times a follower-count damping term.
pub fn multiplier(media_count: u32, media_with_alt_text_count: u32, followers: i64) -> f64 {
    let media = if media_count > 0 && media_with_alt_text_count == 0 {
        0.7
    } else {
        1.0
    };
    media * (0.7 - 0.1 * (followers as f64 / 800.0).atan())
}

/// Score before diminishing returns.
pub fn base_score(c: &Candidate, decay_params: Option<&DecayParameters>, now: OffsetDateTime) -> f64 {
    let (weight, gamma) = match decay_params {
        Some(p) => {
            let elapsed = (now - c.indexed_at).as_seconds_f64();
            let x = elapsed / p.inflection_secs as f64;
            (decay(x, p.alpha), p.gamma)
        }
        None => (1.0, 1.0),
    };
    let m = multiplier(c.media_count, c.media_with_alt_text_count, c.author_followers);
    weight * m * ((c.likes as f64).powf(gamma) + 2.0)
}

/// Scores, applies author then quote diminishing returns, sorts and truncates to `limit`.
pub fn score_candidates(
    candidates: &[Candidate],
    decay_params: Option<&DecayParameters>,
    now: OffsetDateTime,
    limit: usize,
) -> Vec<Scored> {
    let mut scored: Vec<Scored> = candidates
        .iter()
        .map(|c| Scored {
            uri: c.uri.clone(),
            author: c.author.clone(),
            quote: c.quote.clone(),
            indexed_at: c.indexed_at,
            limited: c.labelled && !c.author_in_focus,
            score: base_score(c, decay_params, now),
        })
        .collect();

    rank_decay(&mut scored, |s| Some(s.author.clone()), |s| &mut s.score);
    rank_decay(&mut scored, |s| s.quote.clone(), |s| &mut s.score);

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.uri.cmp(&b.uri)));
    scored.truncate(limit);
    scored
}

fn candidates(input: &ScoringInput, feed: &FeedParameters, pass: Pass) -> Vec<Candidate> {
    let mut likes: HashMap<&str, u64> = HashMap::new();
    for like in &input.likes {
        let Some(liker) = input.actors.get(&like.liker) else {
            continue;
        };
        if liker.is_excluded() || !(feed.include_out_of_focus_likes || liker.in_focus()) {
            continue;
        }
        *likes.entry(like.post_uri.as_str()).or_default() += 1;
    }

    input
        .posts
        .iter()
        .filter(|p| !p.is_pinned && !p.is_deleted)
        .filter_map(|p| {
            let count = *likes.get(p.uri.as_str())?;
            let author = input.actors.get(&p.author)?;
            if !author.is_rankable() {
                return None;
            }
            let eligible = match pass {
                Pass::InNetwork => {
                    author.in_network() && (feed.include_out_of_focus_posts || author.in_focus())
                }
                Pass::OutOfNetwork => !author.in_network() && author.in_focus(),
            };
            eligible.then(|| Candidate {
                uri: p.uri.clone(),
                author: p.author.clone(),
                quote: p.embed_uri.clone(),
                indexed_at: p.indexed_at,
                labelled: !p.labels.is_empty(),
                media_count: p.media_count,
                media_with_alt_text_count: p.media_with_alt_text_count,
                likes: count,
                author_followers: author.follower_count,
                author_in_focus: author.in_focus(),
            })
        })
        .collect()
}

/// Ordered URIs of one feed version: ranked posts with the pinned set after the first one.
pub fn build_feed(
    input: &ScoringInput,
    feed: &FeedParameters,
    config: &ScoringConfig,
    now: OffsetDateTime,
) -> Vec<String> {
    let decay_params = feed.decay.as_ref();
    let in_network = score_candidates(
        &candidates(input, feed, Pass::InNetwork),
        decay_params,
        now,
        config.in_network_limit,
    );
    let out_of_network = if feed.include_out_of_network_posts {
        score_candidates(
            &candidates(input, feed, Pass::OutOfNetwork),
            decay_params,
            now,
            config.out_of_network_limit,
        )
    } else {
        Vec::new()
    };

    let mut mixed = ratio_mix(&[
        (IN_NETWORK_MIX, in_network.as_slice()),
        (OUT_OF_NETWORK_MIX, out_of_network.as_slice()),
    ]);
    mixed.truncate(config.max_posts);
    let ranked: Vec<String> = apply_remix(feed.remix, mixed)
        .into_iter()
        .map(|s| s.uri)
        .collect();

    let mut out = Vec::with_capacity(ranked.len() + input.pinned.len());
    out.extend(ranked.first().cloned());
    out.extend(input.pinned.iter().map(|p| p.uri.clone()));
    out.extend(ranked.into_iter().skip(1));
    out
}

/// Output URIs of a run, best rank first: every feed's first post, then every feed's second, and
/// so on, each URI once.
pub fn refresh_order(feeds: &[Vec<String>]) -> Vec<String> {
    let depth = feeds.iter().map(Vec::len).max().unwrap_or(0);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for rank in 0..depth {
        for uri in feeds.iter().filter_map(|f| f.get(rank)) {
            if seen.insert(uri.as_str()) {
                out.push(uri.clone());
            }
        }
    }
    out
}

/// What one scoring run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Version written by this run.
    pub version: FeedVersion,
    /// `(feed, rows written)` for each feed that was stored.
    pub stored: Vec<(String, usize)>,
    /// Feeds whose version could not be stored.
    pub failed: Vec<String>,
    /// Shutdown was observed between feeds; nothing was pruned or refreshed.
    pub abandoned: bool,
    /// Old score rows removed.
    pub pruned: usize,
    /// Posts refreshed from the network.
    pub refreshed: usize,
}

/// Ranks every configured feed on an interval.
pub struct ScoringEngine {
    store: StoreHandle,
    resolver: Arc<dyn Resolver>,
    caches: Arc<RelevanceCaches>,
    config: ScoringConfig,
}

impl ScoringEngine {
    /// Builds an engine; `caches` are invalidated for refreshed authors.
    pub fn new(
        store: StoreHandle,
        resolver: Arc<dyn Resolver>,
        caches: Arc<RelevanceCaches>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            caches,
            config,
        }
    }

    /// Repeats runs with a cooldown until shutdown. Never returns early on error.
    pub async fn run_forever(&self, mut shutdown: Shutdown) {
        info!(feeds = self.config.feeds.len(), "scoring loop started");
        loop {
            if shutdown.is_set() {
                break;
            }
            if let Err(err) = self.run_once(&shutdown).await {
                error!(error = %err, "scoring run failed");
            }
            if !shutdown
                .sleep(std::time::Duration::from_secs(self.config.interval_secs))
                .await
            {
                break;
            }
        }
        info!("scoring loop stopped");
    }

    /// Scores every configured feed once, then prunes and refreshes.
    pub async fn run_once(&self, shutdown: &Shutdown) -> Result<RunReport, ScoringError> {
        let start = OffsetDateTime::now_utc();
        let version: FeedVersion = start.unix_timestamp();
        info!(version, "starting scoring run");

        let input = self.load_input(start).await?;
        let mut report = RunReport {
            version,
            ..RunReport::default()
        };
        let mut output: Vec<Vec<String>> = Vec::with_capacity(self.config.feeds.len());

        for feed in &self.config.feeds {
            let uris = build_feed(&input, feed, &self.config, start);
            output.push(uris.clone());

            match self.persist(&feed.name, version, start, &uris).await {
                Ok(n) => {
                    info!(feed = %feed.name, version, posts = n, "stored feed version");
                    report.stored.push((feed.name.clone(), n));
                }
                Err(ScoringError::Store(StoreError::Conflict(msg))) => {
                    warn!(feed = %feed.name, version, %msg, "unique violation storing feed version");
                    report.failed.push(feed.name.clone());
                }
                Err(err) => {
                    error!(feed = %feed.name, version, error = %err, "failed to store feed version");
                    report.failed.push(feed.name.clone());
                }
            }

            if shutdown.is_set() {
                warn!(version, "scoring run abandoned for shutdown");
                report.abandoned = true;
                return Ok(report);
            }
        }

        let end = OffsetDateTime::now_utc();
        info!(version, elapsed_ms = (end - start).whole_milliseconds() as i64, "scoring run done");

        let prune_before = start - Duration::minutes(self.config.prune_after_mins as i64);
        report.pruned = self
            .store
            .call(move |s| s.prune_scores(prune_before))
            .await?;

        if self.config.refresh.enabled {
            match self.refresh(refresh_order(&output), end).await {
                Ok(n) => report.refreshed = n,
                Err(err) => warn!(error = %err, "post refresh failed"),
            }
        }

        Ok(report)
    }

    async fn load_input(&self, start: OffsetDateTime) -> Result<ScoringInput, ScoringError> {
        let since = start - Duration::hours(self.config.effective_lookback_hours() as i64);
        let input = self
            .store
            .call(move |s| {
                let posts = s.posts_between(since, start)?;
                let likes = s.likes_between(since, start)?;
                let pinned = s.pinned_posts()?;

                let mut dids: Vec<Did> = posts.iter().map(|p| p.author.clone()).collect();
                dids.extend(likes.iter().map(|l| l.liker.clone()));
                dids.sort();
                dids.dedup();
                let actors = s
                    .actors_by_did(&dids)?
                    .into_iter()
                    .map(|a| (a.did.clone(), a))
                    .collect();

                Ok(ScoringInput {
                    posts,
                    likes,
                    actors,
                    pinned,
                })
            })
            .await?;
        debug!(
            posts = input.posts.len(),
            likes = input.likes.len(),
            actors = input.actors.len(),
            "loaded scoring window"
        );
        Ok(input)
    }

    async fn persist(
        &self,
        feed: &str,
        version: FeedVersion,
        created_at: OffsetDateTime,
        uris: &[String],
    ) -> Result<usize, ScoringError> {
        let n = uris.len() as i64;
        let rows: Vec<PostScore> = uris
            .iter()
            .enumerate()
            .map(|(i, uri)| PostScore {
                uri: uri.clone(),
                feed_name: feed.to_string(),
                version,
                score: n - i as i64,
                created_at,
            })
            .collect();
        Ok(self.store.call(move |s| s.insert_scores(&rows)).await?)
    }

    async fn refresh(&self, uris: Vec<String>, end: OffsetDateTime) -> Result<usize, ScoringError> {
        let refresh = &self.config.refresh;
        let indexed_before = end - Duration::minutes(refresh.min_age_mins as i64);
        let rescan_before = end - Duration::hours(refresh.rescan_after_hours as i64);
        let limit = refresh.limit;
        let stale = self
            .store
            .call(move |s| s.stale_posts(&uris, indexed_before, rescan_before, limit))
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!(posts = stale.len(), "refreshing posts");
        let fetched = match self.resolver.fetch_posts(&stale).await {
            Ok(posts) => posts,
            Err(err) => {
                warn!(error = %err, "refresh lookup failed");
                return Ok(0);
            }
        };

        let authors: Vec<Did> = fetched.iter().map(|p| p.author.did.clone()).collect();
        let refreshed = fetched.len();
        self.store
            .call(move |s| {
                for remote in &fetched {
                    s.upsert_observed_actor(&remote.author.to_external_actor())?;
                    s.upsert_post(&remote.to_post(end))?;
                }
                Ok(())
            })
            .await?;
        self.caches.invalidate_actors(&authors).await;
        Ok(refreshed)
    }
}

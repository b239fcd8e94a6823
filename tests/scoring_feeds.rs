use std::{sync::Arc, time::Duration as StdDuration};

use async_trait::async_trait;
use proptest::prelude::*;
use time::{Duration, OffsetDateTime};

use skyrank::{
    config::ScoringConfig,
    firehose::{classify::CreateOp, records::PostRecord},
    relevance::RelevanceCaches,
    resolver::{RemotePost, RemoteProfile, ResolveError, Resolver},
    scoring::{
        FeedError, ScoringEngine,
        decay::decay,
        engine::{Candidate, base_score, score_candidates},
        feed_page,
        feeds::DecayParameters,
        page::{NO_MORE_POSTS_CURSOR, PLACEHOLDER_FEED},
    },
    shutdown::Shutdown,
    store::{
        StoreHandle,
        models::{Actor, Like, Post},
        sqlite::SqliteStore,
    },
    types::Did,
};

const ALICE: &str = "did:plc:alice";
const BOB: &str = "did:plc:bob";
const CAROL: &str = "did:plc:carol";
const EXTERNAL: &str = "did:plc:external";

struct NoRemote;

#[async_trait]
impl Resolver for NoRemote {
    async fn fetch_profiles(&self, _dids: &[Did]) -> Result<Vec<RemoteProfile>, ResolveError> {
        Ok(Vec::new())
    }

    async fn fetch_posts(&self, _uris: &[String]) -> Result<Vec<RemotePost>, ResolveError> {
        Ok(Vec::new())
    }
}

fn candidate(uri: &str, likes: u64, indexed_at: OffsetDateTime) -> Candidate {
    Candidate {
        uri: uri.to_string(),
        author: ALICE.to_string(),
        quote: None,
        indexed_at,
        labelled: false,
        media_count: 0,
        media_with_alt_text_count: 0,
        likes,
        author_followers: 100,
        author_in_focus: true,
    }
}

proptest! {
    #[test]
    fn decay_strictly_decreases(x in 0.001f64..50.0, step in 0.001f64..10.0, alpha in 0.5f64..3.0) {
        prop_assert!(decay(x, alpha) > decay(x + step, alpha));
        prop_assert_eq!(decay(1.0, alpha), 1.0);
    }
}

#[test]
fn one_author_is_halved_per_rank() {
    let now = OffsetDateTime::now_utc();
    let params = DecayParameters::standard();
    let candidates: Vec<Candidate> = (0..10)
        .map(|i| candidate(&format!("p{i}"), 20, now - Duration::hours(1) - Duration::seconds(i)))
        .collect();

    let scored = score_candidates(&candidates, Some(&params), now, 100);
    assert_eq!(scored.len(), 10);
    let ratio = scored[0].score / scored[1].score;
    assert!((ratio - 2.0).abs() < 1e-3, "ratio {ratio}");
    assert!(scored[2].score <= scored[0].score / 4.0);
    assert!(scored.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn weaker_post_by_the_same_author_is_halved_exactly() {
    let now = OffsetDateTime::now_utc();
    let params = DecayParameters::standard();
    let a = candidate("a", 100, now - Duration::hours(1));
    let b = candidate("b", 10, now - Duration::hours(1));

    let scored = score_candidates(&[b.clone(), a.clone()], Some(&params), now, 10);
    assert_eq!(scored[0].uri, "a");
    assert_eq!(scored[0].score, base_score(&a, Some(&params), now));
    assert_eq!(scored[1].uri, "b");
    assert_eq!(scored[1].score, base_score(&b, Some(&params), now) / 2.0);
}

#[test]
fn truncates_to_the_limit() {
    let now = OffsetDateTime::now_utc();
    let candidates: Vec<Candidate> = (0..5)
        .map(|i| Candidate {
            author: format!("did:plc:{i}"),
            ..candidate(&format!("p{i}"), i, now)
        })
        .collect();
    let scored = score_candidates(&candidates, None, now, 3);
    let uris: Vec<&str> = scored.iter().map(|s| s.uri.as_str()).collect();
    assert_eq!(uris, vec!["p4", "p3", "p2"]);
}

fn post(author: &str, rkey: &str, indexed_at: OffsetDateTime) -> Post {
    let op = CreateOp {
        uri: format!("at://{author}/app.bsky.feed.post/{rkey}"),
        cid: format!("cid-{rkey}"),
        author: author.to_string(),
        record: PostRecord {
            text: rkey.to_string(),
            created_at: "2024-05-01T00:00:00Z".to_string(),
            reply: None,
            embed: None,
            labels: None,
        },
    };
    Post::from_create(&op, indexed_at)
}

fn like(liker: &str, post: &Post, created_at: OffsetDateTime) -> Like {
    Like {
        uri: format!("at://{liker}/app.bsky.feed.like/{}", post.cid),
        cid: format!("cid-like-{}", post.cid),
        liker: liker.to_string(),
        post_uri: post.uri.clone(),
        post_cid: post.cid.clone(),
        created_at,
        attributed_feed: None,
    }
}

fn fem(did: &str) -> Actor {
    Actor {
        autolabel_fem_vibes: true,
        ..Actor::new(did)
    }
}

struct Scenario {
    store: StoreHandle,
    engine: ScoringEngine,
    in_focus: Post,
    out_of_focus: Post,
    external: Post,
    pinned: Post,
}

async fn scenario() -> Scenario {
    let store = StoreHandle::new(SqliteStore::open_in_memory().expect("open sqlite"));
    let now = OffsetDateTime::now_utc();
    let hour_ago = now - Duration::hours(1);

    let in_focus = post(ALICE, "a", hour_ago);
    let out_of_focus = post(BOB, "b", hour_ago);
    let external = post(EXTERNAL, "e", hour_ago);
    let pinned = post(ALICE, "pin", now - Duration::hours(2));

    let actors = vec![
        fem(ALICE),
        Actor::new(BOB),
        fem(CAROL),
        Actor {
            is_external_to_network: true,
            ..fem(EXTERNAL)
        },
    ];
    let posts = vec![
        in_focus.clone(),
        out_of_focus.clone(),
        external.clone(),
        pinned.clone(),
    ];
    let liked_at = now - Duration::minutes(30);
    let likes = vec![
        like(CAROL, &in_focus, liked_at),
        like(CAROL, &out_of_focus, liked_at),
        like(CAROL, &external, liked_at),
        like(BOB, &in_focus, liked_at),
    ];
    let pinned_uri = pinned.uri.clone();
    store
        .call(move |s| {
            for a in &actors {
                s.put_actor(a)?;
            }
            s.insert_posts(&posts)?;
            s.insert_likes(&likes)?;
            s.set_pinned(&pinned_uri, true)?;
            Ok(())
        })
        .await
        .expect("seed scenario");

    let caches = Arc::new(RelevanceCaches::new(store.clone(), 1_000, StdDuration::from_secs(60)));
    let engine = ScoringEngine::new(
        store.clone(),
        Arc::new(NoRemote),
        caches,
        ScoringConfig::default(),
    );
    Scenario {
        store,
        engine,
        in_focus,
        out_of_focus,
        external,
        pinned,
    }
}

async fn whole_feed(store: &StoreHandle, feed: &str) -> Vec<String> {
    let page = feed_page(store, feed, None, 100, None).await.expect("page");
    page.feed.into_iter().map(|i| i.post).collect()
}

#[tokio::test]
async fn run_stores_every_feed_with_pins_after_the_first_post() {
    let sc = scenario().await;
    let (_trigger, shutdown) = Shutdown::new();
    let report = sc.engine.run_once(&shutdown).await.expect("run");
    assert_eq!(report.stored.len(), 5);
    assert!(report.failed.is_empty());
    assert!(!report.abandoned);

    let fox = whole_feed(&sc.store, "fox-feed").await;
    assert_eq!(
        fox,
        vec![
            sc.in_focus.uri.clone(),
            sc.pinned.uri.clone(),
            sc.out_of_focus.uri.clone(),
        ]
    );

    let vix = whole_feed(&sc.store, "vix-feed").await;
    assert_eq!(vix, vec![sc.in_focus.uri.clone(), sc.pinned.uri.clone()]);

    let votes = whole_feed(&sc.store, "vix-votes").await;
    assert_eq!(votes.len(), 4);
    assert_eq!(votes[1], sc.pinned.uri);
    assert_eq!(votes.last(), Some(&sc.external.uri));
}

#[tokio::test]
async fn pages_walk_a_version_then_fall_back_to_the_placeholder() {
    let sc = scenario().await;
    let (_trigger, shutdown) = Shutdown::new();
    let report = sc.engine.run_once(&shutdown).await.expect("run");

    let first = feed_page(&sc.store, "fox-feed", None, 2, Some(CAROL))
        .await
        .expect("first page");
    assert_eq!(first.feed.len(), 2);
    assert_eq!(first.cursor, format!("{}::2", report.version));

    let second = feed_page(&sc.store, "fox-feed", Some(&first.cursor), 2, Some(CAROL))
        .await
        .expect("second page");
    assert_eq!(second.feed.len(), 1);
    assert_eq!(second.cursor, format!("{}::3", report.version));

    let done = feed_page(&sc.store, "fox-feed", Some(&second.cursor), 2, None)
        .await
        .expect("past the end");
    assert_eq!(done.cursor, NO_MORE_POSTS_CURSOR);
    let placeholder: Vec<&str> = done.feed.iter().map(|i| i.post.as_str()).collect();
    assert_eq!(placeholder, PLACEHOLDER_FEED.to_vec());

    let pinned = sc.pinned.uri.clone();
    let since = OffsetDateTime::now_utc() - Duration::minutes(5);
    let served = sc
        .store
        .call(move |s| s.served_feed(&pinned, CAROL, since))
        .await
        .expect("served");
    assert_eq!(served.as_deref(), Some("fox-feed"));
}

#[tokio::test]
async fn unknown_feed_and_bad_cursor() {
    let sc = scenario().await;
    let page = feed_page(&sc.store, "no-such-feed", None, 10, None)
        .await
        .expect("empty feed");
    assert_eq!(page.cursor, NO_MORE_POSTS_CURSOR);
    assert_eq!(page.feed.len(), PLACEHOLDER_FEED.len());

    let err = feed_page(&sc.store, "fox-feed", Some("yesterday"), 10, None)
        .await
        .expect_err("malformed cursor");
    assert!(matches!(err, FeedError::MalformedCursor(_)));
}

#[tokio::test]
async fn shutdown_before_the_first_feed_abandons_the_run() {
    let sc = scenario().await;
    let (trigger, shutdown) = Shutdown::new();
    trigger.trigger();
    let report = sc.engine.run_once(&shutdown).await.expect("run");
    assert!(report.abandoned);
    assert_eq!(report.stored.len(), 1);
    assert_eq!(report.pruned, 0);
}

#[tokio::test]
async fn authors_flagged_for_review_are_left_out() {
    let sc = scenario().await;
    let flagged = Actor {
        flagged_for_manual_review: true,
        ..fem(ALICE)
    };
    sc.store
        .call(move |s| s.put_actor(&flagged))
        .await
        .expect("flag alice");

    let (_trigger, shutdown) = Shutdown::new();
    sc.engine.run_once(&shutdown).await.expect("run");

    let fox = whole_feed(&sc.store, "fox-feed").await;
    assert_eq!(fox, vec![sc.out_of_focus.uri.clone(), sc.pinned.uri.clone()]);
}

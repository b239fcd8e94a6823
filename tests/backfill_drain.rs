use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use skyrank::{
    backfill::Backfill,
    config::BackfillConfig,
    firehose::{
        classify::{CreateOp, DeleteOp, OpsByType},
        records::{LikeRecord, PostRecord, ReplyRef, StrongRef},
    },
    ingest::Ingestor,
    relevance::RelevanceCaches,
    resolver::{RemotePost, RemoteProfile, ResolveError, Resolver},
    store::{StoreHandle, models::Actor, sqlite::SqliteStore},
    types::Did,
};

const ALICE: &str = "did:plc:alice";
const ZED: &str = "did:plc:zed";

#[derive(Default)]
struct FakeResolver {
    profiles: HashMap<Did, RemoteProfile>,
    posts: HashMap<String, RemotePost>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeResolver {
    fn check(&self) -> Result<(), ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(ResolveError::RateLimited)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn fetch_profiles(&self, dids: &[Did]) -> Result<Vec<RemoteProfile>, ResolveError> {
        self.check()?;
        Ok(dids.iter().filter_map(|d| self.profiles.get(d).cloned()).collect())
    }

    async fn fetch_posts(&self, uris: &[String]) -> Result<Vec<RemotePost>, ResolveError> {
        self.check()?;
        Ok(uris.iter().filter_map(|u| self.posts.get(u).cloned()).collect())
    }
}

fn profile(did: &str, description: &str) -> RemoteProfile {
    RemoteProfile {
        did: did.to_string(),
        handle: format!("{}.test", did.trim_start_matches("did:plc:")),
        display_name: None,
        description: Some(description.to_string()),
        follower_count: 10,
        following_count: 5,
    }
}

fn record(reply_to: Option<&str>) -> PostRecord {
    PostRecord {
        text: "hello".to_string(),
        created_at: "2024-05-01T00:00:00Z".to_string(),
        reply: reply_to.map(|uri| {
            let target = StrongRef {
                uri: uri.to_string(),
                cid: "cid-parent".to_string(),
            };
            ReplyRef {
                root: target.clone(),
                parent: target,
            }
        }),
        embed: None,
        labels: None,
    }
}

fn like(liker: &str, rkey: &str, subject: &str) -> CreateOp<LikeRecord> {
    CreateOp {
        uri: format!("at://{liker}/app.bsky.feed.like/{rkey}"),
        cid: format!("cid-like-{rkey}"),
        author: liker.to_string(),
        record: LikeRecord {
            subject: StrongRef {
                uri: subject.to_string(),
                cid: "cid-subject".to_string(),
            },
            created_at: "2024-05-01T00:00:00Z".to_string(),
        },
    }
}

struct Harness {
    store: StoreHandle,
    ingestor: Arc<Ingestor>,
    backfill: Backfill,
}

async fn harness(resolver: Arc<FakeResolver>) -> Harness {
    let store = StoreHandle::new(SqliteStore::open_in_memory().expect("open sqlite"));
    store
        .call(|s| s.put_actor(&Actor::new(ALICE)))
        .await
        .expect("seed alice");
    let caches = Arc::new(RelevanceCaches::new(store.clone(), 1_000, Duration::from_secs(60)));
    let ingestor = Arc::new(Ingestor::new(store.clone(), caches));
    let backfill = Backfill::new(
        store.clone(),
        Arc::clone(&ingestor),
        resolver,
        BackfillConfig::default(),
    );
    Harness {
        store,
        ingestor,
        backfill,
    }
}

#[tokio::test]
async fn deferred_like_is_stored_once_its_post_is_fetched() {
    let quoted = format!("at://{ZED}/app.bsky.feed.post/q");
    let mut resolver = FakeResolver::default();
    resolver.posts.insert(
        quoted.clone(),
        RemotePost {
            uri: quoted.clone(),
            cid: "cid-q".to_string(),
            author: profile(ZED, "she/her trans girl"),
            record: record(None),
            like_count: 42,
        },
    );
    let h = harness(Arc::new(resolver)).await;

    let l = like(ALICE, "1", &quoted);
    let mut ops = OpsByType::default();
    ops.likes.created.push(l.clone());
    h.ingestor.apply(ops).await.expect("apply");

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.posts_stored, 1);
    assert_eq!(report.candidates_accepted, 1);
    assert_eq!(report.remaining, 0);

    let uris = vec![quoted.clone()];
    let posts = h.store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert_eq!(posts[0].like_count, 42);
    assert!(posts[0].last_rescan.is_some());

    let dids = vec![ZED.to_string()];
    let actors = h.store.call(move |s| s.actors_by_did(&dids)).await.expect("actors");
    assert!(actors[0].is_external_to_network);
    assert!(actors[0].autolabel_fem_vibes);

    let like_uris = vec![l.uri];
    let likes = h.store.call(move |s| s.likes_by_uri(&like_uris)).await.expect("likes");
    assert_eq!(likes.len(), 1);
}

#[tokio::test]
async fn missing_entities_become_tombstones_across_passes() {
    let h = harness(Arc::new(FakeResolver::default())).await;
    let gone = format!("at://{ZED}/app.bsky.feed.post/gone");
    let l = like(ALICE, "1", &gone);
    let mut ops = OpsByType::default();
    ops.likes.created.push(l.clone());
    h.ingestor.apply(ops).await.expect("apply");

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.posts_missing, 1);
    assert_eq!(report.actors_missing, 1);
    assert_eq!(report.candidates_accepted, 1);
    assert_eq!(report.remaining, 0);
    assert!(report.passes >= 2);

    let uris = vec![gone];
    let posts = h.store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert!(posts[0].is_deleted);
    assert_eq!(posts[0].author, ZED);

    let dids = vec![ZED.to_string()];
    let actors = h.store.call(move |s| s.actors_by_did(&dids)).await.expect("actors");
    assert!(actors[0].is_deleted);
}

#[tokio::test]
async fn reply_from_unknown_author_waits_for_the_profile() {
    let mut resolver = FakeResolver::default();
    resolver.profiles.insert(ZED.to_string(), profile(ZED, "just here"));
    let h = harness(Arc::new(resolver)).await;

    let root = CreateOp {
        uri: format!("at://{ALICE}/app.bsky.feed.post/root"),
        cid: "cid-root".to_string(),
        author: ALICE.to_string(),
        record: record(None),
    };
    let reply = CreateOp {
        uri: format!("at://{ZED}/app.bsky.feed.post/reply"),
        cid: "cid-reply".to_string(),
        author: ZED.to_string(),
        record: record(Some(&root.uri)),
    };
    let mut ops = OpsByType::default();
    ops.posts.created.push(root);
    ops.posts.created.push(reply.clone());
    let applied = h.ingestor.apply(ops).await.expect("apply");
    assert_eq!(applied.posts_accepted, 1);
    assert_eq!(applied.posts_deferred, 1);

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.actors_stored, 1);
    assert_eq!(report.candidates_accepted, 1);
    assert_eq!(report.remaining, 0);

    let uris = vec![reply.uri];
    let posts = h.store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert_eq!(posts.len(), 1);
}

#[tokio::test]
async fn failed_lookups_leave_the_queue_intact() {
    let resolver = Arc::new(FakeResolver::default());
    resolver.fail.store(true, Ordering::SeqCst);
    let h = harness(Arc::clone(&resolver)).await;

    let mut ops = OpsByType::default();
    ops.likes
        .created
        .push(like(ALICE, "1", &format!("at://{ZED}/app.bsky.feed.post/x")));
    h.ingestor.apply(ops).await.expect("apply");
    let queued = h.store.call(|s| s.unknown_count()).await.expect("count");

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.remaining, queued);
    assert_eq!(report.candidates_accepted, 0);
    assert!(resolver.calls.load(Ordering::SeqCst) > 0);

    resolver.fail.store(false, Ordering::SeqCst);
    let report = h.backfill.drain().await.expect("drain after recovery");
    assert_eq!(report.remaining, 0);
}

#[tokio::test]
async fn post_deleted_while_deferred_never_goes_live() {
    let parent = format!("at://{ZED}/app.bsky.feed.post/parent");
    let mut resolver = FakeResolver::default();
    resolver.profiles.insert(ZED.to_string(), profile(ZED, "just here"));
    resolver.posts.insert(
        parent.clone(),
        RemotePost {
            uri: parent.clone(),
            cid: "cid-parent".to_string(),
            author: profile(ZED, "just here"),
            record: record(None),
            like_count: 3,
        },
    );
    let h = harness(Arc::new(resolver)).await;

    let reply = CreateOp {
        uri: format!("at://{ALICE}/app.bsky.feed.post/r"),
        cid: "cid-r".to_string(),
        author: ALICE.to_string(),
        record: record(Some(&parent)),
    };
    let mut ops = OpsByType::default();
    ops.posts.created.push(reply.clone());
    let applied = h.ingestor.apply(ops).await.expect("create");
    assert_eq!(applied.posts_deferred, 1);

    let mut ops = OpsByType::default();
    ops.posts.deleted.push(DeleteOp { uri: reply.uri.clone() });
    h.ingestor.apply(ops).await.expect("delete");

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.posts_stored, 1);
    assert_eq!(report.candidates_accepted, 0);
    assert_eq!(report.remaining, 0);

    let uris = vec![reply.uri, parent];
    let posts = h.store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].author, ZED);
}

#[tokio::test]
async fn tombstone_keeps_the_account_of_a_truncated_uri() {
    let h = harness(Arc::new(FakeResolver::default())).await;
    let truncated = format!("at://{ZED}/app.bsky.feed.post");
    let mut ops = OpsByType::default();
    ops.likes.created.push(like(ALICE, "1", &truncated));
    h.ingestor.apply(ops).await.expect("apply");

    let report = h.backfill.drain().await.expect("drain");
    assert_eq!(report.posts_missing, 1);

    let uris = vec![truncated];
    let posts = h.store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert!(posts[0].is_deleted);
    assert_eq!(posts[0].author, ZED);
}

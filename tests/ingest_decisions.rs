use std::{sync::Arc, time::Duration};

use time::{OffsetDateTime, macros::datetime};

use skyrank::{
    firehose::{
        classify::{CreateOp, DeleteOp, OpsByType},
        records::{LikeRecord, PostRecord, ReplyRef, StrongRef},
    },
    ingest::Ingestor,
    relevance::RelevanceCaches,
    store::{
        StoreHandle,
        models::{Actor, ServedPost, UnknownKind},
        sqlite::SqliteStore,
    },
};

const ALICE: &str = "did:plc:alice";
const BOB: &str = "did:plc:bob";
const EXTERNAL: &str = "did:plc:external";

fn post_uri(author: &str, rkey: &str) -> String {
    format!("at://{author}/app.bsky.feed.post/{rkey}")
}

fn post(author: &str, rkey: &str) -> CreateOp<PostRecord> {
    CreateOp {
        uri: post_uri(author, rkey),
        cid: format!("cid-{rkey}"),
        author: author.to_string(),
        record: PostRecord {
            text: format!("post {rkey}"),
            created_at: "2024-05-01T00:00:00Z".to_string(),
            reply: None,
            embed: None,
            labels: None,
        },
    }
}

fn reply(author: &str, rkey: &str, parent: &str) -> CreateOp<PostRecord> {
    let mut op = post(author, rkey);
    let target = StrongRef {
        uri: parent.to_string(),
        cid: "cid-parent".to_string(),
    };
    op.record.reply = Some(ReplyRef {
        root: target.clone(),
        parent: target,
    });
    op
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

async fn setup() -> (StoreHandle, Ingestor) {
    let store = StoreHandle::new(SqliteStore::open_in_memory().expect("open sqlite"));
    let mut external = Actor::new(EXTERNAL);
    external.is_external_to_network = true;
    let actors = vec![Actor::new(ALICE), Actor::new(BOB), external];
    store
        .call(move |s| {
            for a in &actors {
                s.put_actor(a)?;
            }
            Ok(())
        })
        .await
        .expect("seed actors");

    let caches = Arc::new(RelevanceCaches::new(store.clone(), 1_000, Duration::from_secs(60)));
    let ingestor = Ingestor::new(store.clone(), caches);
    (store, ingestor)
}

async fn stored_posts(store: &StoreHandle, uris: &[String]) -> usize {
    let uris = uris.to_vec();
    store
        .call(move |s| s.posts_by_uri(&uris))
        .await
        .expect("posts")
        .len()
}

#[tokio::test]
async fn applying_a_batch_twice_is_a_no_op() {
    let (store, ingestor) = setup().await;
    let p = post(ALICE, "1");
    let mut ops = OpsByType::default();
    ops.posts.created.push(p.clone());
    ops.posts.created.push(reply(EXTERNAL, "2", &p.uri));
    ops.likes.created.push(like(BOB, "1", &p.uri));

    let first = ingestor.apply(ops.clone()).await.expect("first apply");
    assert_eq!(first.posts_accepted, 2);
    assert_eq!(first.likes_accepted, 1);

    let uris = vec![p.uri.clone(), post_uri(EXTERNAL, "2")];
    let like_uris = vec![format!("at://{BOB}/app.bsky.feed.like/1")];
    let posts_before = store
        .call({
            let uris = uris.clone();
            move |s| s.posts_by_uri(&uris)
        })
        .await
        .expect("posts");

    ingestor.apply(ops).await.expect("second apply");

    let posts_after = store
        .call(move |s| s.posts_by_uri(&uris))
        .await
        .expect("posts");
    let likes = store
        .call(move |s| s.likes_by_uri(&like_uris))
        .await
        .expect("likes");
    assert_eq!(posts_before, posts_after);
    assert_eq!(likes.len(), 1);
    assert_eq!(store.call(|s| s.unknown_count()).await.expect("count"), 0);
}

#[tokio::test]
async fn posts_accepted_earlier_in_a_batch_are_visible_to_later_ones() {
    let (store, ingestor) = setup().await;
    let root = post(ALICE, "root");
    let mut ops = OpsByType::default();
    ops.posts.created.push(root.clone());
    ops.posts.created.push(reply(EXTERNAL, "r1", &root.uri));

    let report = ingestor.apply(ops).await.expect("apply");
    assert_eq!(report.posts_accepted, 2);
    assert_eq!(report.posts_deferred, 0);
    assert_eq!(
        stored_posts(&store, &[root.uri.clone(), post_uri(EXTERNAL, "r1")]).await,
        2
    );
}

#[tokio::test]
async fn irrelevant_posts_are_discarded() {
    let (store, ingestor) = setup().await;
    let mut ops = OpsByType::default();
    ops.posts.created.push(post(EXTERNAL, "1"));
    // Nothing relevant here even though the author is unknown.
    ops.posts.created.push(post("did:plc:stranger", "2"));

    let report = ingestor.apply(ops).await.expect("apply");
    assert_eq!(report.posts_discarded, 2);
    assert_eq!(store.call(|s| s.unknown_count()).await.expect("count"), 0);
}

#[tokio::test]
async fn like_of_unstored_post_is_deferred_with_its_reference() {
    let (store, ingestor) = setup().await;
    let missing = post_uri("did:plc:zed", "9");
    let l = like(ALICE, "1", &missing);
    let mut ops = OpsByType::default();
    ops.likes.created.push(l.clone());

    let report = ingestor.apply(ops).await.expect("apply");
    assert_eq!(report.likes_deferred, 1);

    let queued = store.call(|s| s.unknown_page(0, 10)).await.expect("page");
    let entries: Vec<(String, UnknownKind, bool)> = queued
        .iter()
        .map(|q| (q.thing.identifier.clone(), q.thing.kind, q.thing.payload.is_some()))
        .collect();
    assert!(entries.contains(&(l.uri.clone(), UnknownKind::Like, true)));
    assert!(entries.contains(&(missing.clone(), UnknownKind::Post, false)));

    let like_uris = vec![l.uri];
    let likes = store
        .call(move |s| s.likes_by_uri(&like_uris))
        .await
        .expect("likes");
    assert!(likes.is_empty());
}

#[tokio::test]
async fn replies_to_unknown_posts_never_break_references() {
    let (store, ingestor) = setup().await;
    let dangling = post_uri("did:plc:zed", "1");
    let mut ops = OpsByType::default();
    ops.posts.created.push(reply(ALICE, "a", &dangling));
    ops.posts.created.push(reply(BOB, "b", &post_uri(ALICE, "a")));

    let report = ingestor.apply(ops).await.expect("apply");
    assert_eq!(report.posts_accepted, 0);
    assert_eq!(report.posts_deferred, 2);
    assert_eq!(
        stored_posts(&store, &[post_uri(ALICE, "a"), post_uri(BOB, "b")]).await,
        0
    );
}

#[tokio::test]
async fn deletes_soft_delete_posts_and_remove_likes() {
    let (store, ingestor) = setup().await;
    let p = post(ALICE, "1");
    let l = like(BOB, "1", &p.uri);
    let mut ops = OpsByType::default();
    ops.posts.created.push(p.clone());
    ops.likes.created.push(l.clone());
    ingestor.apply(ops).await.expect("create");

    let mut ops = OpsByType::default();
    ops.posts.deleted.push(DeleteOp { uri: p.uri.clone() });
    ops.likes.deleted.push(DeleteOp { uri: l.uri.clone() });
    let report = ingestor.apply(ops).await.expect("delete");
    assert_eq!(report.posts_deleted, 1);
    assert_eq!(report.likes_deleted, 1);

    let uris = vec![p.uri.clone()];
    let posts = store.call(move |s| s.posts_by_uri(&uris)).await.expect("posts");
    assert_eq!(posts.len(), 1);
    assert!(posts[0].is_deleted);

    let like_uris = vec![l.uri];
    let likes = store.call(move |s| s.likes_by_uri(&like_uris)).await.expect("likes");
    assert!(likes.is_empty());
}

#[tokio::test]
async fn likes_are_attributed_to_the_feed_that_served_the_post() {
    let (store, ingestor) = setup().await;
    let p = post(ALICE, "1");
    let mut ops = OpsByType::default();
    ops.posts.created.push(p.clone());
    ingestor.apply(ops).await.expect("post");

    let served = vec![ServedPost {
        feed_name: "fox-feed".to_string(),
        post_uri: p.uri.clone(),
        client_did: BOB.to_string(),
        served_at: OffsetDateTime::now_utc(),
    }];
    store.call(move |s| s.record_served(&served)).await.expect("served");

    let l = like(BOB, "1", &p.uri);
    let mut ops = OpsByType::default();
    ops.likes.created.push(l.clone());
    ingestor.apply(ops).await.expect("like");

    let like_uris = vec![l.uri];
    let likes = store.call(move |s| s.likes_by_uri(&like_uris)).await.expect("likes");
    assert_eq!(likes[0].attributed_feed.as_deref(), Some("fox-feed"));
}

#[tokio::test]
async fn likes_keep_the_time_the_record_was_created() {
    let (store, ingestor) = setup().await;
    let p = post(ALICE, "1");
    let dated = like(BOB, "1", &p.uri);
    let mut undated = like(BOB, "2", &p.uri);
    undated.record.created_at = "sometime".to_string();

    let mut ops = OpsByType::default();
    ops.posts.created.push(p);
    ops.likes.created.push(dated.clone());
    ops.likes.created.push(undated.clone());
    let before = OffsetDateTime::now_utc();
    ingestor.apply(ops).await.expect("apply");

    let like_uris = vec![dated.uri.clone(), undated.uri.clone()];
    let likes = store.call(move |s| s.likes_by_uri(&like_uris)).await.expect("likes");
    let created = |uri: &str| {
        likes
            .iter()
            .find(|l| l.uri == uri)
            .map(|l| l.created_at)
            .expect("like stored")
    };
    assert_eq!(created(&dated.uri), datetime!(2024-05-01 00:00:00 UTC));
    assert!(created(&undated.uri) >= before - time::Duration::seconds(1));
}

#[tokio::test]
async fn deleting_a_deferred_like_cancels_it() {
    let (store, ingestor) = setup().await;
    let unknown = post_uri(EXTERNAL, "elsewhere");
    let l = like(ALICE, "1", &unknown);
    let mut ops = OpsByType::default();
    ops.likes.created.push(l.clone());
    let report = ingestor.apply(ops).await.expect("create");
    assert_eq!(report.likes_deferred, 1);

    let mut ops = OpsByType::default();
    ops.likes.deleted.push(DeleteOp { uri: l.uri.clone() });
    ingestor.apply(ops).await.expect("delete");

    let queued = store.call(|s| s.unknown_page(0, 100)).await.expect("queue");
    assert!(queued.iter().all(|q| q.thing.kind != UnknownKind::Like));
    assert!(
        queued
            .iter()
            .any(|q| q.thing.kind == UnknownKind::Post && q.thing.identifier == unknown)
    );
}

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use skyrank::{
    config::{Config, FirehoseConfig},
    firehose::{
        frame::{Commit, CommitAction, Frame, RepoOp},
        source::{CommitSource, FrameStream, TransportError},
    },
    resolver::{RemotePost, RemoteProfile, ResolveError, Resolver},
    service::{self, ServiceError},
    shutdown::Shutdown,
    store::models::Actor,
    telemetry,
    types::{Did, POST_COLLECTION, Seq},
};

const ALICE: &str = "did:plc:alice";

struct OneShot {
    frames: Mutex<Option<Vec<Vec<u8>>>>,
}

struct Frames(VecDeque<Vec<u8>>);

#[async_trait]
impl FrameStream for Frames {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.0.pop_front() {
            Some(raw) => Some(Ok(raw)),
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl CommitSource for OneShot {
    async fn connect(&self, _cursor: Option<Seq>) -> Result<Box<dyn FrameStream>, TransportError> {
        let frames = self.frames.lock().expect("frames lock").take().unwrap_or_default();
        Ok(Box::new(Frames(frames.into())))
    }
}

struct NoRemote;

#[async_trait]
impl Resolver for NoRemote {
    async fn fetch_profiles(&self, _dids: &[Did]) -> Result<Vec<RemoteProfile>, ResolveError> {
        Ok(Vec::new())
    }

    async fn fetch_posts(&self, _uris: &[String]) -> Result<Vec<RemotePost>, ResolveError> {
        Err(ResolveError::Request("offline".to_string()))
    }
}

fn post_frame(seq: Seq) -> Vec<u8> {
    let cid = format!("cid-{seq}");
    Frame::Commit(Commit {
        repo: ALICE.to_string(),
        seq,
        time: "2024-05-01T00:00:00Z".to_string(),
        ops: vec![RepoOp {
            action: CommitAction::Create,
            path: format!("{POST_COLLECTION}/{seq}"),
            cid: Some(cid.clone()),
        }],
        blocks: [(
            cid,
            json!({ "$type": POST_COLLECTION, "text": "hi", "createdAt": "2024-05-01T00:00:00Z" }),
        )]
        .into_iter()
        .collect(),
    })
    .encode()
    .expect("encode")
}

fn config(dir: &TempDir) -> Config {
    let mut cfg: Config =
        toml::from_str("[firehose]\nendpoint = \"wss://relay.test\"\n").expect("parse");
    cfg.firehose = FirehoseConfig {
        flush_every: 1,
        ..cfg.firehose
    };
    cfg.storage.sqlite_path = dir.path().join("skyrank.sqlite3");
    cfg
}

#[tokio::test]
async fn service_ingests_until_shutdown() {
    let dir = TempDir::new().expect("tmp");
    let cfg = config(&dir);
    telemetry::init(&cfg.service.log_level);

    let store = service::open_store(&cfg.storage).expect("open store");
    store
        .call(|s| s.put_actor(&Actor::new(ALICE)))
        .await
        .expect("seed alice");

    let source = Arc::new(OneShot {
        frames: Mutex::new(Some(vec![post_frame(1), post_frame(2)])),
    });
    let (trigger, shutdown) = Shutdown::new();
    let name = cfg.service.name.clone();
    let task = tokio::spawn(service::run(
        cfg,
        store.clone(),
        source,
        Arc::new(NoRemote),
        shutdown,
    ));

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let name = name.clone();
            if store.call(move |s| s.load_cursor(&name)).await.expect("cursor") == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both commits checkpointed");

    trigger.trigger();
    task.await.expect("service task").expect("service run");
}

#[tokio::test]
async fn invalid_config_is_the_only_startup_error() {
    let dir = TempDir::new().expect("tmp");
    let mut cfg = config(&dir);
    cfg.firehose.endpoint = " ".to_string();
    let store = service::open_store(&cfg.storage).expect("open store");
    let (_trigger, shutdown) = Shutdown::new();
    let source = Arc::new(OneShot {
        frames: Mutex::new(None),
    });

    let err = service::run(cfg, store, source, Arc::new(NoRemote), shutdown)
        .await
        .expect_err("blank endpoint");
    assert!(matches!(err, ServiceError::Config(_)));
}

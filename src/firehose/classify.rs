//! Commit → typed create/delete batches.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::types::{AtUri, Did, RecordKind};

use super::{
    frame::{Commit, CommitAction, RepoOp},
    records::{FollowRecord, LikeRecord, PostRecord},
};

/// A created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOp<R> {
    /// Record address.
    pub uri: String,
    /// Content hash of the record body.
    pub cid: String,
    /// Repository owner.
    pub author: Did,
    /// Decoded record body.
    pub record: R,
}

/// A deleted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    /// Record address.
    pub uri: String,
}

/// Creates and deletes of one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ops<R> {
    /// Creates in commit order.
    pub created: Vec<CreateOp<R>>,
    /// Deletes in commit order.
    pub deleted: Vec<DeleteOp>,
}

impl<R> Default for Ops<R> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<R> Ops<R> {
    fn extend(&mut self, other: Ops<R>) {
        self.created.extend(other.created);
        self.deleted.extend(other.deleted);
    }

    fn len(&self) -> usize {
        self.created.len() + self.deleted.len()
    }
}

/// One processing batch grouped by record kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpsByType {
    /// Post operations.
    pub posts: Ops<PostRecord>,
    /// Like operations.
    pub likes: Ops<LikeRecord>,
    /// Follow operations.
    pub follows: Ops<FollowRecord>,
}

impl OpsByType {
    /// Appends `other` after the operations already held.
    pub fn extend(&mut self, other: OpsByType) {
        self.posts.extend(other.posts);
        self.likes.extend(other.likes);
        self.follows.extend(other.follows);
    }

    /// Total number of operations.
    pub fn len(&self) -> usize {
        self.posts.len() + self.likes.len() + self.follows.len()
    }

    /// True when no operation is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits a commit into typed operations.
///
/// Updates, unknown collections and creates whose block is missing or undecodable are skipped.
pub fn classify(commit: &Commit) -> OpsByType {
    let mut out = OpsByType::default();

    for op in &commit.ops {
        let Some(uri) = AtUri::from_repo_path(&commit.repo, &op.path) else {
            debug!(repo = %commit.repo, path = %op.path, "skipping op with malformed path");
            continue;
        };
        let Some(kind) = RecordKind::from_collection(&uri.collection) else {
            continue;
        };
        let uri_str = uri.to_string();

        match op.action {
            CommitAction::Update => {}
            CommitAction::Delete => {
                let delete = DeleteOp { uri: uri_str };
                match kind {
                    RecordKind::Post => out.posts.deleted.push(delete),
                    RecordKind::Like => out.likes.deleted.push(delete),
                    RecordKind::Follow => out.follows.deleted.push(delete),
                }
            }
            CommitAction::Create => match kind {
                RecordKind::Post => {
                    if let Some(create) = decode_create(commit, op, kind, &uri_str) {
                        out.posts.created.push(create);
                    }
                }
                RecordKind::Like => {
                    if let Some(create) = decode_create(commit, op, kind, &uri_str) {
                        out.likes.created.push(create);
                    }
                }
                RecordKind::Follow => {
                    if let Some(create) = decode_create(commit, op, kind, &uri_str) {
                        out.follows.created.push(create);
                    }
                }
            },
        }
    }

    out
}

fn decode_create<R: DeserializeOwned>(
    commit: &Commit,
    op: &RepoOp,
    kind: RecordKind,
    uri: &str,
) -> Option<CreateOp<R>> {
    let cid = op.cid.as_ref()?;
    let block = commit.blocks.get(cid)?;

    if let Some(declared) = block.get("$type").and_then(|t| t.as_str())
        && declared != kind.collection()
    {
        debug!(%uri, %declared, "record type does not match its collection");
        return None;
    }

    match serde_json::from_value::<R>(block.clone()) {
        Ok(record) => Some(CreateOp {
            uri: uri.to_string(),
            cid: cid.clone(),
            author: commit.repo.clone(),
            record,
        }),
        Err(err) => {
            debug!(%uri, error = %err, "dropping undecodable record");
            None
        }
    }
}

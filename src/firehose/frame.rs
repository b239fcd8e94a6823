//! Commit frames as they arrive from the subscription.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::types::{Did, Seq};

/// Frame payloads that fail to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid JSON or does not match any known shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Mutation applied to one record path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitAction {
    /// A new record.
    Create,
    /// A replacement of an existing record.
    Update,
    /// A removal.
    Delete,
}

/// One per-path operation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOp {
    /// What happened to the record.
    pub action: CommitAction,
    /// `<collection>/<rkey>`.
    pub path: String,
    /// Content hash of the new record body, absent on deletes.
    #[serde(default)]
    pub cid: Option<String>,
}

/// One mutation unit of the upstream log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Owning account.
    pub repo: Did,
    /// Position on the upstream log.
    pub seq: Seq,
    /// Emission time (RFC 3339).
    pub time: String,
    /// Per-path operations.
    #[serde(default)]
    pub ops: Vec<RepoOp>,
    /// Record bodies keyed by content hash.
    #[serde(default)]
    pub blocks: HashMap<String, serde_json::Value>,
}

impl Commit {
    /// Emission time, if it parses.
    pub fn emitted_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(&self.time, &Rfc3339).ok()
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Frame {
    /// Repository commit.
    #[serde(rename = "#commit")]
    Commit(Commit),
    /// Informational message from the relay.
    #[serde(rename = "#info")]
    Info {
        /// Message kind.
        name: String,
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Identity, account, handle and other frames the core does not use.
    #[serde(other)]
    Other,
}

impl Frame {
    /// Decodes one raw frame.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Encodes this frame the way [`Frame::decode`] expects it.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

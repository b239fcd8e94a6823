//! Rows the core reads and writes.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    firehose::{
        classify::CreateOp,
        records::{LikeRecord, PostRecord},
    },
    types::{Did, FeedVersion},
};

/// An account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Account DID.
    pub did: Did,
    /// Current handle.
    pub handle: String,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Profile text.
    pub description: Option<String>,
    /// Muted by moderation.
    pub is_muted: bool,
    /// Observed but outside the tracked network.
    pub is_external_to_network: bool,
    /// Manual override of network membership.
    pub manual_include_in_network: Option<bool>,
    /// Manual override of focus membership.
    pub manual_include_in_focus: Option<bool>,
    /// Held out of ranked feeds until reviewed.
    pub flagged_for_manual_review: bool,
    /// Profile reads feminine.
    pub autolabel_fem_vibes: bool,
    /// Profile reads non-binary.
    pub autolabel_nb_vibes: bool,
    /// Profile reads masculine.
    pub autolabel_masc_vibes: bool,
    /// Followers.
    pub follower_count: i64,
    /// Accounts followed.
    pub following_count: i64,
    /// Set when the account could no longer be looked up.
    pub is_deleted: bool,
}

impl Actor {
    /// A bare actor with every flag cleared.
    pub fn new(did: impl Into<Did>) -> Self {
        let did = did.into();
        Self {
            handle: did.clone(),
            did,
            display_name: None,
            description: None,
            is_muted: false,
            is_external_to_network: false,
            manual_include_in_network: None,
            manual_include_in_focus: None,
            flagged_for_manual_review: false,
            autolabel_fem_vibes: false,
            autolabel_nb_vibes: false,
            autolabel_masc_vibes: false,
            follower_count: 0,
            following_count: 0,
            is_deleted: false,
        }
    }

    /// Tombstone for an account whose lookup failed.
    pub fn tombstone(did: impl Into<Did>) -> Self {
        Self {
            is_deleted: true,
            is_external_to_network: true,
            ..Self::new(did)
        }
    }

    /// Muted and manually excluded accounts never count, in or out of network.
    pub fn is_excluded(&self) -> bool {
        self.is_muted || self.is_deleted || self.manual_include_in_network == Some(false)
    }

    /// May author ranked posts: not excluded and not waiting on a manual review.
    pub fn is_rankable(&self) -> bool {
        !self.is_excluded() && !self.flagged_for_manual_review
    }

    /// Part of the tracked population.
    pub fn in_network(&self) -> bool {
        !self.is_excluded()
            && (self.manual_include_in_network == Some(true) || !self.is_external_to_network)
    }

    /// Part of the focus sub-population used by focus-only feeds.
    pub fn in_focus(&self) -> bool {
        match self.manual_include_in_focus {
            Some(v) => v,
            None => self.autolabel_fem_vibes && !self.autolabel_masc_vibes,
        }
    }
}

/// A content record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Record address.
    pub uri: String,
    /// Content hash.
    pub cid: String,
    /// Author DID.
    pub author: Did,
    /// Post text.
    pub text: String,
    /// When the post was stored.
    pub indexed_at: OffsetDateTime,
    /// Direct reply parent.
    pub reply_parent: Option<String>,
    /// Thread root.
    pub reply_root: Option<String>,
    /// Quoted post.
    pub embed_uri: Option<String>,
    /// Content hash of the quoted post.
    pub embed_cid: Option<String>,
    /// Attached images.
    pub media_count: u32,
    /// Images with alt text.
    pub media_with_alt_text_count: u32,
    /// Self-labels.
    pub labels: Vec<String>,
    /// Like count reported by the remote network on the last rescan.
    pub like_count: i64,
    /// Pinned into every feed.
    pub is_pinned: bool,
    /// Deleted upstream or missing.
    pub is_deleted: bool,
    /// Last refresh from the network.
    pub last_rescan: Option<OffsetDateTime>,
}

impl Post {
    /// Builds a row from a firehose create.
    pub fn from_create(op: &CreateOp<PostRecord>, indexed_at: OffsetDateTime) -> Self {
        let (media_count, media_with_alt_text_count) = op.record.media_counts();
        let quoted = op.record.quoted();
        Self {
            uri: op.uri.clone(),
            cid: op.cid.clone(),
            author: op.author.clone(),
            text: op.record.text.clone(),
            indexed_at,
            reply_parent: op.record.reply.as_ref().map(|r| r.parent.uri.clone()),
            reply_root: op.record.reply.as_ref().map(|r| r.root.uri.clone()),
            embed_uri: quoted.map(|q| q.uri.clone()),
            embed_cid: quoted.map(|q| q.cid.clone()),
            media_count,
            media_with_alt_text_count,
            labels: op.record.label_values(),
            like_count: 0,
            is_pinned: false,
            is_deleted: false,
            last_rescan: None,
        }
    }

    /// Soft-deleted placeholder for a post the network no longer has.
    pub fn tombstone(uri: &str, author: Did, indexed_at: OffsetDateTime) -> Self {
        Self {
            uri: uri.to_string(),
            cid: String::new(),
            author,
            text: String::new(),
            indexed_at,
            reply_parent: None,
            reply_root: None,
            embed_uri: None,
            embed_cid: None,
            media_count: 0,
            media_with_alt_text_count: 0,
            labels: Vec::new(),
            like_count: 0,
            is_pinned: false,
            is_deleted: true,
            last_rescan: None,
        }
    }
}

/// A like of a stored post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Like {
    /// Record address.
    pub uri: String,
    /// Content hash.
    pub cid: String,
    /// Account that liked.
    pub liker: Did,
    /// Liked post.
    pub post_uri: String,
    /// Content hash of the liked post.
    pub post_cid: String,
    /// Creation time the record asserts.
    pub created_at: OffsetDateTime,
    /// Feed that served the post to the liker shortly before the like.
    pub attributed_feed: Option<String>,
}

/// A post handed out by a feed to a known client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedPost {
    /// Feed that served it.
    pub feed_name: String,
    /// Post served.
    pub post_uri: String,
    /// Client the page was served to.
    pub client_did: Did,
    /// When it was served.
    pub served_at: OffsetDateTime,
}

/// Kinds of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKind {
    /// Fetch a profile.
    Actor,
    /// Fetch a post, or re-decide a deferred one.
    Post,
    /// Re-decide a deferred like.
    Like,
}

impl UnknownKind {
    /// Storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Post => "post",
            Self::Like => "like",
        }
    }

    /// Inverse of [`UnknownKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "actor" => Some(Self::Actor),
            "post" => Some(Self::Post),
            "like" => Some(Self::Like),
            _ => None,
        }
    }
}

/// A create whose references were not yet decidable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeferredOp {
    /// A post create.
    Post(CreateOp<PostRecord>),
    /// A like create.
    Like(CreateOp<LikeRecord>),
}

/// Entry of the backfill queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownThing {
    /// DID or AT-URI.
    pub identifier: String,
    /// What `identifier` names.
    pub kind: UnknownKind,
    /// Deferred candidate; `None` means "fetch this entity".
    pub payload: Option<DeferredOp>,
}

impl UnknownThing {
    /// Fetch request for an account.
    pub fn actor(did: impl Into<String>) -> Self {
        Self {
            identifier: did.into(),
            kind: UnknownKind::Actor,
            payload: None,
        }
    }

    /// Fetch request for a post.
    pub fn post(uri: impl Into<String>) -> Self {
        Self {
            identifier: uri.into(),
            kind: UnknownKind::Post,
            payload: None,
        }
    }

    /// A deferred create, keyed by its own URI.
    pub fn deferred(op: DeferredOp) -> Self {
        let (identifier, kind) = match &op {
            DeferredOp::Post(c) => (c.uri.clone(), UnknownKind::Post),
            DeferredOp::Like(c) => (c.uri.clone(), UnknownKind::Like),
        };
        Self {
            identifier,
            kind,
            payload: Some(op),
        }
    }
}

/// A queued [`UnknownThing`] with its queue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUnknown {
    /// Queue position.
    pub id: i64,
    /// The queued work.
    pub thing: UnknownThing,
    /// When it was queued.
    pub created_at: OffsetDateTime,
}

/// One ranked slot of a feed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostScore {
    /// Post address.
    pub uri: String,
    /// Feed name.
    pub feed_name: String,
    /// Feed version.
    pub version: FeedVersion,
    /// Rank proxy: higher comes first.
    pub score: i64,
    /// When the version was written.
    pub created_at: OffsetDateTime,
}

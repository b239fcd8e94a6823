//! Outbound lookups against the remote network.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    firehose::{classify::CreateOp, records::PostRecord},
    store::models::{Actor, Post},
    types::Did,
    vibes::vibecheck,
};

/// Lookup failures. The queue is left intact for a later try.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The request failed.
    #[error("remote request failed: {0}")]
    Request(String),
    /// The remote asked us to slow down.
    #[error("rate limited")]
    RateLimited,
}

/// Public profile of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProfile {
    /// Account DID.
    pub did: Did,
    /// Current handle.
    pub handle: String,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Profile text.
    pub description: Option<String>,
    /// Followers.
    pub follower_count: i64,
    /// Accounts followed.
    pub following_count: i64,
}

impl RemoteProfile {
    /// A new actor row for this profile, outside the tracked network, with vibes labelled.
    pub fn to_external_actor(&self) -> Actor {
        let vibes = vibecheck(self.description.as_deref().unwrap_or_default());
        Actor {
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            is_external_to_network: true,
            autolabel_fem_vibes: vibes.fem,
            autolabel_nb_vibes: vibes.enby,
            autolabel_masc_vibes: vibes.masc,
            follower_count: self.follower_count,
            following_count: self.following_count,
            ..Actor::new(self.did.clone())
        }
    }
}

/// A post as the remote network reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePost {
    /// Record address.
    pub uri: String,
    /// Content hash.
    pub cid: String,
    /// Author profile.
    pub author: RemoteProfile,
    /// Record body.
    pub record: PostRecord,
    /// Like count the network reports.
    pub like_count: i64,
}

impl RemotePost {
    /// Row for this post, marked as rescanned at `now`.
    pub fn to_post(&self, now: OffsetDateTime) -> Post {
        let op = CreateOp {
            uri: self.uri.clone(),
            cid: self.cid.clone(),
            author: self.author.did.clone(),
            record: self.record.clone(),
        };
        Post {
            like_count: self.like_count,
            last_rescan: Some(now),
            ..Post::from_create(&op, now)
        }
    }
}

/// Bulk profile and post lookups. Entities the network does not have are left out of the result.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Profiles of `dids` that still exist.
    async fn fetch_profiles(&self, dids: &[Did]) -> Result<Vec<RemoteProfile>, ResolveError>;
    /// Posts among `uris` that still exist.
    async fn fetch_posts(&self, uris: &[String]) -> Result<Vec<RemotePost>, ResolveError>;
}

//! Paginated reads of stored feed versions.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    store::{StoreError, StoreHandle, models::ServedPost},
    types::FeedVersion,
};

/// Cursor returned once a version is exhausted.
pub const NO_MORE_POSTS_CURSOR: &str = "";

/// Served when a page comes back empty.
pub const PLACEHOLDER_FEED: [&str; 2] = [
    "at://did:plc:ilmue7bf43hluzpuuevcb6cw/app.bsky.feed.post/3k5hl44adih2z",
    "at://did:plc:j7jc2j2htz5gxuxi2ilhbqka/app.bsky.feed.post/3lnjqbjpiqc2g",
];

/// Page read failures.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The cursor is not `<version>::<offset>`.
    #[error("malformed cursor {0:?}")]
    MalformedCursor(String),
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One post of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Post address.
    pub post: String,
}

/// One page of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    /// Cursor for the next page; empty once exhausted.
    pub cursor: String,
    /// Posts on this page.
    pub feed: Vec<FeedItem>,
}

/// Parses `"<version>::<offset>"`.
pub fn parse_cursor(cursor: &str) -> Result<(FeedVersion, usize), FeedError> {
    let malformed = || FeedError::MalformedCursor(cursor.to_string());
    let (version, offset) = cursor.split_once("::").ok_or_else(malformed)?;
    let version = version.parse().map_err(|_| malformed())?;
    let offset = offset.parse().map_err(|_| malformed())?;
    Ok((version, offset))
}

/// Reads one page of `feed`.
///
/// Without a cursor the latest version is read from the top. When `client` is set, the returned
/// posts are recorded as served to it.
pub async fn feed_page(
    store: &StoreHandle,
    feed: &str,
    cursor: Option<&str>,
    limit: usize,
    client: Option<&str>,
) -> Result<FeedPage, FeedError> {
    let (version, offset) = match cursor {
        Some(NO_MORE_POSTS_CURSOR) => {
            return Ok(FeedPage {
                cursor: NO_MORE_POSTS_CURSOR.to_string(),
                feed: Vec::new(),
            });
        }
        Some(c) => parse_cursor(c)?,
        None => {
            let name = feed.to_string();
            let latest = store.call(move |s| s.latest_version(&name)).await?;
            (latest.unwrap_or(0), 0)
        }
    };

    let name = feed.to_string();
    let uris = store
        .call(move |s| s.score_page(&name, version, offset, limit))
        .await?;

    if uris.is_empty() {
        return Ok(FeedPage {
            cursor: NO_MORE_POSTS_CURSOR.to_string(),
            feed: PLACEHOLDER_FEED
                .iter()
                .map(|p| FeedItem {
                    post: p.to_string(),
                })
                .collect(),
        });
    }

    if let Some(client) = client {
        let served_at = OffsetDateTime::now_utc();
        let served: Vec<ServedPost> = uris
            .iter()
            .map(|uri| ServedPost {
                feed_name: feed.to_string(),
                post_uri: uri.clone(),
                client_did: client.to_string(),
                served_at,
            })
            .collect();
        store.call(move |s| s.record_served(&served)).await?;
    }

    Ok(FeedPage {
        cursor: format!("{version}::{}", offset + uris.len()),
        feed: uris.into_iter().map(|post| FeedItem { post }).collect(),
    })
}

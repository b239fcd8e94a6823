//! Typed record bodies carried in commit blocks.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Reference to a specific version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    /// Record address.
    pub uri: String,
    /// Content hash of the referenced version.
    pub cid: String,
}

/// Reply thread pointers of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// Thread root.
    pub root: StrongRef,
    /// Direct parent.
    pub parent: StrongRef,
}

/// One embedded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Image {
    /// Alt text, possibly blank.
    #[serde(default)]
    pub alt: String,
}

/// Embedded image set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Images {
    /// Images in display order.
    #[serde(default)]
    pub images: Vec<Image>,
}

/// Embedded record (quote) pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedRecord {
    /// Quoted record.
    pub record: StrongRef,
}

/// Post embed variants relevant to scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum Embed {
    /// Image gallery.
    #[serde(rename = "app.bsky.embed.images")]
    Images(Images),
    /// Quote of another record.
    #[serde(rename = "app.bsky.embed.record")]
    Record(EmbedRecord),
    /// Quote plus media.
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia {
        /// Quoted record.
        record: EmbedRecord,
        /// Attached media.
        media: Box<Embed>,
    },
    /// Link cards, video and anything else.
    #[serde(other)]
    Other,
}

/// One self-applied label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfLabel {
    /// Label value.
    pub val: String,
}

/// Self-applied label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SelfLabels {
    /// Label values.
    #[serde(default)]
    pub values: Vec<SelfLabel>,
}

/// Post record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    /// Post text.
    #[serde(default)]
    pub text: String,
    /// Client-asserted creation time.
    pub created_at: String,
    /// Reply pointers, if this is a reply.
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    /// Embedded content.
    #[serde(default)]
    pub embed: Option<Embed>,
    /// Self labels.
    #[serde(default)]
    pub labels: Option<SelfLabels>,
}

impl PostRecord {
    /// Returns `(media_count, media_with_alt_text_count)`.
    pub fn media_counts(&self) -> (u32, u32) {
        let images = match &self.embed {
            Some(Embed::Images(images)) => Some(images),
            Some(Embed::RecordWithMedia { media, .. }) => match media.as_ref() {
                Embed::Images(images) => Some(images),
                _ => None,
            },
            _ => None,
        };
        let Some(images) = images else {
            return (0, 0);
        };
        let with_alt = images.images.iter().filter(|i| !i.alt.trim().is_empty()).count();
        (images.images.len() as u32, with_alt as u32)
    }

    /// Quoted record, if any.
    pub fn quoted(&self) -> Option<&StrongRef> {
        match &self.embed {
            Some(Embed::Record(r)) => Some(&r.record),
            Some(Embed::RecordWithMedia { record, .. }) => Some(&record.record),
            _ => None,
        }
    }

    /// Self-label values.
    pub fn label_values(&self) -> Vec<String> {
        self.labels
            .as_ref()
            .map(|l| l.values.iter().map(|v| v.val.clone()).collect())
            .unwrap_or_default()
    }
}

/// Like record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    /// Liked post.
    pub subject: StrongRef,
    /// Client-asserted creation time.
    pub created_at: String,
}

impl LikeRecord {
    /// `created_at` parsed as RFC 3339, if it parses.
    pub fn created(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(&self.created_at, &Rfc3339).ok()
    }
}

/// Follow record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    /// Followed account.
    pub subject: String,
    /// Client-asserted creation time.
    pub created_at: String,
}

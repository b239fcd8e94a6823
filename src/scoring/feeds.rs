//! Feed definitions and post-order remixes.

use serde::{Deserialize, Serialize};

use super::engine::Scored;

/// Default decay: 8 hour inflection.
pub const STANDARD_INFLECTION_SECS: u64 = 8 * 60 * 60;
/// Decay for feeds favouring new posts: 30 minute inflection.
pub const FAST_INFLECTION_SECS: u64 = 30 * 60;
/// Decay exponent shared by the built-in feeds.
pub const ALPHA: f64 = 1.5;

/// Time decay of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayParameters {
    /// Decay exponent.
    pub alpha: f64,
    /// Age at which decay switches curve.
    pub inflection_secs: u64,
    /// Exponent applied to the like count.
    pub gamma: f64,
}

impl DecayParameters {
    /// Slow decay for the main feeds.
    pub fn standard() -> Self {
        Self {
            alpha: ALPHA,
            inflection_secs: STANDARD_INFLECTION_SECS,
            gamma: 0.9,
        }
    }

    /// Fast decay for feeds favouring new posts.
    pub fn fast() -> Self {
        Self {
            alpha: ALPHA,
            inflection_secs: FAST_INFLECTION_SECS,
            gamma: 0.3,
        }
    }
}

/// Reordering applied to a feed after ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remix {
    /// Ranked order as is.
    #[default]
    None,
    /// Interleaves labelled posts from out-of-focus authors at most one per `ratio` others.
    LimitSubpopulation {
        /// Other posts per limited one.
        ratio: usize,
    },
    /// Keeps the top `count` and orders them newest first.
    TopChronological {
        /// Posts kept.
        count: usize,
    },
}

/// One ranked feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedParameters {
    /// Feed name as requested by clients.
    pub name: String,
    /// `None` disables time decay.
    #[serde(default)]
    pub decay: Option<DecayParameters>,
    /// Rank posts by out-of-focus authors.
    #[serde(default)]
    pub include_out_of_focus_posts: bool,
    /// Count likes from out-of-focus accounts.
    #[serde(default)]
    pub include_out_of_focus_likes: bool,
    /// Mix in posts from outside the network.
    #[serde(default)]
    pub include_out_of_network_posts: bool,
    /// Reordering after ranking.
    #[serde(default)]
    pub remix: Remix,
}

/// The built-in feed table.
pub fn default_feeds() -> Vec<FeedParameters> {
    vec![
        FeedParameters {
            name: "fox-feed".to_string(),
            decay: Some(DecayParameters::standard()),
            include_out_of_focus_posts: true,
            include_out_of_focus_likes: true,
            include_out_of_network_posts: false,
            remix: Remix::LimitSubpopulation { ratio: 4 },
        },
        FeedParameters {
            name: "vix-feed".to_string(),
            decay: Some(DecayParameters::standard()),
            include_out_of_focus_posts: false,
            include_out_of_focus_likes: true,
            include_out_of_network_posts: false,
            remix: Remix::None,
        },
        FeedParameters {
            name: "fresh-feed".to_string(),
            decay: Some(DecayParameters::fast()),
            include_out_of_focus_posts: false,
            include_out_of_focus_likes: true,
            include_out_of_network_posts: false,
            remix: Remix::None,
        },
        FeedParameters {
            name: "vix-votes".to_string(),
            decay: Some(DecayParameters::standard()),
            include_out_of_focus_posts: true,
            include_out_of_focus_likes: false,
            include_out_of_network_posts: true,
            remix: Remix::LimitSubpopulation { ratio: 4 },
        },
        FeedParameters {
            name: "top-feed".to_string(),
            decay: None,
            include_out_of_focus_posts: false,
            include_out_of_focus_likes: true,
            include_out_of_network_posts: false,
            remix: Remix::TopChronological { count: 100 },
        },
    ]
}

/// Round-robin over `(n, list)` sources: `n` items from each source per round, until all are
/// exhausted.
pub fn ratio_mix<T: Clone>(sources: &[(usize, &[T])]) -> Vec<T> {
    let mut out = Vec::with_capacity(sources.iter().map(|(_, l)| l.len()).sum());
    let mut round = 0;
    loop {
        let mut exhausted = 0;
        for &(n, list) in sources {
            let start = n * round;
            if n == 0 || start >= list.len() {
                exhausted += 1;
                continue;
            }
            let end = (start + n).min(list.len());
            out.extend_from_slice(&list[start..end]);
        }
        if exhausted == sources.len() {
            return out;
        }
        round += 1;
    }
}

/// Applies `remix` to a ranked list.
pub fn apply_remix(remix: Remix, posts: Vec<Scored>) -> Vec<Scored> {
    match remix {
        Remix::None => posts,
        Remix::LimitSubpopulation { ratio } => limit_subpopulation(ratio, posts),
        Remix::TopChronological { count } => top_chronological(count, posts),
    }
}

fn limit_subpopulation(ratio: usize, posts: Vec<Scored>) -> Vec<Scored> {
    let (limited, other): (Vec<_>, Vec<_>) = posts.into_iter().partition(|p| p.limited);
    let mut limited = limited.into_iter().peekable();
    let mut other = other.into_iter().peekable();
    let mut out = Vec::new();

    while other.peek().is_some() && limited.peek().is_some() {
        for _ in 0..ratio.max(1) {
            match other.next() {
                Some(p) => out.push(p),
                None => break,
            }
        }
        let outscores = matches!(
            (limited.peek(), other.peek()),
            (Some(l), Some(o)) if l.score > o.score
        );
        if outscores {
            out.extend(limited.next());
        }
    }
    out.extend(other);
    out.extend(limited);
    out
}

fn top_chronological(count: usize, mut posts: Vec<Scored>) -> Vec<Scored> {
    posts.truncate(count);
    posts.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at));
    posts
}

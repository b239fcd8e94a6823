//! Ranking engine: decayed engagement scores, versioned feed snapshots and page reads.

/// Time decay and diminishing returns.
pub mod decay;
/// The scoring run.
pub mod engine;
/// Feed definitions and remixes.
pub mod feeds;
/// Feed page reads.
pub mod page;

pub use engine::{RunReport, ScoringEngine, ScoringError};
pub use page::{FeedError, FeedPage, feed_page};

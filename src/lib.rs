//! `skyrank` ingests a social-network commit firehose, keeps the small slice of it that belongs
//! to a tracked population, and periodically ranks that slice into versioned, paginated feeds.
//!
//! Architecture:
//! - [`firehose`] subscribes to the commit log, classifies commits and checkpoints the cursor.
//! - [`relevance`] and [`ingest`] decide per record whether to keep, drop or defer it.
//! - [`backfill`] resolves deferred records through a [`resolver::Resolver`].
//! - [`scoring`] turns likes into ranked feed versions and serves pages of them.
//! - [`store`] is the durable state, with a SQLite implementation.

#![deny(missing_docs)]

/// Unknown-entity queue drain.
pub mod backfill;
/// TOML configuration.
pub mod config;
/// Commit subscription, classification and checkpointing.
pub mod firehose;
/// Accept, discard or defer decisions.
pub mod ingest;
/// Actor and post relevance caches.
pub mod relevance;
/// Remote profile and post lookups.
pub mod resolver;
/// Feed ranking and page reads.
pub mod scoring;
/// Service wiring.
pub mod service;
/// Cooperative shutdown.
pub mod shutdown;
/// Durable store abstraction and SQLite implementation.
pub mod store;
/// Logging setup.
pub mod telemetry;
/// Shared identifiers and AT-URIs.
pub mod types;
/// Profile-text auto-labels.
pub mod vibes;

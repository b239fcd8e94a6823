//! Wires the consumer, backfill and scoring loops onto one runtime.

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info};

use crate::{
    backfill::Backfill,
    config::{self, Config, ConfigError, StorageConfig},
    firehose::{consumer::Consumer, source::CommitSource},
    ingest::Ingestor,
    relevance::RelevanceCaches,
    resolver::Resolver,
    scoring::ScoringEngine,
    shutdown::Shutdown,
    store::{StoreError, StoreHandle, sqlite::SqliteStore},
};

/// Startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The config is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Opens the configured SQLite database.
pub fn open_store(config: &StorageConfig) -> Result<StoreHandle, ServiceError> {
    let store = SqliteStore::open(&config.sqlite_path)?;
    Ok(StoreHandle::new(store))
}

/// Runs every task until `shutdown` is raised and they have all stopped.
///
/// Only an invalid configuration is reported as an error.
pub async fn run(
    config: Config,
    store: StoreHandle,
    source: Arc<dyn CommitSource>,
    resolver: Arc<dyn Resolver>,
    shutdown: Shutdown,
) -> Result<(), ServiceError> {
    config::validate(&config)?;

    let caches = Arc::new(RelevanceCaches::new(
        store.clone(),
        config.cache.capacity,
        Duration::from_secs(config.cache.stats_interval_secs),
    ));
    let ingestor = Arc::new(Ingestor::new(store.clone(), Arc::clone(&caches)));

    let consumer = Consumer::new(
        config.service.name.clone(),
        source,
        store.clone(),
        Arc::clone(&ingestor),
        config.firehose.clone(),
    );
    let backfill = Backfill::new(
        store.clone(),
        Arc::clone(&ingestor),
        Arc::clone(&resolver),
        config.backfill.clone(),
    );
    let scoring = ScoringEngine::new(store, resolver, caches, config.scoring.clone());

    info!(service = %config.service.name, endpoint = %config.firehose.endpoint, "starting service");

    let consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });
    let backfill_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { backfill.run(shutdown).await }
    });
    let scoring_task = tokio::spawn(async move { scoring.run_forever(shutdown).await });

    let (consumer, backfill, scoring) = tokio::join!(consumer_task, backfill_task, scoring_task);
    for (name, result) in [("consumer", consumer), ("backfill", backfill), ("scoring", scoring)] {
        if let Err(err) = result {
            error!(task = name, error = %err, "service task failed");
        }
    }

    info!("service stopped");
    Ok(())
}

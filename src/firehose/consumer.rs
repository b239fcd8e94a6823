//! Subscription loop: reconnects with backoff, batches commits, checkpoints the cursor.

use std::sync::Arc;

use rand::Rng;
use time::OffsetDateTime;
use tokio::{sync::mpsc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    config::FirehoseConfig,
    ingest::{IngestError, Ingestor},
    shutdown::Shutdown,
    store::StoreHandle,
    types::Seq,
};

use super::{
    classify::{OpsByType, classify},
    frame::{Commit, Frame},
    source::{CommitSource, FrameStream, TransportError},
};

/// Reconnect delay after `attempt` consecutive failures.
///
/// `min(2^attempt, max_secs)` seconds with ±0.5 s of jitter, never negative.
pub fn backoff_delay(attempt: u32, max_secs: u64, rng: &mut impl Rng) -> Duration {
    let base = 2f64.powi(attempt.min(30) as i32).min(max_secs as f64);
    let jitter: f64 = rng.gen_range(-0.5..=0.5);
    Duration::from_secs_f64((base + jitter).max(0.0))
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Ended,
    Transport(TransportError),
    /// A batch could not be applied; its cursor was not saved.
    Apply(IngestError),
}

#[derive(Default)]
struct Batch {
    ops: OpsByType,
    commits: usize,
    last_seq: Option<Seq>,
}

/// Drives one named subscription into an [`Ingestor`].
pub struct Consumer {
    service: String,
    source: Arc<dyn CommitSource>,
    store: StoreHandle,
    ingestor: Arc<Ingestor>,
    config: FirehoseConfig,
}

impl Consumer {
    /// Builds a consumer checkpointing under `service`.
    pub fn new(
        service: impl Into<String>,
        source: Arc<dyn CommitSource>,
        store: StoreHandle,
        ingestor: Arc<Ingestor>,
        config: FirehoseConfig,
    ) -> Self {
        Self {
            service: service.into(),
            source,
            store,
            ingestor,
            config,
        }
    }

    /// Consumes until `shutdown` is raised.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_set() {
                break;
            }

            let service = self.service.clone();
            let cursor = match self.store.call(move |s| s.load_cursor(&service)).await {
                Ok(cursor) => cursor,
                Err(err) => {
                    error!(error = %err, "failed to load cursor");
                    attempt += 1;
                    if !self.back_off(attempt, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.source.connect(cursor).await {
                Ok(stream) => {
                    attempt = 0;
                    info!(service = %self.service, ?cursor, "connected to firehose");
                    match self.session(stream, &shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Transport(TransportError::ConsumerTooSlow) => {
                            warn!("reconnecting due to ConsumerTooSlow");
                            continue;
                        }
                        SessionEnd::Transport(err) => {
                            warn!(error = %err, "firehose connection failed");
                            attempt += 1;
                        }
                        SessionEnd::Ended => {
                            warn!("firehose stream ended");
                            attempt += 1;
                        }
                        SessionEnd::Apply(err) => {
                            error!(error = %err, "batch not applied, resuming from saved cursor");
                            attempt += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, attempt, "firehose connect failed");
                    attempt += 1;
                }
            }

            if !self.back_off(attempt, &mut shutdown).await {
                break;
            }
        }

        info!(service = %self.service, "firehose consumer stopped");
    }

    async fn back_off(&self, attempt: u32, shutdown: &mut Shutdown) -> bool {
        let delay = backoff_delay(attempt, self.config.max_backoff_secs, &mut rand::thread_rng());
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
        shutdown.sleep(delay).await
    }

    async fn session(&self, stream: Box<dyn FrameStream>, shutdown: &Shutdown) -> SessionEnd {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.config.queue_capacity);
        let mut reader_shutdown = shutdown.clone();

        let reader = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let next = tokio::select! {
                    frame = stream.next_frame() => frame,
                    _ = reader_shutdown.wait() => return SessionEnd::Shutdown,
                };
                match next {
                    Some(Ok(raw)) => {
                        if tx.send(raw).await.is_err() {
                            return SessionEnd::Ended;
                        }
                    }
                    Some(Err(err)) => return SessionEnd::Transport(err),
                    None => return SessionEnd::Ended,
                }
            }
        });

        let mut batch = Batch::default();
        let mut lag = LagTracker::default();
        while let Some(raw) = rx.recv().await {
            self.handle_frame(&raw, &mut batch, &mut lag);
            if batch.commits >= self.config.flush_every {
                if let Err(err) = self.flush(&mut batch).await {
                    reader.abort();
                    return SessionEnd::Apply(err);
                }
            }
        }
        if let Err(err) = self.flush(&mut batch).await {
            error!(error = %err, "final batch not applied");
        }

        match reader.await {
            Ok(end) => end,
            Err(err) => {
                error!(error = %err, "firehose reader task failed");
                SessionEnd::Ended
            }
        }
    }

    fn handle_frame(&self, raw: &[u8], batch: &mut Batch, lag: &mut LagTracker) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Commit(commit) => {
                if let Some(minutes) = lag.observe(&commit, OffsetDateTime::now_utc()) {
                    if minutes != 0 {
                        info!(lag_minutes = minutes, seq = commit.seq, "firehose lag");
                    }
                }
                batch.ops.extend(classify(&commit));
                batch.commits += 1;
                batch.last_seq = Some(commit.seq);
            }
            Frame::Info { name, message } => info!(%name, ?message, "firehose info"),
            Frame::Other => {}
        }
    }

    /// Applies the batch, then checkpoints its last sequence number.
    ///
    /// The cursor only moves after the batch is stored, so a failed batch is redelivered.
    async fn flush(&self, batch: &mut Batch) -> Result<(), IngestError> {
        let Batch {
            ops,
            commits,
            last_seq,
        } = std::mem::take(batch);
        let Some(seq) = last_seq else {
            return Ok(());
        };

        let report = self.ingestor.apply(ops).await?;
        debug!(commits, seq, ?report, "applied batch");
        let service = self.service.clone();
        if let Err(err) = self.store.call(move |s| s.save_cursor(&service, seq)).await {
            error!(error = %err, seq, "failed to save cursor");
        }
        Ok(())
    }
}

/// Whole minutes between a commit's emission `time` and when it was consumed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LagTracker {
    minutes: i64,
}

impl LagTracker {
    /// Records one commit; returns the new lag when it moved to a different minute.
    ///
    /// Commits whose `time` does not parse are ignored.
    pub fn observe(&mut self, commit: &Commit, now: OffsetDateTime) -> Option<i64> {
        let minutes = (now - commit.emitted_at()?).whole_minutes();
        if minutes == self.minutes {
            return None;
        }
        self.minutes = minutes;
        Some(minutes)
    }

    /// Lag as of the last observed commit.
    pub fn minutes(&self) -> i64 {
        self.minutes
    }
}

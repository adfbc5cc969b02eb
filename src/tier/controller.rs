//! Tier controller.
//!
//! One consume task parses events and enqueues them onto a bounded queue
//! (lossy on overflow; backpressure belongs to the upstream broker, never
//! to the consume loop); a fixed worker pool runs migrations and monitors
//! each one to a terminal state with a hard deadline.
//!
//! The worker applies the decision rules in order (same tier, confidence
//! below threshold, object already migrating) and counts each skip. The
//! controller never retries a failed migration; a retry arrives as a fresh
//! event from the ML stream.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};

use crate::common::metrics::TierMetrics;
use crate::common::{Error, Result, TierConfig};
use crate::tier::events::{EventSource, TieringRequest};
use crate::tier::migrate::{MigrationState, Migrator};

pub struct TierController<M: Migrator> {
    config: TierConfig,
    migrator: Arc<M>,
    metrics: Arc<TierMetrics>,
}

impl<M: Migrator + 'static> TierController<M> {
    pub fn new(config: TierConfig, migrator: Arc<M>, metrics: Arc<TierMetrics>) -> Arc<Self> {
        Arc::new(Self {
            config,
            migrator,
            metrics,
        })
    }

    /// Consume events until the source closes or shutdown flips. Workers
    /// finish the migration they are monitoring but accept no new work.
    pub async fn run<S: EventSource>(
        self: Arc<Self>,
        mut source: S,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(
            concurrency = self.config.concurrency,
            threshold = self.config.confidence_threshold,
            "tier controller starting"
        );

        let (tx, rx) = mpsc::channel::<TieringRequest>(self.config.queue_capacity());
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.config.concurrency);
        for worker_id in 0..self.config.concurrency {
            let controller = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let mut shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let request = tokio::select! {
                        request = async { rx.lock().await.recv().await } => request,
                        _ = shutdown.changed() => break,
                    };
                    match request {
                        Some(request) => controller.process(worker_id, request).await,
                        None => break,
                    }
                }
                tracing::info!(worker_id, "migration worker stopped");
            }));
        }

        let mut consume_shutdown = shutdown.clone();
        loop {
            let event = tokio::select! {
                event = source.recv() => event,
                _ = consume_shutdown.changed() => break,
            };
            let Some((offset, payload)) = event else {
                break;
            };

            self.metrics.events_received.inc();

            match serde_json::from_slice::<TieringRequest>(&payload) {
                Ok(request) => match tx.try_send(request) {
                    Ok(()) => {
                        self.metrics.requests_queued.inc();
                    }
                    Err(mpsc::error::TrySendError::Full(request)) => {
                        // Lossy by design: the broker retains the event and
                        // future recommendations re-express it
                        tracing::warn!(
                            bucket = %request.bucket_name,
                            key = %request.object_key,
                            "migration queue full, dropping request"
                        );
                        self.metrics.requests_dropped.inc();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                Err(e) => {
                    tracing::warn!("undecodable tiering event: {}", e);
                    self.metrics.events_invalid.inc();
                }
            }

            // Offset committed after the enqueue-or-drop decision
            source.ack(offset).await;
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }

        tracing::info!("tier controller stopped");
        Ok(())
    }

    /// Decision rules, migration submission, and monitoring for one request
    async fn process(&self, worker_id: usize, request: TieringRequest) {
        if request.current_tier == request.recommended_tier {
            tracing::debug!(
                bucket = %request.bucket_name,
                key = %request.object_key,
                "already in recommended tier, skipping"
            );
            self.metrics.requests_skipped.inc();
            return;
        }

        if request.confidence < self.config.confidence_threshold {
            tracing::debug!(
                bucket = %request.bucket_name,
                key = %request.object_key,
                confidence = request.confidence,
                threshold = self.config.confidence_threshold,
                "confidence below threshold, skipping"
            );
            self.metrics.requests_skipped.inc();
            return;
        }

        tracing::info!(
            worker_id,
            bucket = %request.bucket_name,
            key = %request.object_key,
            from = %request.current_tier,
            to = %request.recommended_tier,
            confidence = request.confidence,
            model = %request.model_version,
            "starting migration"
        );

        let start = Instant::now();
        let handle = match self.migrator.start(&request).await {
            Ok(handle) => handle,
            Err(Error::StateConflict(reason)) => {
                tracing::info!(reason, "migration already in flight, skipping");
                self.metrics.requests_skipped.inc();
                return;
            }
            Err(e) => {
                tracing::error!(
                    bucket = %request.bucket_name,
                    key = %request.object_key,
                    "failed to start migration: {}",
                    e
                );
                self.metrics.migrations_creation_failed.inc();
                return;
            }
        };

        self.metrics.migrations_in_flight.inc();
        let deadline = self.config.migration_timeout();

        loop {
            match handle.status().state {
                MigrationState::Succeeded => {
                    self.metrics.migrations_succeeded.inc();
                    self.metrics
                        .migration_duration
                        .observe(start.elapsed().as_secs_f64());
                    tracing::info!(
                        bucket = %request.bucket_name,
                        key = %request.object_key,
                        elapsed_secs = start.elapsed().as_secs(),
                        "migration succeeded"
                    );
                    break;
                }
                MigrationState::Failed => {
                    let status = handle.status();
                    tracing::error!(
                        bucket = %request.bucket_name,
                        key = %request.object_key,
                        error = status.error.as_deref().unwrap_or("unknown"),
                        "migration failed"
                    );
                    self.metrics.migrations_failed.inc();
                    break;
                }
                MigrationState::Running => {
                    if start.elapsed() >= deadline {
                        tracing::error!(
                            bucket = %request.bucket_name,
                            key = %request.object_key,
                            "migration deadline elapsed, cancelling"
                        );
                        handle.cancel();
                        self.metrics.migrations_timed_out.inc();
                        break;
                    }
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }

        self.metrics.migrations_in_flight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::types::Tier;
    use crate::tier::events::ChannelSource;
    use crate::tier::migrate::{MigrationHandle, MigrationStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct InstantMigrator {
        started: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Migrator for InstantMigrator {
        async fn start(&self, _request: &TieringRequest) -> crate::Result<MigrationHandle> {
            self.started.fetch_add(1, Ordering::SeqCst);

            let status = Arc::new(StdMutex::new(MigrationStatus {
                state: if self.fail {
                    MigrationState::Failed
                } else {
                    MigrationState::Succeeded
                },
                error: None,
            }));
            let noop = tokio::spawn(async {});
            Ok(MigrationHandle::new(status, noop.abort_handle()))
        }
    }

    fn event(current: Tier, recommended: Tier, confidence: f64) -> Vec<u8> {
        serde_json::to_vec(&TieringRequest {
            timestamp: 0.0,
            bucket_name: "b1".into(),
            object_key: "x".into(),
            current_tier: current,
            recommended_tier: recommended,
            confidence,
            probability_hot: 0.5,
            model_version: "v1".into(),
        })
        .unwrap()
    }

    fn fast_config() -> TierConfig {
        TierConfig {
            meta_addr: "http://localhost:7000".into(),
            concurrency: 2,
            confidence_threshold: 0.80,
            migration_timeout_secs: 5,
            poll_interval_secs: 1,
        }
    }

    async fn run_events(
        migrator: Arc<InstantMigrator>,
        events: Vec<Vec<u8>>,
    ) -> Arc<TierMetrics> {
        let metrics = Arc::new(TierMetrics::new());
        let controller = TierController::new(fast_config(), migrator, Arc::clone(&metrics));

        let (tx, rx) = mpsc::channel(64);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);

        let (_sig, shutdown) = watch::channel(false);
        controller
            .run(ChannelSource::new(rx), shutdown)
            .await
            .unwrap();
        metrics
    }

    #[tokio::test]
    async fn test_same_tier_skipped() {
        let migrator = Arc::new(InstantMigrator {
            started: AtomicUsize::new(0),
            fail: false,
        });
        let metrics = run_events(
            Arc::clone(&migrator),
            vec![event(Tier::Hot, Tier::Hot, 0.99)],
        )
        .await;

        assert_eq!(metrics.requests_skipped.get(), 1);
        assert_eq!(migrator.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_skipped() {
        let migrator = Arc::new(InstantMigrator {
            started: AtomicUsize::new(0),
            fail: false,
        });
        let metrics = run_events(
            Arc::clone(&migrator),
            vec![event(Tier::Cold, Tier::Hot, 0.5)],
        )
        .await;

        assert_eq!(metrics.requests_skipped.get(), 1);
        assert_eq!(migrator.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confident_event_migrates() {
        let migrator = Arc::new(InstantMigrator {
            started: AtomicUsize::new(0),
            fail: false,
        });
        let metrics = run_events(
            Arc::clone(&migrator),
            vec![event(Tier::Cold, Tier::Hot, 0.9)],
        )
        .await;

        assert_eq!(migrator.started.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.migrations_succeeded.get(), 1);
        assert_eq!(metrics.migrations_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_failed_migration_counted_not_retried() {
        let migrator = Arc::new(InstantMigrator {
            started: AtomicUsize::new(0),
            fail: true,
        });
        let metrics = run_events(
            Arc::clone(&migrator),
            vec![event(Tier::Cold, Tier::Hot, 0.9)],
        )
        .await;

        assert_eq!(migrator.started.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.migrations_failed.get(), 1);
        assert_eq!(metrics.migrations_succeeded.get(), 0);
    }

    #[tokio::test]
    async fn test_invalid_event_counted_and_acked() {
        let migrator = Arc::new(InstantMigrator {
            started: AtomicUsize::new(0),
            fail: false,
        });

        let metrics = Arc::new(TierMetrics::new());
        let controller =
            TierController::new(fast_config(), Arc::clone(&migrator), Arc::clone(&metrics));

        let (tx, rx) = mpsc::channel(8);
        tx.send(b"not json".to_vec()).await.unwrap();
        drop(tx);

        let source = ChannelSource::new(rx);
        let watermark = source.ack_watermark();

        let (_sig, shutdown) = watch::channel(false);
        controller.run(source, shutdown).await.unwrap();

        assert_eq!(metrics.events_invalid.get(), 1);
        // Offset 0 acked despite the parse failure
        assert_eq!(watermark.load(Ordering::SeqCst), 1);
        assert_eq!(migrator.started.load(Ordering::SeqCst), 0);
    }
}

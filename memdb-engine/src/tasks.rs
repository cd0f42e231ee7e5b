//! Background workers driving the flush and eviction pipelines.
//!
//! Two long-lived tasks, one per pipeline, each on its own timer.
//! Cancellation is a dedicated watch-channel signal, not an abort: a
//! tick already talking to the store runs to completion before the task
//! exits, which is what lets `stop()` bound its wait at one tick length.

use std::sync::Arc;
use std::time::Duration;

use memdb_store::StoreBackend;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::EngineInner;
use crate::evict::evict_pass;
use crate::flush::flush_pass;

/// Handles for the spawned workers, owned by the facade.
pub(crate) struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    flush_handle: JoinHandle<()>,
    evict_handle: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Signal shutdown and wait for the current ticks to finish.
    ///
    /// The wait is bounded by `grace`; a store call that outlives it is
    /// left to finish detached rather than aborted.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let joined = tokio::time::timeout(grace, async {
            let _ = self.flush_handle.await;
            let _ = self.evict_handle.await;
        })
        .await;
        if joined.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "background tasks did not stop within the grace period; detaching"
            );
        }
    }
}

/// Spawn the flush and eviction workers.
pub(crate) fn spawn_background_tasks<S>(inner: Arc<EngineInner<S>>) -> BackgroundTasks
where
    S: StoreBackend + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_handle = tokio::spawn(flush_task(Arc::clone(&inner), shutdown_rx.clone()));
    let evict_handle = tokio::spawn(evict_task(inner, shutdown_rx));
    BackgroundTasks {
        shutdown_tx,
        flush_handle,
        evict_handle,
    }
}

async fn flush_task<S: StoreBackend>(
    inner: Arc<EngineInner<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(inner.config.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = inner.config.flush_interval.as_secs(),
        "flush task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("flush task shutting down");
                    break;
                }
            }

            _ = tick.tick() => {
                let report = flush_pass(&inner, None).await;
                if report.persisted > 0 || report.failed > 0 {
                    tracing::debug!(
                        persisted = report.persisted,
                        failed = report.failed,
                        "flush tick completed"
                    );
                } else {
                    tracing::trace!("flush tick found nothing dirty");
                }
            }
        }
    }
}

async fn evict_task<S: StoreBackend>(
    inner: Arc<EngineInner<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(inner.config.evict_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = inner.config.evict_interval.as_secs(),
        "eviction task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("eviction task shutting down");
                    break;
                }
            }

            _ = tick.tick() => {
                evict_pass(&inner);
            }
        }
    }
}

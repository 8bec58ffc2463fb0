//! Background maintenance for a long-lived store.
//!
//! One tokio task wakes on two timers: the cleanup interval (when
//! `autoCleanup` is on) and the flush interval (when the store is
//! persistent). Store work runs on the blocking pool. Intervals are read
//! from the configuration at start.

use crate::store::MemoryStore;
use memvault_types::cleanup::CleanupOptions;
use memvault_types::error::{MemoryError, MemoryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to the running maintenance task.
pub struct MemoryService {
    store: Arc<MemoryStore>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

async fn run_cleanup(store: Arc<MemoryStore>) {
    let result =
        tokio::task::spawn_blocking(move || store.cleanup(&CleanupOptions::default())).await;
    match result {
        Ok(Ok(report)) => debug!(
            removed = report.entries_removed,
            compressed = report.entries_compressed,
            "Scheduled cleanup finished"
        ),
        Ok(Err(e)) => warn!(error = %e, "Scheduled cleanup failed"),
        Err(e) => warn!(error = %e, "Scheduled cleanup task panicked"),
    }
}

async fn run_flush(store: Arc<MemoryStore>) {
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(0)) => {}
        Ok(Ok(rows)) => debug!(rows, "Scheduled flush finished"),
        Ok(Err(e)) => warn!(error = %e, "Scheduled flush failed"),
        Err(e) => warn!(error = %e, "Scheduled flush task panicked"),
    }
}

/// Wait for the next tick; pends forever when the timer is off.
async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    timer
}

impl MemoryService {
    /// Spawn the maintenance task. Must be called inside a tokio runtime.
    pub fn start(store: Arc<MemoryStore>) -> MemoryResult<Self> {
        let config = store.configuration()?;
        let mut cleanup_timer = config
            .auto_cleanup
            .then(|| interval(config.cleanup_interval_secs));
        let mut flush_timer = store
            .is_persistent()
            .then(|| interval(config.flush_interval_secs));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        info!(
            auto_cleanup = config.auto_cleanup,
            cleanup_interval_secs = config.cleanup_interval_secs,
            persistent = store.is_persistent(),
            flush_interval_secs = config.flush_interval_secs,
            "Starting memory maintenance loop"
        );

        let task_store = store.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick(&mut cleanup_timer) => run_cleanup(task_store.clone()).await,
                    _ = tick(&mut flush_timer) => run_flush(task_store.clone()).await,
                    _ = shutdown_rx.changed() => {
                        info!("Memory maintenance loop: shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            store,
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Stop the loop, wait for it, and flush once more.
    pub async fn shutdown(mut self) -> MemoryResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| MemoryError::Internal(format!("maintenance task failed: {e}")))?;
        }
        let store = self.store.clone();
        let rows = tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| MemoryError::Internal(format!("final flush task failed: {e}")))??;
        info!(rows, "Memory service stopped");
        Ok(())
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

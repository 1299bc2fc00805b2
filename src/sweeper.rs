//! Background retry sweeper.
//!
//! Every `sweep_interval` it claims a batch of due `retrying` logs, replays
//! them concurrently through the same delivery path with their frozen
//! payload, and purges logs past the retention window.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delivery::Deliverer;
use crate::delivery_log::DeliveryLogStore;
use crate::registry::HookRegistry;
use crate::types::{DeliveryLog, DeliveryStatus};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Retries dropped because their hook was deleted or deactivated.
    pub abandoned: usize,
    pub purged: usize,
}

enum RetryResult {
    Delivered,
    Rescheduled,
    Failed,
    Abandoned,
}

#[derive(Clone)]
pub struct RetrySweeper {
    registry: Arc<HookRegistry>,
    logs: Arc<DeliveryLogStore>,
    deliverer: Deliverer,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl RetrySweeper {
    pub fn new(
        registry: Arc<HookRegistry>,
        logs: Arc<DeliveryLogStore>,
        deliverer: Deliverer,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            logs,
            deliverer,
            clock,
            config,
        }
    }

    /// One sweep: claim, replay concurrently, purge expired logs.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        let claimed = match self
            .logs
            .claim_due(now, self.config.sweep_batch_size, self.config.claim_lease())
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(target: "hook_delivery", error = %e, "Failed to claim due retries");
                Vec::new()
            }
        };
        report.claimed = claimed.len();

        let mut tasks = JoinSet::new();
        for log in claimed {
            let sweeper = self.clone();
            tasks.spawn(async move { sweeper.retry_one(log).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RetryResult::Delivered) => report.delivered += 1,
                Ok(RetryResult::Rescheduled) => report.rescheduled += 1,
                Ok(RetryResult::Failed) => report.failed += 1,
                Ok(RetryResult::Abandoned) => report.abandoned += 1,
                Err(e) => {
                    tracing::error!(target: "hook_delivery", error = %e, "Retry task panicked")
                }
            }
        }

        match self.logs.purge_expired(now - self.config.retention()).await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                tracing::error!(target: "hook_delivery", error = %e, "Failed to purge expired delivery logs")
            }
        }

        if report.claimed > 0 || report.purged > 0 {
            tracing::info!(
                target: "hook_delivery",
                claimed = report.claimed,
                delivered = report.delivered,
                rescheduled = report.rescheduled,
                failed = report.failed,
                abandoned = report.abandoned,
                purged = report.purged,
                "Retry sweep finished"
            );
        }
        report
    }

    async fn retry_one(&self, mut log: DeliveryLog) -> RetryResult {
        let now = self.clock.now();
        let hook = match self.registry.get(&log.hook_id).await {
            Some(h) if h.is_active() => h,
            Some(h) => {
                self.abandon(log, format!("hook is {}, retry abandoned", h.status))
                    .await;
                return RetryResult::Abandoned;
            }
            None => {
                self.abandon(log, "hook no longer exists, retry abandoned".to_string())
                    .await;
                return RetryResult::Abandoned;
            }
        };

        log.attempts += 1;
        log.updated_at = now;
        let log = self.deliverer.execute(&hook, log).await;
        match log.status {
            DeliveryStatus::Success => RetryResult::Delivered,
            DeliveryStatus::Retrying => RetryResult::Rescheduled,
            DeliveryStatus::Failed | DeliveryStatus::Pending => RetryResult::Failed,
        }
    }

    async fn abandon(&self, mut log: DeliveryLog, reason: String) {
        tracing::warn!(
            target: "hook_delivery",
            hook_id = %log.hook_id,
            delivery_id = %log.id,
            reason = %reason,
            "Abandoning retry"
        );
        log.fail(reason, self.clock.now());
        if let Err(e) = self.logs.update(&log).await {
            tracing::error!(target: "hook_delivery", delivery_id = %log.id, error = %e, "Failed to persist abandoned retry");
        }
    }

    /// Run sweeps every `sweep_interval` until the returned handle is stopped.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.sweep_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(target: "hook_delivery", interval_secs = period.as_secs(), "Retry sweeper started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // A dropped handle also stops the sweeper.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::info!(target: "hook_delivery", "Retry sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owner of a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for an in-progress sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(target: "hook_delivery", error = %e, "Retry sweeper task failed");
        }
    }
}

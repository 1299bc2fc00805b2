//! Durable record of delivery attempts.
//!
//! One [`DeliveryLog`] per (trigger, hook). Logs are mutated by the first
//! attempt and by every sweep-driven retry, refuse to leave a terminal
//! state, and are purged once they age past the retention window.

use crate::error::{HookError, Result};
use crate::store::{JsonFile, Snapshot};
use crate::types::{DeliveryLog, DeliveryStatus, EventStats, HookStats};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

const DELIVERIES_FILE: &str = "deliveries.json";

pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 500;

pub struct DeliveryLogStore {
    logs: RwLock<HashMap<String, DeliveryLog>>,
    file: Option<JsonFile>,
}

impl DeliveryLogStore {
    pub fn in_memory() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            file: None,
        }
    }

    /// Load `deliveries.json`. Claims held by a previous process are dropped:
    /// nothing from before the restart can still be in flight. A log still
    /// `pending` lost its first attempt mid-flight and is due for retry.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let file = JsonFile::new(data_dir, DELIVERIES_FILE);
        let mut recovered = 0;
        let logs: HashMap<String, DeliveryLog> = file
            .load::<DeliveryLog>()?
            .into_iter()
            .map(|mut log| {
                log.claimed_at = None;
                if log.status == DeliveryStatus::Pending {
                    let (due, touched) = (log.created_at, log.updated_at);
                    log.schedule_retry(due, touched);
                    recovered += 1;
                }
                (log.id.clone(), log)
            })
            .collect();
        if recovered > 0 {
            tracing::warn!(
                target: "hook_delivery",
                recovered,
                "Interrupted first attempts rescheduled for retry"
            );
        }
        Ok(Self {
            logs: RwLock::new(logs),
            file: Some(file),
        })
    }

    pub async fn insert(&self, log: DeliveryLog) -> Result<()> {
        let snapshot = {
            let mut logs = self.logs.write().await;
            logs.insert(log.id.clone(), log);
            self.snapshot(&logs)?
        };
        self.write(snapshot).await
    }

    pub async fn get(&self, id: &str) -> Option<DeliveryLog> {
        self.logs.read().await.get(id).cloned()
    }

    /// Replace a stored log with `log`. Fails if the stored copy is terminal.
    pub async fn update(&self, log: &DeliveryLog) -> Result<()> {
        let snapshot = {
            let mut logs = self.logs.write().await;
            let stored = logs
                .get_mut(&log.id)
                .ok_or_else(|| HookError::DeliveryNotFound(log.id.clone()))?;
            if stored.status.is_terminal() {
                return Err(HookError::TerminalDelivery {
                    id: log.id.clone(),
                    status: stored.status,
                });
            }
            *stored = log.clone();
            self.snapshot(&logs)?
        };
        self.write(snapshot).await
    }

    /// Atomically take ownership of up to `limit` retries that are due at
    /// `now`. A log whose claim is older than `lease` is treated as
    /// unclaimed. Two overlapping sweeps never receive the same log.
    /// `next_retry_at` is kept so an expired claim is still due.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeliveryLog>> {
        let mut logs = self.logs.write().await;

        let mut due: Vec<&mut DeliveryLog> = logs
            .values_mut()
            .filter(|log| {
                log.status == DeliveryStatus::Retrying
                    && log.next_retry_at.is_some_and(|at| at <= now)
                    && log.claimed_at.map_or(true, |claimed| claimed + lease <= now)
            })
            .collect();
        due.sort_by_key(|log| log.next_retry_at);

        let claimed: Vec<DeliveryLog> = due
            .into_iter()
            .take(limit)
            .map(|log| {
                log.claimed_at = Some(now);
                log.updated_at = now;
                log.clone()
            })
            .collect();

        if claimed.is_empty() {
            return Ok(claimed);
        }
        let snapshot = self.snapshot(&logs)?;
        drop(logs);
        self.write(snapshot).await?;
        Ok(claimed)
    }

    pub async fn count_failed_since(&self, hook_id: &str, since: DateTime<Utc>) -> usize {
        self.logs
            .read()
            .await
            .values()
            .filter(|log| {
                log.hook_id == hook_id
                    && log.status == DeliveryStatus::Failed
                    && log.created_at >= since
            })
            .count()
    }

    /// Newest first, optionally scoped to one hook.
    pub async fn recent(&self, hook_id: Option<&str>, limit: usize) -> Vec<DeliveryLog> {
        let logs = self.logs.read().await;
        let mut items: Vec<&DeliveryLog> = logs
            .values()
            .filter(|log| hook_id.map_or(true, |id| log.hook_id == id))
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
            .into_iter()
            .take(limit.min(MAX_LOG_LIMIT))
            .cloned()
            .collect()
    }

    pub async fn stats(&self, hook_id: &str) -> HookStats {
        let logs = self.logs.read().await;
        let mut stats = HookStats {
            hook_id: hook_id.to_string(),
            ..HookStats::default()
        };
        let mut total_duration: u64 = 0;
        let mut timed: u64 = 0;

        for log in logs.values().filter(|log| log.hook_id == hook_id) {
            stats.total_triggers += 1;
            let per_event = stats
                .by_event
                .entry(log.event.clone())
                .or_insert_with(EventStats::default);
            per_event.total += 1;

            match log.status {
                DeliveryStatus::Success => {
                    stats.success_count += 1;
                    per_event.success += 1;
                }
                DeliveryStatus::Failed => {
                    stats.failure_count += 1;
                    per_event.failed += 1;
                }
                DeliveryStatus::Pending | DeliveryStatus::Retrying => stats.in_flight += 1,
            }

            if let Some(ms) = log.duration_ms {
                total_duration += ms;
                timed += 1;
            }
            if stats.last_triggered.map_or(true, |t| log.created_at > t) {
                stats.last_triggered = Some(log.created_at);
            }
        }

        if stats.total_triggers > 0 {
            let rate = stats.success_count as f64 / stats.total_triggers as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }
        if timed > 0 {
            stats.avg_response_time_ms = total_duration as f64 / timed as f64;
        }
        stats
    }

    /// Drop every log created before `cutoff`, whatever its status.
    pub async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut logs = self.logs.write().await;
        let before = logs.len();
        logs.retain(|_, log| log.created_at >= cutoff);
        let purged = before - logs.len();
        if purged > 0 {
            let snapshot = self.snapshot(&logs)?;
            drop(logs);
            self.write(snapshot).await?;
        }
        Ok(purged)
    }

    fn snapshot(&self, logs: &HashMap<String, DeliveryLog>) -> Result<Option<Snapshot>> {
        let Some(file) = &self.file else {
            return Ok(None);
        };
        let mut items: Vec<&DeliveryLog> = logs.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        file.snapshot(&items).map(Some)
    }

    async fn write(&self, snapshot: Option<Snapshot>) -> Result<()> {
        match (&self.file, snapshot) {
            (Some(file), Some(snapshot)) => file.write(snapshot).await,
            _ => Ok(()),
        }
    }
}

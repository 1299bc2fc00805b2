use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::delivery::{AttemptOutcome, Deliverer};
use crate::delivery_log::{DeliveryLogStore, DEFAULT_LOG_LIMIT};
use crate::dispatcher::{self, Dispatch, Dispatcher};
use crate::error::{HookError, Result};
use crate::events::{self, EventDescriptor};
use crate::registry::HookRegistry;
use crate::sweeper::{RetrySweeper, SweepReport, SweeperHandle};
use crate::types::{DeliveryLog, Hook, HookPatch, HookStats, MatchOptions, NewHook};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The hook delivery engine: registry, delivery log, dispatcher and the
/// retry sweeper whose lifecycle it owns.
pub struct HookEngine {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    registry: Arc<HookRegistry>,
    logs: Arc<DeliveryLogStore>,
    deliverer: Deliverer,
    dispatcher: Dispatcher,
    sweeper: RetrySweeper,
    sweeper_handle: Mutex<Option<SweeperHandle>>,
}

impl HookEngine {
    /// In-memory engine on the system clock.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// In-memory engine on an explicit clock.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Arc::new(HookRegistry::in_memory(clock.clone()));
        let logs = Arc::new(DeliveryLogStore::in_memory());
        Self::assemble(config, clock, registry, logs)
    }

    /// Engine persisting hooks and delivery logs under `data_dir`.
    pub fn open(data_dir: &Path, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let registry = Arc::new(HookRegistry::open(data_dir, clock.clone())?);
        let logs = Arc::new(DeliveryLogStore::open(data_dir)?);
        Self::assemble(config, clock, registry, logs)
    }

    fn assemble(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        registry: Arc<HookRegistry>,
        logs: Arc<DeliveryLogStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let deliverer = Deliverer::new(registry.clone(), logs.clone(), clock.clone(), config.clone())?;
        let dispatcher = Dispatcher::new(registry.clone(), logs.clone(), deliverer.clone(), clock.clone());
        let sweeper = RetrySweeper::new(
            registry.clone(),
            logs.clone(),
            deliverer.clone(),
            clock.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            clock,
            registry,
            logs,
            deliverer,
            dispatcher,
            sweeper,
            sweeper_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Start the periodic retry sweeper. Must be called inside a tokio
    /// runtime; calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.sweeper_handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            *handle = Some(self.sweeper.clone().spawn());
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop the sweeper, waiting for an in-progress sweep, then wait for
    /// detached first-attempt deliveries to finish. Once it returns the
    /// engine no longer writes to its data dir unless called again.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        let pending = self.dispatcher.in_flight();
        if pending > 0 {
            tracing::info!(target: "hook_delivery", pending, "Waiting for in-flight deliveries");
        }
        self.dispatcher.wait_idle().await;
    }

    /// Run one sweep now, independent of the periodic task.
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweeper.run_once().await
    }

    // ─── Producer interface ─────────────────────────────────────────────────

    pub async fn trigger(&self, event: &str, data: Value, options: MatchOptions) -> Dispatch {
        self.dispatcher.trigger(event, data, options).await
    }

    // ─── Management surface ─────────────────────────────────────────────────

    pub async fn create_hook(&self, new: NewHook) -> Result<Hook> {
        self.registry.create(new).await
    }

    pub async fn list_hooks(&self) -> Vec<Hook> {
        self.registry.list().await
    }

    pub async fn get_hook(&self, id: &str) -> Result<Hook> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| HookError::HookNotFound(id.to_string()))
    }

    pub async fn update_hook(&self, id: &str, patch: HookPatch) -> Result<Hook> {
        self.registry.update(id, patch).await
    }

    pub async fn delete_hook(&self, id: &str) -> Result<bool> {
        self.registry.delete(id).await
    }

    pub async fn activate_hook(&self, id: &str) -> Result<Hook> {
        self.registry.activate(id).await
    }

    pub async fn deactivate_hook(&self, id: &str) -> Result<Hook> {
        self.registry.deactivate(id).await
    }

    pub fn supported_events(&self) -> &'static [EventDescriptor] {
        events::SUPPORTED_EVENTS
    }

    /// Newest logs first, globally or for one hook. Logs of deleted hooks
    /// remain visible until they expire.
    pub async fn delivery_logs(&self, hook_id: Option<&str>, limit: Option<usize>) -> Vec<DeliveryLog> {
        self.logs
            .recent(hook_id, limit.unwrap_or(DEFAULT_LOG_LIMIT))
            .await
    }

    pub async fn get_delivery(&self, id: &str) -> Result<DeliveryLog> {
        self.logs
            .get(id)
            .await
            .ok_or_else(|| HookError::DeliveryNotFound(id.to_string()))
    }

    pub async fn hook_stats(&self, id: &str) -> Result<HookStats> {
        self.get_hook(id).await?;
        Ok(self.logs.stats(id).await)
    }

    /// Send a synthetic `hook.test` payload through the signing and HTTP path.
    /// No delivery log, counters or retry state are touched.
    pub async fn test_hook(&self, id: &str) -> Result<AttemptOutcome> {
        let hook = self.get_hook(id).await?;
        let data = serde_json::json!({
            "hook_id": hook.id,
            "hook_name": hook.name,
            "message": "This is a test delivery",
        });
        let payload = dispatcher::build_payload(events::HOOK_TEST, &data, self.clock.now())?;
        let delivery_id = format!("test-{}", uuid::Uuid::new_v4());

        let outcome = self
            .deliverer
            .send(&hook, events::HOOK_TEST, payload.as_bytes(), &delivery_id, 1)
            .await;
        tracing::info!(
            target: "hook_delivery",
            hook_id = %hook.id,
            success = outcome.success,
            status = outcome.response_status,
            "Test delivery sent"
        );
        Ok(outcome)
    }
}

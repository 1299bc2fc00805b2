//! Rolling failure-count breaker.
//!
//! Evaluated after every terminal delivery failure. When a hook has
//! accumulated `threshold` failed logs inside the window it is deactivated,
//! which removes it from future event matching until an operator
//! reactivates it.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delivery_log::DeliveryLogStore;
use crate::registry::HookRegistry;
use chrono::Duration;
use std::sync::Arc;

#[derive(Clone)]
pub struct CircuitBreaker {
    registry: Arc<HookRegistry>,
    logs: Arc<DeliveryLogStore>,
    clock: Arc<dyn Clock>,
    threshold: usize,
    window: Duration,
}

impl CircuitBreaker {
    pub fn new(
        registry: Arc<HookRegistry>,
        logs: Arc<DeliveryLogStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            logs,
            clock,
            threshold: config.breaker_threshold,
            window: config.breaker_window(),
        }
    }

    /// Returns `true` if this evaluation deactivated the hook.
    pub async fn evaluate(&self, hook_id: &str) -> bool {
        let since = self.clock.now() - self.window;
        let failures = self.logs.count_failed_since(hook_id, since).await;
        if failures < self.threshold {
            return false;
        }

        let reason = format!(
            "deactivated after {failures} failed deliveries in the last {}h",
            self.window.num_hours()
        );
        match self.registry.trip(hook_id, &reason).await {
            Ok(true) => {
                tracing::warn!(
                    target: "hook_delivery",
                    hook_id = %hook_id,
                    failures,
                    "Circuit breaker tripped, hook deactivated"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(
                    target: "hook_delivery",
                    hook_id = %hook_id,
                    error = %e,
                    "Failed to persist circuit breaker deactivation"
                );
                false
            }
        }
    }
}

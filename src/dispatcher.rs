//! Event trigger → concurrent delivery fan-out.

use crate::clock::Clock;
use crate::delivery::Deliverer;
use crate::delivery_log::DeliveryLogStore;
use crate::error::Result;
use crate::registry::HookRegistry;
use crate::types::{DeliveryLog, Hook, HookPayload, MatchOptions};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Handle to the deliveries scheduled by one trigger.
///
/// Dropping it detaches the tasks; they keep running to completion.
/// Awaiting [`Dispatch::completed`] is only useful for logging and tests.
#[derive(Debug, Default)]
pub struct Dispatch {
    handles: Vec<JoinHandle<()>>,
}

impl Dispatch {
    pub fn hook_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every scheduled delivery; returns how many ran to completion.
    pub async fn completed(self) -> usize {
        let mut done = 0;
        for handle in self.handles {
            match handle.await {
                Ok(()) => done += 1,
                Err(e) => {
                    tracing::error!(target: "hook_delivery", error = %e, "Delivery task panicked")
                }
            }
        }
        done
    }
}

/// Count of first-attempt deliveries still running, detached or not.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HookRegistry>,
    logs: Arc<DeliveryLogStore>,
    deliverer: Deliverer,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HookRegistry>,
        logs: Arc<DeliveryLogStore>,
        deliverer: Deliverer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            logs,
            deliverer,
            clock,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until every spawned delivery has finished, including ones whose
    /// [`Dispatch`] handle was dropped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Fan `event` out to every active hook that subscribes to it and passes
    /// its filters. Returns as soon as the deliveries are spawned.
    pub async fn trigger(&self, event: &str, data: Value, options: MatchOptions) -> Dispatch {
        let hooks: Vec<Hook> = self
            .registry
            .list_active_by_event(event)
            .await
            .into_iter()
            .filter(|h| h.matches(&options))
            .collect();

        if hooks.is_empty() {
            tracing::debug!(target: "hook_delivery", event = %event, "No active hooks match event");
            return Dispatch::default();
        }

        // Frozen once: every hook and every retry sends these exact bytes.
        let payload = match build_payload(event, &data, self.clock.now()) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(target: "hook_delivery", event = %event, error = %e, "Failed to serialize hook payload");
                return Dispatch::default();
            }
        };

        tracing::info!(
            target: "hook_delivery",
            event = %event,
            hook_count = hooks.len(),
            "Dispatching event to matching hooks"
        );

        let handles = hooks
            .into_iter()
            .map(|hook| {
                let logs = self.logs.clone();
                let deliverer = self.deliverer.clone();
                let log = DeliveryLog::new(&hook.id, event, payload.clone(), self.clock.now());
                let guard = InFlightGuard::enter(&self.in_flight);
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = logs.insert(log.clone()).await {
                        tracing::error!(
                            target: "hook_delivery",
                            hook_id = %hook.id,
                            error = %e,
                            "Failed to create delivery log"
                        );
                        return;
                    }
                    deliverer.execute(&hook, log).await;
                })
            })
            .collect();

        Dispatch { handles }
    }
}

/// Serialize the receiver-facing body `{event, timestamp, data}`.
pub fn build_payload(event: &str, data: &Value, at: DateTime<Utc>) -> Result<String> {
    let payload = HookPayload {
        event,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        data,
    };
    Ok(serde_json::to_string(&payload)?)
}

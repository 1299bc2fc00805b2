//! Delivery execution shared by the first attempt and every retry.
//!
//! Builds the signed request, POSTs the frozen payload, records the outcome
//! on the log and the hook, and applies the retry / circuit-breaker policy.

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delivery_log::DeliveryLogStore;
use crate::error::Result;
use crate::registry::HookRegistry;
use crate::signer;
use crate::types::{DeliveryLog, DeliveryStatus, Hook};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub const EVENT_HEADER: &str = "x-hook-event";
pub const TIMESTAMP_HEADER: &str = "x-hook-timestamp";
pub const DELIVERY_HEADER: &str = "x-hook-delivery";
pub const ATTEMPT_HEADER: &str = "x-hook-attempt";
pub const SIGNATURE_HEADER: &str = "x-hook-signature";

const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "host",
    "user-agent",
    "transfer-encoding",
    EVENT_HEADER,
    TIMESTAMP_HEADER,
    DELIVERY_HEADER,
    ATTEMPT_HEADER,
    SIGNATURE_HEADER,
];

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// Result of one HTTP attempt. Transport errors and non-2xx responses are
/// both `success: false`.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub success: bool,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct Deliverer {
    http: reqwest::Client,
    registry: Arc<HookRegistry>,
    logs: Arc<DeliveryLogStore>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl Deliverer {
    pub fn new(
        registry: Arc<HookRegistry>,
        logs: Arc<DeliveryLogStore>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let breaker = CircuitBreaker::new(registry.clone(), logs.clone(), clock.clone(), &config);

        Ok(Self {
            http,
            registry,
            logs,
            breaker,
            clock,
            config,
        })
    }

    /// Issue one signed POST of `payload` to the hook, bounded by its timeout.
    pub async fn send(
        &self,
        hook: &Hook,
        event: &str,
        payload: &[u8],
        delivery_id: &str,
        attempt: u32,
    ) -> AttemptOutcome {
        let headers = build_headers(hook, event, payload, delivery_id, attempt, self.clock.now());

        let start = Instant::now();
        let result = self
            .http
            .post(&hook.url)
            .headers(headers)
            .timeout(hook.timeout())
            .body(payload.to_vec())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let body = read_body(response, self.config.response_body_limit).await;
                let duration_ms = elapsed_ms(start);

                if status.is_success() {
                    AttemptOutcome {
                        success: true,
                        response_status: Some(status.as_u16()),
                        response_body: body,
                        error: None,
                        duration_ms,
                    }
                } else {
                    AttemptOutcome {
                        success: false,
                        response_status: Some(status.as_u16()),
                        response_body: body,
                        error: Some(format!("HTTP {}", status.as_u16())),
                        duration_ms,
                    }
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("request timed out after {}s", hook.timeout_secs)
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request error: {e}")
                };
                AttemptOutcome {
                    success: false,
                    response_status: None,
                    response_body: None,
                    error: Some(error),
                    duration_ms: elapsed_ms(start),
                }
            }
        }
    }

    /// Run one attempt for `log` and persist the resulting state.
    ///
    /// The caller owns `log` exclusively: either it was just created by the
    /// dispatcher or the sweeper holds its claim.
    pub async fn execute(&self, hook: &Hook, mut log: DeliveryLog) -> DeliveryLog {
        let outcome = self
            .send(hook, &log.event, log.payload.as_bytes(), &log.id, log.attempts)
            .await;
        let now = self.clock.now();
        log.record_attempt(
            outcome.response_status,
            outcome.response_body.clone(),
            outcome.error.clone(),
            outcome.duration_ms,
            now,
        );

        if outcome.success {
            log.succeed(now);
            if let Err(e) = self.registry.record_success(&hook.id, now).await {
                tracing::warn!(target: "hook_delivery", hook_id = %hook.id, error = %e, "Failed to record hook success");
            }
            tracing::info!(
                target: "hook_delivery",
                hook_id = %hook.id,
                delivery_id = %log.id,
                event = %log.event,
                attempt = log.attempts,
                status = outcome.response_status,
                duration_ms = outcome.duration_ms,
                "Hook delivered"
            );
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "delivery failed".to_string());
            if let Err(e) = self.registry.record_failure(&hook.id, now, &error).await {
                tracing::warn!(target: "hook_delivery", hook_id = %hook.id, error = %e, "Failed to record hook failure");
            }

            // max_retries counts retries after the first attempt.
            if log.attempts <= hook.max_retries {
                let next = now + self.config.backoff_delay(log.attempts);
                log.schedule_retry(next, now);
                tracing::warn!(
                    target: "hook_delivery",
                    hook_id = %hook.id,
                    delivery_id = %log.id,
                    attempt = log.attempts,
                    next_retry_at = %next,
                    error = %error,
                    "Delivery failed, retry scheduled"
                );
            } else {
                log.fail(error.clone(), now);
                tracing::warn!(
                    target: "hook_delivery",
                    hook_id = %hook.id,
                    delivery_id = %log.id,
                    attempt = log.attempts,
                    error = %error,
                    "Delivery failed permanently"
                );
            }
        }

        if let Err(e) = self.logs.update(&log).await {
            tracing::error!(target: "hook_delivery", delivery_id = %log.id, error = %e, "Failed to persist delivery log");
        }

        if log.status == DeliveryStatus::Failed {
            self.breaker.evaluate(&hook.id).await;
        }
        log
    }
}

pub(crate) fn build_headers(
    hook: &Hook,
    event: &str,
    payload: &[u8],
    delivery_id: &str,
    attempt: u32,
    now: DateTime<Utc>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &hook.headers {
        if is_reserved_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    insert_header(&mut headers, EVENT_HEADER, event);
    insert_header(
        &mut headers,
        TIMESTAMP_HEADER,
        &now.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    insert_header(&mut headers, DELIVERY_HEADER, delivery_id);
    if attempt > 1 {
        insert_header(&mut headers, ATTEMPT_HEADER, &attempt.to_string());
    }
    if let Some(secret) = hook.secret.as_deref() {
        insert_header(&mut headers, SIGNATURE_HEADER, &signer::sign(payload, secret));
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

/// Read at most `limit` bytes of the response body.
async fn read_body(mut response: reqwest::Response, limit: usize) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    if buf.is_empty() {
        return None;
    }
    buf.truncate(limit);
    Some(truncate_to_boundary(&String::from_utf8_lossy(&buf), limit).to_string())
}

pub(crate) fn truncate_to_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

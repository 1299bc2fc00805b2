//! Shared fixtures for the hook delivery integration tests.
//!
//! `Receiver` is a local axum server standing in for a hook endpoint. It
//! records every request and answers with a scripted sequence of status
//! codes, then a fixed default.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use nexus_hook_dispatcher::{EngineConfig, HookEngine, ManualClock, NewHook};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SECRET: &str = "whsec_test_secret_key_12345";

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("receiver got non-JSON body")
    }
}

#[derive(Clone)]
struct ReceiverState {
    script: Arc<Mutex<VecDeque<u16>>>,
    default_status: u16,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

pub struct Receiver {
    pub url: String,
    state: ReceiverState,
}

impl Receiver {
    /// Always answer `status`.
    pub async fn start(status: u16) -> Self {
        Self::spawn(&[], status, None).await
    }

    /// Answer each status in `script` once, then `then` forever.
    pub async fn scripted(script: &[u16], then: u16) -> Self {
        Self::spawn(script, then, None).await
    }

    /// Sleep for `delay` before answering 200.
    pub async fn slow(delay: Duration) -> Self {
        Self::spawn(&[], 200, Some(delay)).await
    }

    async fn spawn(script: &[u16], default_status: u16, delay: Option<Duration>) -> Self {
        let state = ReceiverState {
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            default_status,
            delay,
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/hooks/{name}", post(handle_hook))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test receiver");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://127.0.0.1:{port}/hooks/test"),
            state,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    /// Poll until `n` requests have arrived or `timeout` elapses.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.request_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.request_count() >= n
    }
}

async fn handle_hook(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let header_map = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
        .collect();
    state.requests.lock().unwrap().push(CapturedRequest {
        body: body.to_vec(),
        headers: header_map,
    });

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(state.default_status);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, format!("receiver answered {}", status.as_u16()))
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().unwrap().port()
}

// ─── Engine fixtures ──────────────────────────────────────────────────────────

pub fn engine() -> (HookEngine, Arc<ManualClock>) {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> (HookEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = HookEngine::with_clock(config, clock.clone()).expect("build engine");
    (engine, clock)
}

pub fn hook_for(url: &str, events: &[&str]) -> NewHook {
    NewHook {
        name: "test hook".into(),
        url: url.to_string(),
        events: events.iter().map(|e| e.to_string()).collect(),
        ..NewHook::default()
    }
}

/// Move the clock past the retry scheduled after `attempts` attempts.
pub fn advance_past_backoff(clock: &ManualClock, config: &EngineConfig, attempts: u32) {
    clock.advance(config.backoff_delay(attempts) + chrono::Duration::seconds(1));
}

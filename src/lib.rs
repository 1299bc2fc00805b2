//! Outbound hook delivery for ticket, message and topic events.
//!
//! Hooks are registered HTTP callbacks. When a domain event is triggered the
//! dispatcher fans it out to every matching active hook concurrently, signs
//! each request with HMAC-SHA256 when the hook has a secret, and records the
//! outcome in a delivery log. Failed deliveries are retried by a background
//! sweeper with exponential backoff; hooks that keep failing are
//! deactivated by a rolling circuit breaker.
//!
//! Delivery is at-least-once. Receivers should treat payloads as idempotent.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod delivery_log;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod signer;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use delivery::AttemptOutcome;
pub use dispatcher::Dispatch;
pub use engine::HookEngine;
pub use error::{HookError, Result};
pub use sweeper::SweepReport;
pub use types::{
    DeliveryLog, DeliveryStatus, Hook, HookPatch, HookStats, HookStatus, MatchOptions, NewHook,
};

//! Error types for the hook delivery engine.

use crate::types::DeliveryStatus;

/// Errors surfaced by registry, store and engine operations.
///
/// Delivery failures (timeouts, refused connections, non-2xx responses) are
/// not errors at this level: they are recorded on the delivery log and never
/// returned to event producers.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("invalid hook: {0}")]
    Validation(String),

    #[error("hook not found: {0}")]
    HookNotFound(String),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("delivery {id} is already {status} and cannot change")]
    TerminalDelivery { id: String, status: DeliveryStatus },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, HookError>;

//! Interim timer service client.
//!
//! The timer service is a key-addressed HTTP timer: POST creates a timer
//! and returns its id in a Location-style response, PUT refreshes an
//! existing id (handing back a replacement id when the original is gone),
//! DELETE cancels. When a timer fires, the service POSTs the opaque body
//! back to the configured callback URI verbatim.

mod client;

pub use client::HttpTimerService;

use std::collections::HashMap;

use async_trait::async_trait;

/// Errors from the timer service.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer service unreachable: {0}")]
    Unreachable(String),

    #[error("timer service returned HTTP {0}")]
    Status(u16),

    #[error("timer service response missing an id")]
    MissingId,
}

/// One timer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    /// Seconds between pops
    pub interval: u32,

    /// Stop repeating after this many seconds
    pub repeat_for: u32,

    /// Path the service calls back on each pop
    pub callback_path: String,

    /// Body redelivered verbatim on each pop
    pub opaque: String,

    /// Statistics tags for throughput accounting
    pub tags: HashMap<String, u32>,
}

impl TimerRequest {
    pub fn new(
        interval: u32,
        repeat_for: u32,
        callback_path: impl Into<String>,
        opaque: impl Into<String>,
    ) -> Self {
        // The gateway accounts every timer as one call.
        let tags = HashMap::from([("CALL".to_string(), 1)]);
        Self {
            interval,
            repeat_for,
            callback_path: callback_path.into(),
            opaque: opaque.into(),
            tags,
        }
    }
}

/// Key-addressed recurring timer service.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Create a timer, returning its id.
    async fn create(&self, request: &TimerRequest) -> Result<String, TimerError>;

    /// Refresh an existing timer. Returns the id to use from now on; this
    /// differs from `timer_id` when the service had already forgotten the
    /// original and allocated a replacement.
    async fn refresh(&self, timer_id: &str, request: &TimerRequest) -> Result<String, TimerError>;

    /// Cancel a timer.
    async fn cancel(&self, timer_id: &str) -> Result<(), TimerError>;
}

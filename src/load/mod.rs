//! Token-bucket load monitor.
//!
//! Shapes request acceptance across the HTTP workers. The bucket refills at
//! an adaptive rate: when measured latency overshoots the target the rate
//! tightens, and when the gateway is comfortably under target it loosens
//! again, within the configured floor and ceiling.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::LoadConfig;

/// Requests between rate adjustments.
const ADJUST_PERIOD: u64 = 20;

/// Multiplicative decrease on overload, increase on headroom.
const DECREASE_FACTOR: f64 = 0.8;
const INCREASE_FACTOR: f64 = 1.1;

/// Latency smoothing factor (EMA alpha = 0.2).
const SMOOTHING: f64 = 0.2;

struct Inner {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    smoothed_latency_us: f64,
    completions: u64,
}

/// Shared admission-control token bucket.
pub struct LoadMonitor {
    inner: Mutex<Inner>,
    target_latency_us: f64,
    max_tokens: f64,
    min_rate: f64,
    max_rate: f64,
}

impl LoadMonitor {
    pub fn new(config: &LoadConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tokens: config.max_tokens as f64,
                rate: config.init_token_rate,
                last_refill: Instant::now(),
                smoothed_latency_us: 0.0,
                completions: 0,
            }),
            target_latency_us: config.target_latency_us as f64,
            max_tokens: config.max_tokens as f64,
            min_rate: config.min_token_rate,
            max_rate: if config.max_token_rate > 0.0 {
                config.max_token_rate
            } else {
                f64::INFINITY
            },
        }
    }

    /// Admit or shed one request.
    pub fn admit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * inner.rate).min(self.max_tokens);
        inner.last_refill = now;

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Record a completed request's latency and adapt the rate.
    pub fn request_complete(&self, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();

        let latency_us = latency.as_micros() as f64;
        inner.smoothed_latency_us = if inner.smoothed_latency_us == 0.0 {
            latency_us
        } else {
            SMOOTHING * latency_us + (1.0 - SMOOTHING) * inner.smoothed_latency_us
        };

        inner.completions += 1;
        if inner.completions % ADJUST_PERIOD != 0 {
            return;
        }

        let old_rate = inner.rate;
        if inner.smoothed_latency_us > self.target_latency_us {
            inner.rate = (inner.rate * DECREASE_FACTOR).max(self.min_rate);
        } else if inner.smoothed_latency_us < self.target_latency_us / 2.0 {
            inner.rate = (inner.rate * INCREASE_FACTOR).min(self.max_rate);
        }

        if (inner.rate - old_rate).abs() > f64::EPSILON {
            debug!(
                old_rate,
                new_rate = inner.rate,
                smoothed_latency_us = inner.smoothed_latency_us,
                "adjusted token rate"
            );
        }
    }

    /// Current token rate (for stats surfaces).
    pub fn rate(&self) -> f64 {
        self.inner.lock().unwrap().rate
    }
}

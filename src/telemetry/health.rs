//! Health tracking and per-collaborator communication monitors.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

/// Consecutive failures before a communication alarm is raised.
const ALARM_THRESHOLD: u32 = 3;

/// Process health, fed by successful ACAs.
///
/// Every accepted answer from the CDF counts as one passed probe; the
/// readiness surface reports healthy while probes keep arriving.
pub struct HealthChecker {
    passes: AtomicU64,
    last_pass: Mutex<Option<Instant>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            last_pass: Mutex::new(None),
        }
    }

    /// Record one successful end-to-end exchange.
    pub fn health_check_passed(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        *self.last_pass.lock().unwrap() = Some(Instant::now());
    }

    /// Total passed probes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Time since the last passed probe, if any ever passed.
    pub fn since_last_pass(&self) -> Option<std::time::Duration> {
        self.last_pass.lock().unwrap().map(|t| t.elapsed())
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the link to one external collaborator and raises a log-based
/// alarm after repeated failures, clearing it on the next success.
pub struct CommMonitor {
    name: &'static str,
    consecutive_failures: AtomicU32,
    alarmed: AtomicBool,
}

impl CommMonitor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            consecutive_failures: AtomicU32::new(0),
            alarmed: AtomicBool::new(false),
        }
    }

    /// The collaborator responded.
    pub fn success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.alarmed.swap(false, Ordering::Relaxed) {
            info!(collaborator = self.name, "communication restored, alarm cleared");
        }
    }

    /// The collaborator failed to respond.
    pub fn failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= ALARM_THRESHOLD && !self.alarmed.swap(true, Ordering::Relaxed) {
            warn!(
                collaborator = self.name,
                failures, "communication failing, raising alarm"
            );
        }
    }

    /// Whether the alarm is currently raised.
    pub fn is_alarmed(&self) -> bool {
        self.alarmed.load(Ordering::Relaxed)
    }
}

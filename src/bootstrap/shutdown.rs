use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - stop accepting new requests, finish in-flight messages
/// 3. Terminated - everything drained, safe to tear down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Manages graceful shutdown with a bounded drain period.
pub struct ShutdownManager {
    state: watch::Sender<ShutdownState>,
    in_flight: AtomicU64,
}

impl ShutdownManager {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            in_flight: AtomicU64::new(0),
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Check if accepting new requests
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Register a message entering processing. Returns false during drain.
    pub fn message_started(&self) -> bool {
        if !self.is_accepting() {
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// A message finished processing.
    pub fn message_finished(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.state() == ShutdownState::Draining && prev == 1 {
            self.terminate();
        }
    }

    /// In-flight message count.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start draining (called on SIGTERM/SIGINT).
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(in_flight = self.in_flight(), "starting graceful shutdown drain");
        let _ = self.state.send(ShutdownState::Draining);

        if self.in_flight() == 0 {
            self.terminate();
        }
    }

    /// Complete shutdown.
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        let in_flight = self.in_flight();
        if in_flight > 0 {
            warn!(in_flight, "terminating with messages still in flight");
        }

        info!("shutdown complete");
        let _ = self.state.send(ShutdownState::Terminated);
    }

    /// Wait until everything drained, or the timeout passes.
    pub async fn wait_for_drain(&self, timeout: Duration) {
        let mut rx = self.subscribe();

        let drained = tokio::time::timeout(timeout, async {
            while *rx.borrow_and_update() != ShutdownState::Terminated {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.in_flight(),
                "drain timeout reached, forcing shutdown"
            );
        }

        self.terminate();
    }
}

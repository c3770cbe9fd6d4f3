use std::sync::Arc;

use crate::load::LoadMonitor;
use crate::session::SessionManager;
use crate::telemetry::health::HealthChecker;

use super::shutdown::ShutdownManager;

/// State shared by every HTTP worker.
pub struct GatewayState {
    /// The session state machine
    pub session_manager: Arc<SessionManager>,

    /// Admission control
    pub load_monitor: Arc<LoadMonitor>,

    /// Health probe sink
    pub health: Arc<HealthChecker>,

    /// Drain coordination
    pub shutdown: Arc<ShutdownManager>,

    /// Include request bodies in ACR trace logs
    pub acr_logging: bool,
}

/// Shared gateway state handle.
pub type SharedGatewayState = Arc<GatewayState>;

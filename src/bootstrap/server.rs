use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use crate::config::Config;
use crate::diameter::{AcrSender, PeerManager};
use crate::http;
use crate::load::LoadMonitor;
use crate::session::{SessionManager, SessionStore};
use crate::store::{InMemoryKv, MemcachedKv, SharedKvStore};
use crate::telemetry::health::{CommMonitor, HealthChecker};
use crate::telemetry::metrics;
use crate::timer::HttpTimerService;

use super::shutdown::ShutdownManager;
use super::state::{GatewayState, SharedGatewayState};

/// The assembled gateway.
///
/// Construction wires the components bottom-up: load monitor, stores,
/// Diameter, timer service, session manager, HTTP. Teardown reverses the
/// order: the listener drains first, then in-flight messages, then the
/// Diameter peers go away with the process.
pub struct Server {
    config: Arc<Config>,
    state: SharedGatewayState,
    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Wire up the gateway from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let shutdown = ShutdownManager::new();

        let load_monitor = Arc::new(LoadMonitor::new(&config.load));

        // Stores: the local site first, remotes in declaration order.
        let (local_site, remote_sites) = config
            .stores
            .split_local()
            .context("local site missing from session stores")?;

        let kv_for = |domain: &str| -> SharedKvStore {
            if config.stores.in_memory {
                Arc::new(InMemoryKv::new())
            } else {
                Arc::new(MemcachedKv::new(domain, config.stores.blacklist_duration))
            }
        };

        let local_store = Arc::new(SessionStore::new(kv_for(&local_site.domain), "local"));
        let remote_stores: Vec<Arc<SessionStore>> = remote_sites
            .iter()
            .map(|site| Arc::new(SessionStore::new(kv_for(&site.domain), site.site.clone())))
            .collect();

        info!(
            local = %local_site.domain,
            remotes = remote_stores.len(),
            "session stores configured"
        );

        // Diameter towards the CCFs.
        let cdf_monitor = Arc::new(CommMonitor::new("cdf"));
        let peers = Arc::new(PeerManager::new(
            config.billing.origin_host.clone(),
            config.billing.origin_realm.clone(),
            config.billing.max_peers,
            config.billing.blacklist_duration,
            cdf_monitor,
        ));

        let sender = Arc::new(AcrSender::new(
            peers,
            config.billing.origin_host.clone(),
            config.billing.origin_realm.clone(),
            config.billing.realm.clone(),
            config.billing.peer.clone(),
            config.billing.diameter_timeout(config.load.target_latency_us),
        ));

        // Interim timers.
        let timer_monitor = Arc::new(CommMonitor::new("timer-service"));
        let timers = Arc::new(HttpTimerService::new(
            config.timer.service_url.clone(),
            config.timer.callback_host.clone(),
            config.timer.request_timeout,
            timer_monitor,
        ));

        let health = Arc::new(HealthChecker::new());

        let session_manager = Arc::new(SessionManager::new(
            local_store,
            remote_stores,
            sender,
            timers,
            health.clone(),
        ));

        let state = Arc::new(GatewayState {
            session_manager,
            load_monitor,
            health,
            shutdown: shutdown.clone(),
            acr_logging: config.http.acr_logging,
        });

        Ok(Self {
            config,
            state,
            shutdown,
        })
    }

    /// Shared state, for tests and embedding.
    pub fn state(&self) -> SharedGatewayState {
        self.state.clone()
    }

    /// Run the gateway until a termination signal arrives, then drain.
    pub async fn run(self) -> Result<()> {
        if let Some(metrics_bind) = self.config.telemetry.metrics_bind {
            tokio::spawn(async move {
                if let Err(e) = metrics::serve_metrics(metrics_bind).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            });
        }

        let app = http::router(self.state.clone());
        let listener = TcpListener::bind(self.config.http.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.http.bind))?;

        info!(
            address = %self.config.http.bind,
            billing_realm = %self.config.billing.realm,
            "billing API listening"
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_signal())
            .await
            .context("HTTP server failed")?;

        // The listener has drained; wait for in-flight messages before
        // tearing anything down.
        info!("termination signal received, draining");
        shutdown.start_drain();
        shutdown
            .wait_for_drain(self.config.http.drain_timeout)
            .await;

        info!(
            health_probes = self.state.health.passes(),
            "gateway stopped"
        );

        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

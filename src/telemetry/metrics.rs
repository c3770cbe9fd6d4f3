//! Prometheus metrics.
//!
//! Counters live in the process-wide default registry and are served in
//! text format from the admin metrics endpoint.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Counter helpers used throughout the gateway.
pub mod counters {
    use prometheus::{
        register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
    };
    use std::sync::OnceLock;

    fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
        cell.get_or_init(|| {
            register_int_counter!(name, help).expect("metric registration cannot fail")
        })
    }

    fn counter_vec(
        cell: &'static OnceLock<IntCounterVec>,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> &'static IntCounterVec {
        cell.get_or_init(|| {
            register_int_counter_vec!(name, help, labels).expect("metric registration cannot fail")
        })
    }

    static REQUESTS_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();
    static REQUESTS_REJECTED: OnceLock<IntCounter> = OnceLock::new();
    static REQUESTS_NO_PEERS: OnceLock<IntCounter> = OnceLock::new();
    static OVERLOAD_REJECTED: OnceLock<IntCounter> = OnceLock::new();
    static TIMER_POPS: OnceLock<IntCounter> = OnceLock::new();
    static ACR_SENT: OnceLock<IntCounterVec> = OnceLock::new();
    static ACR_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
    static ACR_REJECTED: OnceLock<IntCounter> = OnceLock::new();
    static ACR_UNDELIVERABLE: OnceLock<IntCounter> = OnceLock::new();
    static CDF_FAILOVER: OnceLock<IntCounter> = OnceLock::new();
    static SESSIONS_CREATED: OnceLock<IntCounter> = OnceLock::new();
    static SESSIONS_DELETED: OnceLock<IntCounter> = OnceLock::new();
    static SESSIONS_NOT_FOUND: OnceLock<IntCounter> = OnceLock::new();
    static SESSION_DESERIALIZE_FAILED: OnceLock<IntCounter> = OnceLock::new();
    static STORE_CONTENTION: OnceLock<IntCounter> = OnceLock::new();
    static TIMERS_CREATED: OnceLock<IntCounter> = OnceLock::new();
    static TIMERS_REFRESHED: OnceLock<IntCounter> = OnceLock::new();
    static TIMERS_CANCELLED: OnceLock<IntCounter> = OnceLock::new();
    static TIMER_FAILURES: OnceLock<IntCounter> = OnceLock::new();

    /// A billing request passed validation.
    pub fn billing_request_received(record_type: &str) {
        counter_vec(
            &REQUESTS_RECEIVED,
            "rfgwd_billing_requests_received_total",
            "Valid billing requests received, by record type",
            &["record_type"],
        )
        .with_label_values(&[record_type])
        .inc();
    }

    /// A billing request was rejected with 400.
    pub fn billing_request_rejected() {
        counter(
            &REQUESTS_REJECTED,
            "rfgwd_billing_requests_rejected_total",
            "Billing requests rejected as malformed",
        )
        .inc();
    }

    /// A Start/Event arrived without a peers object.
    pub fn billing_request_no_peers() {
        counter(
            &REQUESTS_NO_PEERS,
            "rfgwd_billing_requests_no_peers_total",
            "Start/Event requests accepted without a peers object",
        )
        .inc();
    }

    /// A request was shed by the load monitor.
    pub fn overload_rejected() {
        counter(
            &OVERLOAD_REJECTED,
            "rfgwd_overload_rejected_total",
            "Requests rejected by the load monitor",
        )
        .inc();
    }

    /// An interim timer popped back into the billing endpoint.
    pub fn timer_pop() {
        counter(
            &TIMER_POPS,
            "rfgwd_timer_pops_total",
            "Interim requests generated by timer pops",
        )
        .inc();
    }

    /// An ACR was dispatched towards a CCF.
    pub fn acr_sent(record_type: &str) {
        counter_vec(
            &ACR_SENT,
            "rfgwd_acr_sent_total",
            "ACRs dispatched, by record type",
            &["record_type"],
        )
        .with_label_values(&[record_type])
        .inc();
    }

    /// A CCF accepted an ACR with 2001.
    pub fn acr_accepted() {
        counter(
            &ACR_ACCEPTED,
            "rfgwd_acr_accepted_total",
            "ACRs accepted by the CDF",
        )
        .inc();
    }

    /// A CCF rejected an ACR with a terminal error.
    pub fn acr_rejected() {
        counter(
            &ACR_REJECTED,
            "rfgwd_acr_rejected_total",
            "ACRs rejected by the CDF",
        )
        .inc();
    }

    /// Every CCF failed; the ACR was dropped.
    pub fn acr_undeliverable() {
        counter(
            &ACR_UNDELIVERABLE,
            "rfgwd_acr_undeliverable_total",
            "ACRs that could not be delivered to any CCF",
        )
        .inc();
    }

    /// Failover advanced to the next CCF in the list.
    pub fn cdf_failover() {
        counter(
            &CDF_FAILOVER,
            "rfgwd_cdf_failover_total",
            "Failovers to a backup CCF",
        )
        .inc();
    }

    /// A session was written after a successful Start.
    pub fn session_created() {
        counter(
            &SESSIONS_CREATED,
            "rfgwd_sessions_created_total",
            "Charging sessions created",
        )
        .inc();
    }

    /// A session was removed (Stop or CDF 5002).
    pub fn session_deleted() {
        counter(
            &SESSIONS_DELETED,
            "rfgwd_sessions_deleted_total",
            "Charging sessions deleted",
        )
        .inc();
    }

    /// An Interim/Stop found no session anywhere.
    pub fn session_not_found() {
        counter(
            &SESSIONS_NOT_FOUND,
            "rfgwd_sessions_not_found_total",
            "Interim/Stop requests dropped for lack of a session",
        )
        .inc();
    }

    /// A stored record could not be deserialized.
    pub fn session_deserialize_failed() {
        counter(
            &SESSION_DESERIALIZE_FAILED,
            "rfgwd_session_deserialize_failed_total",
            "Session records that failed deserialization",
        )
        .inc();
    }

    /// A CAS write lost the race.
    pub fn store_contention() {
        counter(
            &STORE_CONTENTION,
            "rfgwd_store_contention_total",
            "CAS contention on session writes",
        )
        .inc();
    }

    /// An interim timer was created.
    pub fn timer_created() {
        counter(
            &TIMERS_CREATED,
            "rfgwd_timers_created_total",
            "Interim timers created",
        )
        .inc();
    }

    /// An interim timer was refreshed.
    pub fn timer_refreshed() {
        counter(
            &TIMERS_REFRESHED,
            "rfgwd_timers_refreshed_total",
            "Interim timers refreshed",
        )
        .inc();
    }

    /// An interim timer was cancelled.
    pub fn timer_cancelled() {
        counter(
            &TIMERS_CANCELLED,
            "rfgwd_timers_cancelled_total",
            "Interim timers cancelled",
        )
        .inc();
    }

    /// A timer service request failed.
    pub fn timer_failure() {
        counter(
            &TIMER_FAILURES,
            "rfgwd_timer_failures_total",
            "Timer service requests that failed",
        )
        .inc();
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();

    match encoder.encode(&metric_families, &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve_metrics(bind: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = TcpListener::bind(bind).await?;

    info!(address = %bind, "metrics endpoint listening");
    axum::serve(listener, app).await?;

    Ok(())
}

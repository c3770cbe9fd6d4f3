//! The billing API surface.
//!
//! Two endpoints: a liveness ping and the per-call billing entry point. The
//! HTTP reply goes out before ACR processing starts, so measured request
//! latency reflects parsing alone.

use std::collections::HashMap;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
    Router,
};
use tracing::{debug, info, warn};

use crate::bootstrap::SharedGatewayState;
use crate::telemetry::metrics::counters;

use super::parse::{parse_body, ParseOutcome};

/// Build the billing router. Wrong-method requests get 405 from the method
/// routing.
pub fn router(state: SharedGatewayState) -> Router {
    Router::new()
        .route("/ping", post(ping))
        .route("/call-id/:call_id", post(billing))
        .with_state(state)
}

async fn ping() -> &'static str {
    "OK"
}

async fn billing(
    State(state): State<SharedGatewayState>,
    Path(call_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let started = Instant::now();

    if !state.load_monitor.admit() {
        counters::overload_rejected();
        debug!(call_id = %call_id, "request shed by load monitor");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let trail: u64 = rand::random();
    let timer_interim = params.get("timer-interim").map(String::as_str) == Some("true");

    if timer_interim {
        counters::timer_pop();
        info!(trail, call_id = %call_id, "interim timer popped");
    }

    let status = match parse_body(&call_id, timer_interim, &body, trail, state.acr_logging) {
        Err(rejection) => {
            warn!(trail, call_id = %call_id, error = %rejection, "rejecting billing request");
            counters::billing_request_rejected();
            StatusCode::BAD_REQUEST
        }
        Ok(ParseOutcome::NoPeers) => {
            // Successfully processed, nothing to bill against.
            counters::billing_request_no_peers();
            StatusCode::OK
        }
        Ok(ParseOutcome::Message(msg)) => {
            counters::billing_request_received(msg.record_type.name());

            if state.shutdown.message_started() {
                // Reply before the ACR work begins; the session manager
                // owns the message from here.
                let state = state.clone();
                tokio::spawn(async move {
                    state.session_manager.handle(*msg).await;
                    state.shutdown.message_finished();
                });
            } else {
                debug!(trail, call_id = %call_id, "draining, message dropped");
            }

            StatusCode::OK
        }
    };

    state.load_monitor.request_complete(started.elapsed());
    status
}

//! ACR dispatch with CCF failover.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::session::Message;
use crate::telemetry::metrics::counters;

use super::rf::AccountingRequest;
use super::{result_code, DiameterClient, DiameterError};

/// Terminal outcome of one ACR exchange, delivered to the state machine
/// exactly once per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfOutcome {
    /// True when the CDF answered 2001.
    pub accepted: bool,

    /// Result code of the terminal answer, or `UNABLE_TO_DELIVER` when
    /// every CCF failed.
    pub result_code: u32,

    /// Acct-Interim-Interval from the answer (0 when absent).
    pub interim_interval: u32,

    /// Session-Id from the answer; empty on delivery failure.
    pub session_id: String,
}

impl CcfOutcome {
    fn undeliverable() -> Self {
        Self {
            accepted: false,
            result_code: result_code::DIAMETER_UNABLE_TO_DELIVER,
            interim_interval: 0,
            session_id: String::new(),
        }
    }
}

/// Issues one ACR per message, failing over in order through the message's
/// CCF list on `UNABLE_TO_DELIVER` and timeout.
pub struct AcrSender {
    client: Arc<dyn DiameterClient>,
    origin_host: String,
    origin_realm: String,
    dest_realm: String,
    fallback_peer: Option<String>,
    timeout: Duration,
}

impl AcrSender {
    pub fn new(
        client: Arc<dyn DiameterClient>,
        origin_host: impl Into<String>,
        origin_realm: impl Into<String>,
        dest_realm: impl Into<String>,
        fallback_peer: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            origin_host: origin_host.into(),
            origin_realm: origin_realm.into(),
            dest_realm: dest_realm.into(),
            fallback_peer,
            timeout,
        }
    }

    /// Send the message's ACR, walking the CCF list until one peer gives a
    /// terminal answer. Returns the message alongside the outcome so the
    /// state machine can finish with it.
    pub async fn send(&self, msg: Message) -> (CcfOutcome, Message) {
        let ccfs = if msg.ccfs.is_empty() {
            // Sessionless retry path: fall back to the configured peer.
            match &self.fallback_peer {
                Some(peer) => vec![peer.clone()],
                None => {
                    error!(call_id = %msg.call_id, "no CCFs available for message");
                    return (CcfOutcome::undeliverable(), msg);
                }
            }
        } else {
            msg.ccfs.clone()
        };

        for (which, ccf) in ccfs.iter().enumerate() {
            debug!(
                call_id = %msg.call_id,
                ccf = %ccf,
                which,
                record_number = msg.accounting_record_number,
                "sending ACR"
            );
            counters::acr_sent(msg.record_type.name());

            let acr = AccountingRequest::new(
                &msg.session_id,
                &self.origin_host,
                &self.origin_realm,
                ccf,
                &self.dest_realm,
                msg.accounting_record_number,
                &msg.received_event,
            );

            match self.client.send_acr(ccf, &acr, self.timeout).await {
                Ok(answer) if answer.result_code != result_code::DIAMETER_UNABLE_TO_DELIVER => {
                    let accepted = answer.result_code == result_code::DIAMETER_SUCCESS;
                    if accepted {
                        counters::acr_accepted();
                    } else {
                        counters::acr_rejected();
                    }

                    return (
                        CcfOutcome {
                            accepted,
                            result_code: answer.result_code,
                            interim_interval: answer.interim_interval,
                            session_id: answer.session_id,
                        },
                        msg,
                    );
                }
                Ok(_) => {
                    warn!(call_id = %msg.call_id, ccf = %ccf, which, "CCF answered UNABLE_TO_DELIVER");
                }
                Err(DiameterError::Timeout) => {
                    warn!(call_id = %msg.call_id, ccf = %ccf, which, "ACR timed out");
                }
                Err(e) => {
                    warn!(call_id = %msg.call_id, ccf = %ccf, which, error = %e, "failed to send ACR");
                }
            }

            if which + 1 < ccfs.len() {
                info!(call_id = %msg.call_id, next_ccf = %ccfs[which + 1], "cdf_failover");
                counters::cdf_failover();
            }
        }

        error!(call_id = %msg.call_id, "failed to reach all CCFs, ACR not delivered");
        counters::acr_undeliverable();

        (CcfOutcome::undeliverable(), msg)
    }
}

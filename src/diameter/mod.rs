//! Diameter Rf client.
//!
//! The gateway is a pure Rf client: it issues Accounting-Requests (ACR) to
//! CCF peers and consumes Accounting-Answers (ACA). The [`DiameterClient`]
//! trait is the seam the session layer talks through; [`PeerManager`] is the
//! production implementation over TCP with capability exchange, watchdog
//! handling and per-peer blacklisting.

pub mod avp;
pub mod dictionary;
pub mod peer;
pub mod rf;
mod sender;

pub use peer::PeerManager;
pub use sender::{AcrSender, CcfOutcome};

use std::time::Duration;

use async_trait::async_trait;

use rf::{AccountingAnswer, AccountingRequest};

/// Result codes the state machine cares about.
pub mod result_code {
    pub const DIAMETER_SUCCESS: u32 = 2001;
    pub const DIAMETER_UNABLE_TO_DELIVER: u32 = 3002;
    pub const DIAMETER_UNKNOWN_SESSION_ID: u32 = 5002;
}

/// 3GPP Rf accounting application id.
pub const RF_APPLICATION_ID: u32 = 3;

/// Errors from the Diameter transport.
#[derive(Debug, thiserror::Error)]
pub enum DiameterError {
    /// No answer arrived within the per-transaction timeout.
    #[error("transaction timed out")]
    Timeout,

    /// The peer could not be reached (connect failure, blacklist, link
    /// down).
    #[error("unable to deliver to {0}")]
    UnableToDeliver(String),

    /// The peer sent bytes we could not parse.
    #[error("malformed answer: {0}")]
    Codec(String),
}

/// Sends one ACR to one peer and waits for the ACA.
#[async_trait]
pub trait DiameterClient: Send + Sync {
    async fn send_acr(
        &self,
        peer: &str,
        acr: &AccountingRequest,
        timeout: Duration,
    ) -> Result<AccountingAnswer, DiameterError>;
}

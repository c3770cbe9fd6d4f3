//! rfgwd: an offline charging gateway.
//!
//! Sits between an IMS signalling layer emitting JSON charging events over
//! HTTP and a Charging Data Function speaking 3GPP Rf over Diameter. For
//! each SIP dialog (Call-ID plus role/functionality) the gateway keeps a
//! charging session alive for the lifetime of the call:
//!
//! - START/INTERIM/STOP/EVENT requests become Accounting-Request (ACR)
//!   transactions towards an ordered list of CCFs, with failover.
//! - Session state is persisted with compare-and-swap in a local store plus
//!   any number of remote site stores.
//! - A recurring interim timer, driven through an external timer service,
//!   keeps long calls billable even if the signalling node falls silent.

pub mod bootstrap;
pub mod config;
pub mod diameter;
pub mod http;
pub mod load;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timer;

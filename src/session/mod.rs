//! Charging session state.
//!
//! One charging session exists per (Call-ID, role, functionality) triple for
//! the lifetime of the SIP dialog. The [`SessionManager`] drives the
//! START/INTERIM/STOP/EVENT state machine against a local [`SessionStore`]
//! plus any number of remote replicas, hands accepted messages to the ACR
//! sender, and keeps the recurring interim timer alive.

mod codec;
mod manager;
mod store;
mod types;

pub use codec::{BinaryCodec, JsonCodec, SessionCodec};
pub use manager::{SessionManager, MAX_CAS_RETRIES, NO_TIMER};
pub use store::SessionStore;
pub use types::*;

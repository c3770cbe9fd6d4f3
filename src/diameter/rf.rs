//! Rf messages: Accounting-Request construction and Accounting-Answer
//! parsing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, warn};

use super::avp::{Avp, AvpValue, DiameterMessage, Header, CMD_FLAG_PROXIABLE, CMD_FLAG_REQUEST};
use super::dictionary::{self, code, command, AvpKind};
use super::{DiameterError, RF_APPLICATION_ID};

/// Service-Context-Id carried on every ACR.
pub const SERVICE_CONTEXT_ID: &str = "MNC.MCC.10.32260@3gpp.org";

/// Session-Id sentinel substituted when an answer omits the AVP; only ever
/// logged, never stored.
pub const SESSION_ID_NOT_FOUND: &str = "<value not found in Diameter message>";

static SESSION_SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Generate a fresh Session-Id of the recommended
/// `<DiameterIdentity>;<high 32 bits>;<low 32 bits>` form.
pub fn generate_session_id(origin_host: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let seq = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{};{};{}", origin_host, now, seq)
}

/// An Accounting-Request ready to encode.
#[derive(Debug, Clone)]
pub struct AccountingRequest {
    pub session_id: String,
    msg: DiameterMessage,
}

impl AccountingRequest {
    /// Build an ACR. Most AVPs are synthesised from `event`, which is the
    /// `event` object of the original HTTP request: JSON objects become
    /// grouped AVPs, arrays repeat the AVP, strings and numbers map
    /// directly, booleans and nulls are skipped.
    pub fn new(
        session_id: &str,
        origin_host: &str,
        origin_realm: &str,
        dest_host: &str,
        dest_realm: &str,
        record_number: u32,
        event: &serde_json::Value,
    ) -> Self {
        debug!(dest_host, record_number, "building an Accounting-Request");

        let session_id = if session_id.is_empty() {
            generate_session_id(origin_host)
        } else {
            session_id.to_string()
        };

        let mut avps = vec![
            Avp::new(code::SESSION_ID, None, AvpValue::Utf8(session_id.clone())),
            Avp::new(code::ORIGIN_HOST, None, AvpValue::Utf8(origin_host.to_string())),
            Avp::new(code::ORIGIN_REALM, None, AvpValue::Utf8(origin_realm.to_string())),
            Avp::new(code::DESTINATION_HOST, None, AvpValue::Utf8(dest_host.to_string())),
            Avp::new(code::DESTINATION_REALM, None, AvpValue::Utf8(dest_realm.to_string())),
            Avp::new(code::ACCT_APPLICATION_ID, None, AvpValue::Unsigned32(RF_APPLICATION_ID)),
            Avp::new(
                code::ACCOUNTING_RECORD_NUMBER,
                None,
                AvpValue::Unsigned32(record_number),
            ),
            Avp::new(
                code::SERVICE_CONTEXT_ID,
                None,
                AvpValue::Utf8(SERVICE_CONTEXT_ID.to_string()),
            ),
        ];

        if let serde_json::Value::Object(members) = event {
            for (name, value) in members {
                avps.extend(avps_from_json(name, value));
            }
        } else {
            warn!("cannot build ACR AVPs from non-object event JSON");
        }

        Self {
            session_id,
            msg: DiameterMessage {
                header: Header::new(
                    command::ACCOUNTING,
                    RF_APPLICATION_ID,
                    CMD_FLAG_REQUEST | CMD_FLAG_PROXIABLE,
                ),
                avps,
            },
        }
    }

    /// The top-level AVPs, in order.
    pub fn avps(&self) -> &[Avp] {
        &self.msg.avps
    }

    /// Encode with the given correlation ids.
    pub fn encode(&self, hop_by_hop: u32, end_to_end: u32) -> Vec<u8> {
        self.msg.encode(hop_by_hop, end_to_end)
    }
}

/// Translate one JSON member into AVPs. Arrays expand into repeated AVPs;
/// booleans, nulls and names missing from the dictionary produce nothing.
fn avps_from_json(name: &str, value: &serde_json::Value) -> Vec<Avp> {
    if let serde_json::Value::Array(items) = value {
        return items
            .iter()
            .flat_map(|item| avps_from_json(name, item))
            .collect();
    }

    let def = match dictionary::lookup(name) {
        Some(def) => def,
        None => {
            warn!(avp = name, "AVP not recognised, ignoring");
            return Vec::new();
        }
    };

    let avp_value = match (def.kind, value) {
        (AvpKind::Grouped, serde_json::Value::Object(members)) => {
            let children: Vec<Avp> = members
                .iter()
                .flat_map(|(n, v)| avps_from_json(n, v))
                .collect();
            AvpValue::Grouped(children)
        }
        (AvpKind::Utf8String, serde_json::Value::String(s)) => AvpValue::Utf8(s.clone()),
        (AvpKind::Utf8String, serde_json::Value::Number(n)) => AvpValue::Utf8(n.to_string()),
        (AvpKind::Unsigned32, serde_json::Value::Number(n)) => match n.as_u64() {
            Some(v) => AvpValue::Unsigned32(v as u32),
            None => {
                warn!(avp = name, "numeric AVP out of range, ignoring");
                return Vec::new();
            }
        },
        (AvpKind::Integer32, serde_json::Value::Number(n)) => match n.as_i64() {
            Some(v) => AvpValue::Integer32(v as i32),
            None => {
                warn!(avp = name, "numeric AVP out of range, ignoring");
                return Vec::new();
            }
        },
        (_, serde_json::Value::Bool(_)) | (_, serde_json::Value::Null) => {
            warn!(avp = name, "invalid format (bool/null) in JSON block, ignoring");
            return Vec::new();
        }
        (kind, other) => {
            warn!(avp = name, ?kind, value = %other, "JSON value does not match AVP type, ignoring");
            return Vec::new();
        }
    };

    vec![Avp::new(def.code, def.vendor, avp_value)]
}

/// The fields of an Accounting-Answer the state machine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingAnswer {
    pub result_code: u32,

    /// Session-Id from the answer, or [`SESSION_ID_NOT_FOUND`].
    pub session_id: String,

    /// Acct-Interim-Interval, or 0 when the AVP is absent.
    pub interim_interval: u32,
}

impl AccountingAnswer {
    /// Parse an ACA from its wire form.
    pub fn decode(frame: Bytes) -> Result<Self, DiameterError> {
        let msg = DiameterMessage::decode(frame)?;
        Ok(Self::from_message(&msg))
    }

    /// Extract the interesting AVPs from a decoded answer.
    pub fn from_message(msg: &DiameterMessage) -> Self {
        let result_code = msg
            .find(code::RESULT_CODE)
            .and_then(|a| a.as_u32())
            .unwrap_or(0);

        let session_id = msg
            .find(code::SESSION_ID)
            .and_then(|a| a.as_utf8())
            .unwrap_or_else(|| SESSION_ID_NOT_FOUND.to_string());

        let interim_interval = msg
            .find(code::ACCT_INTERIM_INTERVAL)
            .and_then(|a| a.as_u32())
            .unwrap_or(0);

        Self {
            result_code,
            session_id,
            interim_interval,
        }
    }
}

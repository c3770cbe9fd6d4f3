//! Charging event body validation.

use serde_json::Value;
use tracing::{debug, warn};

use crate::session::{Message, NodeFunctionality, NodeRole, RecordType};

/// Why a request body was rejected with 400.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseRejection {
    #[error("body is not a JSON object with an 'event' object")]
    NotAnEvent,

    #[error("event lacks a Service-Information/IMS-Information object")]
    MissingImsInformation,

    #[error("no Role-Of-Node in IMS-Information")]
    MissingRoleOfNode,

    #[error("no Node-Functionality in IMS-Information")]
    MissingNodeFunctionality,

    #[error("Accounting-Record-Type not available in JSON")]
    MissingRecordType,

    #[error("Accounting-Record-Type was not one of START/INTERIM/STOP/EVENT")]
    InvalidRecordType,

    #[error("'ccf' array missing, empty, or not all strings (mandatory for START/EVENT)")]
    BadCcfs,
}

/// A successfully handled request body.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A fully validated message, ready for the session manager.
    Message(Box<Message>),

    /// A Start/Event with no `peers` object at all: answered 200 with no
    /// further processing.
    NoPeers,
}

/// Validate a charging event body and build the [`Message`] for it.
///
/// A rejection never allocates a message and leaves no state behind.
pub fn parse_body(
    call_id: &str,
    timer_interim: bool,
    body: &[u8],
    trail: u64,
    acr_logging: bool,
) -> Result<ParseOutcome, ParseRejection> {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();

    // Log the body early so we still see it if we later determine it's
    // invalid.
    if acr_logging {
        match &parsed {
            Some(doc) => debug!(
                trail,
                body = %serde_json::to_string_pretty(doc).unwrap_or_default(),
                "handling billing request"
            ),
            None => debug!(
                trail,
                body = %String::from_utf8_lossy(body),
                "handling billing request (unparseable body)"
            ),
        }
    }

    let mut doc = match parsed {
        Some(Value::Object(map)) => map,
        _ => {
            warn!(trail, "JSON document was not a valid object");
            return Err(ParseRejection::NotAnEvent);
        }
    };

    let Some(Value::Object(event)) = doc.get("event") else {
        warn!(trail, "JSON document did not have an 'event' object");
        return Err(ParseRejection::NotAnEvent);
    };

    // Role-Of-Node and Node-Functionality distinguish devices in the path
    // of the same SIP Call-ID.
    let ims_information = event
        .get("Service-Information")
        .and_then(Value::as_object)
        .and_then(|si| si.get("IMS-Information"))
        .and_then(Value::as_object)
        .ok_or_else(|| {
            warn!(trail, "IMS-Information not included in the event description");
            ParseRejection::MissingImsInformation
        })?;

    let role = ims_information
        .get("Role-Of-Node")
        .and_then(Value::as_i64)
        .ok_or(ParseRejection::MissingRoleOfNode)?;

    let function = ims_information
        .get("Node-Functionality")
        .and_then(Value::as_i64)
        .ok_or(ParseRejection::MissingNodeFunctionality)?;

    let record_type_code = event
        .get("Accounting-Record-Type")
        .and_then(Value::as_i64)
        .ok_or(ParseRejection::MissingRecordType)?;

    let record_type =
        RecordType::from_code(record_type_code).ok_or(ParseRejection::InvalidRecordType)?;

    let session_refresh_time = event
        .get("Acct-Interim-Interval")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    // START and EVENT must name the CCFs to bill against. A wholly absent
    // peers object is not a protocol error: the request is acknowledged
    // and dropped.
    let mut ccfs = Vec::new();
    let mut ecfs = Vec::new();

    if record_type.is_start() || record_type.is_event() {
        let peers = match doc.get("peers").and_then(Value::as_object) {
            Some(p) => p,
            None => {
                warn!(trail, "JSON lacked a 'peers' object (mandatory for START/EVENT)");
                return Ok(ParseOutcome::NoPeers);
            }
        };

        ccfs = string_array(peers.get("ccf")).ok_or(ParseRejection::BadCcfs)?;
        if ccfs.is_empty() {
            warn!(trail, "'ccf' array missing or empty (mandatory for START/EVENT)");
            return Err(ParseRejection::BadCcfs);
        }

        // `ecf` is carried through best-effort; nothing downstream reads
        // it, so a malformed list never rejects the request.
        ecfs = peers
            .get("ecf")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
    }

    // The message takes ownership of the event object.
    let event_value = doc
        .remove("event")
        .unwrap_or(Value::Null);

    let mut msg = Message::new(
        call_id,
        NodeRole(role as u32),
        NodeFunctionality(function as u32),
        record_type,
        event_value,
        session_refresh_time,
        timer_interim,
        trail,
    );
    msg.ccfs = ccfs;
    msg.ecfs = ecfs;

    Ok(ParseOutcome::Message(Box::new(msg)))
}

/// Collect an optional array of strings; `None` when the value is present
/// but not an all-string array.
fn string_array(value: Option<&Value>) -> Option<Vec<String>> {
    let Some(value) = value else {
        return Some(Vec::new());
    };

    let items = value.as_array()?;
    items
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: &Value) -> Result<ParseOutcome, ParseRejection> {
        parse_body(
            "cid@example.com",
            false,
            body.to_string().as_bytes(),
            1,
            false,
        )
    }

    fn valid_start() -> Value {
        json!({
            "peers": { "ccf": ["ccf1.example.com"], "ecf": ["ecf1.example.com"] },
            "event": {
                "Accounting-Record-Type": 2,
                "Acct-Interim-Interval": 300,
                "Service-Information": {
                    "IMS-Information": {
                        "Role-Of-Node": 0,
                        "Node-Functionality": 0
                    }
                }
            }
        })
    }

    #[test]
    fn test_valid_start_builds_message() {
        let ParseOutcome::Message(msg) = parse(&valid_start()).unwrap() else {
            panic!("expected a message");
        };

        assert_eq!(msg.call_id, "cid@example.com");
        assert_eq!(msg.record_type, RecordType::Start);
        assert_eq!(msg.ccfs, vec!["ccf1.example.com"]);
        assert_eq!(msg.ecfs, vec!["ecf1.example.com"]);
        assert_eq!(msg.session_refresh_time, 300);
        assert!(!msg.timer_interim);

        // The message owns the event object for later AVP synthesis.
        assert!(msg.received_event.get("Service-Information").is_some());
    }

    #[test]
    fn test_not_json_rejected() {
        let err = parse_body("cid", false, b"not json at all", 1, false).unwrap_err();
        assert_eq!(err, ParseRejection::NotAnEvent);
    }

    #[test]
    fn test_missing_event_rejected() {
        let err = parse(&json!({ "peers": {} })).unwrap_err();
        assert_eq!(err, ParseRejection::NotAnEvent);
    }

    #[test]
    fn test_missing_ims_information_rejected() {
        let err = parse(&json!({
            "event": { "Accounting-Record-Type": 2 }
        }))
        .unwrap_err();
        assert_eq!(err, ParseRejection::MissingImsInformation);
    }

    #[test]
    fn test_missing_role_rejected() {
        let err = parse(&json!({
            "event": {
                "Accounting-Record-Type": 2,
                "Service-Information": {
                    "IMS-Information": { "Node-Functionality": 0 }
                }
            }
        }))
        .unwrap_err();
        assert_eq!(err, ParseRejection::MissingRoleOfNode);
    }

    #[test]
    fn test_missing_node_functionality_rejected() {
        let err = parse(&json!({
            "event": {
                "Accounting-Record-Type": 2,
                "Service-Information": {
                    "IMS-Information": { "Role-Of-Node": 0 }
                }
            }
        }))
        .unwrap_err();
        assert_eq!(err, ParseRejection::MissingNodeFunctionality);
    }

    #[test]
    fn test_non_integer_role_rejected() {
        let err = parse(&json!({
            "event": {
                "Accounting-Record-Type": 2,
                "Service-Information": {
                    "IMS-Information": { "Role-Of-Node": "zero", "Node-Functionality": 0 }
                }
            }
        }))
        .unwrap_err();
        assert_eq!(err, ParseRejection::MissingRoleOfNode);
    }

    #[test]
    fn test_invalid_record_type_rejected() {
        let mut body = valid_start();
        body["event"]["Accounting-Record-Type"] = json!(9);
        assert_eq!(parse(&body).unwrap_err(), ParseRejection::InvalidRecordType);

        body["event"]["Accounting-Record-Type"] = json!("start");
        assert_eq!(parse(&body).unwrap_err(), ParseRejection::MissingRecordType);
    }

    #[test]
    fn test_start_without_peers_is_no_peers() {
        let mut body = valid_start();
        body.as_object_mut().unwrap().remove("peers");

        assert!(matches!(parse(&body).unwrap(), ParseOutcome::NoPeers));
    }

    #[test]
    fn test_start_with_empty_ccf_rejected() {
        let mut body = valid_start();
        body["peers"]["ccf"] = json!([]);
        assert_eq!(parse(&body).unwrap_err(), ParseRejection::BadCcfs);

        body["peers"] = json!({});
        assert_eq!(parse(&body).unwrap_err(), ParseRejection::BadCcfs);
    }

    #[test]
    fn test_start_with_non_string_ccf_rejected() {
        let mut body = valid_start();
        body["peers"]["ccf"] = json!(["ccf1.example.com", 7]);
        assert_eq!(parse(&body).unwrap_err(), ParseRejection::BadCcfs);
    }

    #[test]
    fn test_malformed_ecf_is_tolerated() {
        // ecf is informational: junk entries are skipped, a junk value is
        // ignored, and the request still goes through.
        let mut body = valid_start();
        body["peers"]["ecf"] = json!(["ecf1.example.com", 7, null]);

        let ParseOutcome::Message(msg) = parse(&body).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.ecfs, vec!["ecf1.example.com"]);

        body["peers"]["ecf"] = json!("not-an-array");
        let ParseOutcome::Message(msg) = parse(&body).unwrap() else {
            panic!("expected a message");
        };
        assert!(msg.ecfs.is_empty());
    }

    #[test]
    fn test_interim_needs_no_peers() {
        let body = json!({
            "event": {
                "Accounting-Record-Type": 3,
                "Service-Information": {
                    "IMS-Information": { "Role-Of-Node": 0, "Node-Functionality": 0 }
                }
            }
        });

        let ParseOutcome::Message(msg) = parse(&body).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.record_type, RecordType::Interim);
        assert!(msg.ccfs.is_empty());
        assert_eq!(msg.session_refresh_time, 0);
    }

    #[test]
    fn test_timer_interim_flag_carried() {
        let body = json!({
            "event": {
                "Accounting-Record-Type": 3,
                "Service-Information": {
                    "IMS-Information": { "Role-Of-Node": 1, "Node-Functionality": 5 }
                }
            }
        });

        let outcome = parse_body("cid", true, body.to_string().as_bytes(), 1, false).unwrap();
        let ParseOutcome::Message(msg) = outcome else {
            panic!("expected a message");
        };
        assert!(msg.timer_interim);
        assert_eq!(msg.role, NodeRole::TERMINATING);
        assert_eq!(msg.function, NodeFunctionality::BGCF);
    }
}

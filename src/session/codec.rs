//! Session record serialisation.
//!
//! Two formats coexist so that a cluster can roll between releases without a
//! flag day: the legacy length-prefixed binary layout and the current JSON
//! schema. Reads try every registered deserialiser in order and the first
//! success wins; writes always use the single configured serialiser (JSON).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::types::Session;

/// One session record format.
pub trait SessionCodec: Send + Sync {
    /// Codec name, for logging.
    fn name(&self) -> &'static str;

    /// Serialise a session. The CAS tag is never persisted.
    fn serialize(&self, session: &Session) -> Vec<u8>;

    /// Deserialise a session, or `None` when the data is not in this
    /// codec's format.
    fn deserialize(&self, data: &[u8]) -> Option<Session>;
}

/// Legacy binary layout: NUL-terminated strings, little-endian integers.
///
/// ```text
/// session_id \0
/// u32 ccf count
/// ccf \0 ...
/// u32 acct_record_number
/// timer_id \0
/// u32 session_refresh_time
/// u32 interim_interval
/// ```
pub struct BinaryCodec;

impl BinaryCodec {
    fn put_str(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn take_str(buf: &mut &[u8]) -> Option<String> {
        let nul = buf.iter().position(|&b| b == 0)?;
        let s = String::from_utf8(buf[..nul].to_vec()).ok()?;
        buf.advance(nul + 1);
        Some(s)
    }

    fn take_u32(buf: &mut &[u8]) -> Option<u32> {
        if buf.remaining() < 4 {
            return None;
        }
        Some(buf.get_u32_le())
    }
}

impl SessionCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize(&self, session: &Session) -> Vec<u8> {
        let mut buf = BytesMut::new();

        Self::put_str(&mut buf, &session.session_id);
        buf.put_u32_le(session.ccfs.len() as u32);
        for ccf in &session.ccfs {
            Self::put_str(&mut buf, ccf);
        }
        buf.put_u32_le(session.acct_record_number);
        Self::put_str(&mut buf, &session.timer_id);
        buf.put_u32_le(session.session_refresh_time);
        buf.put_u32_le(session.interim_interval);

        buf.to_vec()
    }

    fn deserialize(&self, data: &[u8]) -> Option<Session> {
        let mut buf = data;

        let session_id = Self::take_str(&mut buf)?;

        let ccf_count = Self::take_u32(&mut buf)?;
        // An implausible count means this is not a binary record.
        if ccf_count > 64 {
            return None;
        }

        let mut ccfs = Vec::with_capacity(ccf_count as usize);
        for _ in 0..ccf_count {
            ccfs.push(Self::take_str(&mut buf)?);
        }

        let acct_record_number = Self::take_u32(&mut buf)?;
        let timer_id = Self::take_str(&mut buf)?;
        let session_refresh_time = Self::take_u32(&mut buf)?;
        let interim_interval = Self::take_u32(&mut buf)?;

        if buf.has_remaining() {
            return None;
        }

        Some(Session {
            session_id,
            ccfs,
            acct_record_number,
            timer_id,
            session_refresh_time,
            interim_interval,
            cas: 0,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct JsonSession {
    session_id: String,
    ccfs: Vec<String>,
    acct_record_num: u32,
    timer_id: String,
    refresh_time: u32,
    interim_interval: u32,
}

/// Current JSON schema.
pub struct JsonCodec;

impl SessionCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, session: &Session) -> Vec<u8> {
        let record = JsonSession {
            session_id: session.session_id.clone(),
            ccfs: session.ccfs.clone(),
            acct_record_num: session.acct_record_number,
            timer_id: session.timer_id.clone(),
            refresh_time: session.session_refresh_time,
            interim_interval: session.interim_interval,
        };

        // Serialising a struct of plain fields cannot fail.
        serde_json::to_vec(&record).unwrap_or_default()
    }

    fn deserialize(&self, data: &[u8]) -> Option<Session> {
        let record: JsonSession = match serde_json::from_slice(data) {
            Ok(r) => r,
            Err(e) => {
                trace!(error = %e, "not a JSON session record");
                return None;
            }
        };

        Some(Session {
            session_id: record.session_id,
            ccfs: record.ccfs,
            acct_record_number: record.acct_record_num,
            timer_id: record.timer_id,
            session_refresh_time: record.refresh_time,
            interim_interval: record.interim_interval,
            cas: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            session_id: "ccf1.example.com;1234;5678".to_string(),
            ccfs: vec!["ccf1.example.com".to_string(), "ccf2.example.com".to_string()],
            acct_record_number: 7,
            timer_id: "timer-abc123".to_string(),
            session_refresh_time: 300,
            interim_interval: 100,
            cas: 42,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let session = sample_session();

        let bytes = codec.serialize(&session);
        let restored = codec.deserialize(&bytes).unwrap();

        // Everything except the CAS tag survives the round trip.
        let mut expected = session;
        expected.cas = 0;
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_binary_round_trip() {
        let codec = BinaryCodec;
        let session = sample_session();

        let bytes = codec.serialize(&session);
        let restored = codec.deserialize(&bytes).unwrap();

        let mut expected = session;
        expected.cas = 0;
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_json_field_names() {
        let codec = JsonCodec;
        let bytes = codec.serialize(&sample_session());
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(value.get("session_id").is_some());
        assert!(value.get("ccfs").unwrap().is_array());
        assert_eq!(value.get("acct_record_num").unwrap(), 7);
        assert_eq!(value.get("refresh_time").unwrap(), 300);
        assert_eq!(value.get("interim_interval").unwrap(), 100);
    }

    #[test]
    fn test_binary_rejects_json_record() {
        let json_bytes = JsonCodec.serialize(&sample_session());
        assert!(BinaryCodec.deserialize(&json_bytes).is_none());
    }

    #[test]
    fn test_json_rejects_binary_record() {
        let binary_bytes = BinaryCodec.serialize(&sample_session());
        assert!(JsonCodec.deserialize(&binary_bytes).is_none());
    }

    #[test]
    fn test_binary_rejects_truncated_record() {
        let bytes = BinaryCodec.serialize(&sample_session());

        for len in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                BinaryCodec.deserialize(&bytes[..len]).is_none(),
                "truncation at {} should fail",
                len
            );
        }
    }

    #[test]
    fn test_empty_session_round_trips() {
        let session = Session::default();

        for codec in [&JsonCodec as &dyn SessionCodec, &BinaryCodec] {
            let restored = codec.deserialize(&codec.serialize(&session)).unwrap();
            assert_eq!(restored, session, "{} codec", codec.name());
        }
    }
}

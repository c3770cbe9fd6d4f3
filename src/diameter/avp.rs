//! Diameter wire format: message header and AVPs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::DiameterError;

/// AVP flag: vendor-specific.
pub const AVP_FLAG_VENDOR: u8 = 0x80;
/// AVP flag: mandatory.
pub const AVP_FLAG_MANDATORY: u8 = 0x40;

/// Command flag: this message is a request.
pub const CMD_FLAG_REQUEST: u8 = 0x80;
/// Command flag: proxiable.
pub const CMD_FLAG_PROXIABLE: u8 = 0x40;

/// Diameter message header (20 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop: u32,
    pub end_to_end: u32,
}

impl Header {
    pub fn new(command_code: u32, application_id: u32, flags: u8) -> Self {
        Self {
            version: 1,
            flags,
            command_code,
            application_id,
            hop_by_hop: 0,
            end_to_end: 0,
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & CMD_FLAG_REQUEST != 0
    }
}

/// AVP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvpValue {
    OctetString(Vec<u8>),
    Utf8(String),
    Unsigned32(u32),
    Integer32(i32),
    Unsigned64(u64),
    Grouped(Vec<Avp>),
}

/// One attribute-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub value: AvpValue,
}

impl Avp {
    pub fn new(code: u32, vendor_id: Option<u32>, value: AvpValue) -> Self {
        let flags = match vendor_id {
            Some(_) => AVP_FLAG_VENDOR | AVP_FLAG_MANDATORY,
            None => AVP_FLAG_MANDATORY,
        };
        Self {
            code,
            flags,
            vendor_id,
            value,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match &self.value {
            AvpValue::OctetString(b) => buf.put_slice(b),
            AvpValue::Utf8(s) => buf.put_slice(s.as_bytes()),
            AvpValue::Unsigned32(v) => buf.put_u32(*v),
            AvpValue::Integer32(v) => buf.put_i32(*v),
            AvpValue::Unsigned64(v) => buf.put_u64(*v),
            AvpValue::Grouped(avps) => {
                for avp in avps {
                    avp.encode(&mut buf);
                }
            }
        }
        buf.to_vec()
    }

    /// Encode this AVP, padded to a 4-octet boundary.
    pub fn encode(&self, buf: &mut BytesMut) {
        let payload = self.payload();
        let header_len = if self.vendor_id.is_some() { 12 } else { 8 };
        let avp_len = header_len + payload.len();

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        buf.put_u8(((avp_len >> 16) & 0xff) as u8);
        buf.put_u8(((avp_len >> 8) & 0xff) as u8);
        buf.put_u8((avp_len & 0xff) as u8);
        if let Some(vendor) = self.vendor_id {
            buf.put_u32(vendor);
        }
        buf.put_slice(&payload);

        // Pad to a 4-octet boundary; padding is not counted in the length.
        let pad = (4 - (avp_len % 4)) % 4;
        for _ in 0..pad {
            buf.put_u8(0);
        }
    }

    /// Decode one AVP, leaving `buf` positioned after its padding. The
    /// value is kept as an octet string; callers reinterpret it via the
    /// accessors below.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DiameterError> {
        if buf.remaining() < 8 {
            return Err(DiameterError::Codec("AVP header truncated".into()));
        }

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let len = ((buf.get_u8() as usize) << 16)
            | ((buf.get_u8() as usize) << 8)
            | buf.get_u8() as usize;

        let mut header_len = 8;
        let vendor_id = if flags & AVP_FLAG_VENDOR != 0 {
            if buf.remaining() < 4 {
                return Err(DiameterError::Codec("AVP vendor id truncated".into()));
            }
            header_len = 12;
            Some(buf.get_u32())
        } else {
            None
        };

        if len < header_len {
            return Err(DiameterError::Codec(format!("AVP length {} too small", len)));
        }
        let payload_len = len - header_len;
        if buf.remaining() < payload_len {
            return Err(DiameterError::Codec("AVP payload truncated".into()));
        }

        let payload = buf.copy_to_bytes(payload_len).to_vec();

        let pad = (4 - (len % 4)) % 4;
        if buf.remaining() < pad {
            return Err(DiameterError::Codec("AVP padding truncated".into()));
        }
        buf.advance(pad);

        Ok(Self {
            code,
            flags,
            vendor_id,
            value: AvpValue::OctetString(payload),
        })
    }

    /// Interpret the payload as a u32.
    pub fn as_u32(&self) -> Option<u32> {
        match &self.value {
            AvpValue::Unsigned32(v) => Some(*v),
            AvpValue::Integer32(v) => Some(*v as u32),
            AvpValue::OctetString(b) if b.len() == 4 => {
                Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => None,
        }
    }

    /// Interpret the payload as UTF-8 text.
    pub fn as_utf8(&self) -> Option<String> {
        match &self.value {
            AvpValue::Utf8(s) => Some(s.clone()),
            AvpValue::OctetString(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }
}

/// A decoded Diameter message: header plus flat top-level AVP list.
#[derive(Debug, Clone)]
pub struct DiameterMessage {
    pub header: Header,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    /// Find the first top-level AVP with the given code.
    pub fn find(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    /// Encode the full message with the given correlation ids.
    pub fn encode(&self, hop_by_hop: u32, end_to_end: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        for avp in &self.avps {
            avp.encode(&mut body);
        }

        let total_len = 20 + body.len();
        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u8(self.header.version);
        buf.put_u8(((total_len >> 16) & 0xff) as u8);
        buf.put_u8(((total_len >> 8) & 0xff) as u8);
        buf.put_u8((total_len & 0xff) as u8);
        buf.put_u8(self.header.flags);
        buf.put_u8(((self.header.command_code >> 16) & 0xff) as u8);
        buf.put_u8(((self.header.command_code >> 8) & 0xff) as u8);
        buf.put_u8((self.header.command_code & 0xff) as u8);
        buf.put_u32(self.header.application_id);
        buf.put_u32(hop_by_hop);
        buf.put_u32(end_to_end);
        buf.put_slice(&body);

        buf.to_vec()
    }

    /// Decode a full message from one framed buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self, DiameterError> {
        if buf.remaining() < 20 {
            return Err(DiameterError::Codec("header truncated".into()));
        }

        let version = buf.get_u8();
        let total_len = ((buf.get_u8() as usize) << 16)
            | ((buf.get_u8() as usize) << 8)
            | buf.get_u8() as usize;
        let flags = buf.get_u8();
        let command_code = ((buf.get_u8() as u32) << 16)
            | ((buf.get_u8() as u32) << 8)
            | buf.get_u8() as u32;
        let application_id = buf.get_u32();
        let hop_by_hop = buf.get_u32();
        let end_to_end = buf.get_u32();

        if version != 1 {
            return Err(DiameterError::Codec(format!("unsupported version {}", version)));
        }
        if total_len < 20 {
            return Err(DiameterError::Codec(format!("message length {} too small", total_len)));
        }

        let mut avps = Vec::new();
        while buf.has_remaining() {
            avps.push(Avp::decode(&mut buf)?);
        }

        Ok(Self {
            header: Header {
                version,
                flags,
                command_code,
                application_id,
                hop_by_hop,
                end_to_end,
            },
            avps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avp_encode_decode_u32() {
        let avp = Avp::new(268, None, AvpValue::Unsigned32(2001));
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);

        // 8 byte header + 4 byte payload, no padding needed.
        assert_eq!(buf.len(), 12);

        let mut bytes = Bytes::from(buf.to_vec());
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.code, 268);
        assert_eq!(decoded.as_u32(), Some(2001));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_avp_padding() {
        let avp = Avp::new(263, None, AvpValue::Utf8("abcde".to_string()));
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);

        // 8 + 5 = 13, padded to 16.
        assert_eq!(buf.len(), 16);

        let mut bytes = Bytes::from(buf.to_vec());
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.as_utf8().as_deref(), Some("abcde"));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_vendor_avp_round_trip() {
        let avp = Avp::new(829, Some(10415), AvpValue::Unsigned32(0));
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);

        let mut bytes = Bytes::from(buf.to_vec());
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.vendor_id, Some(10415));
        assert_eq!(decoded.code, 829);
        assert_eq!(decoded.as_u32(), Some(0));
    }

    #[test]
    fn test_message_round_trip() {
        let msg = DiameterMessage {
            header: Header::new(271, 3, CMD_FLAG_REQUEST | CMD_FLAG_PROXIABLE),
            avps: vec![
                Avp::new(263, None, AvpValue::Utf8("host;1;1".to_string())),
                Avp::new(268, None, AvpValue::Unsigned32(2001)),
            ],
        };

        let encoded = msg.encode(7, 9);
        let decoded = DiameterMessage::decode(Bytes::from(encoded)).unwrap();

        assert_eq!(decoded.header.command_code, 271);
        assert_eq!(decoded.header.application_id, 3);
        assert_eq!(decoded.header.hop_by_hop, 7);
        assert_eq!(decoded.header.end_to_end, 9);
        assert!(decoded.header.is_request());
        assert_eq!(decoded.find(263).unwrap().as_utf8().as_deref(), Some("host;1;1"));
        assert_eq!(decoded.find(268).unwrap().as_u32(), Some(2001));
    }

    #[test]
    fn test_truncated_message_rejected() {
        assert!(DiameterMessage::decode(Bytes::from_static(&[1, 0, 0])).is_err());
    }
}

//! AVP dictionary for the Rf application.
//!
//! Maps AVP names, as they appear in received charging event JSON, to wire
//! codes. Names not in the table cannot be encoded and are skipped with a
//! warning when building an ACR.

/// 3GPP vendor id.
pub const VENDOR_3GPP: u32 = 10415;

/// Base protocol AVP codes used directly.
pub mod code {
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const ORIGIN_REALM: u32 = 296;
    pub const DESTINATION_HOST: u32 = 293;
    pub const DESTINATION_REALM: u32 = 283;
    pub const ACCT_APPLICATION_ID: u32 = 259;
    pub const RESULT_CODE: u32 = 268;
    pub const ACCOUNTING_RECORD_TYPE: u32 = 480;
    pub const ACCOUNTING_RECORD_NUMBER: u32 = 485;
    pub const ACCT_INTERIM_INTERVAL: u32 = 85;
    pub const SERVICE_CONTEXT_ID: u32 = 461;
    pub const VENDOR_ID: u32 = 266;
    pub const PRODUCT_NAME: u32 = 269;
    pub const FIRMWARE_REVISION: u32 = 267;
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const ORIGIN_STATE_ID: u32 = 278;
}

/// Diameter command codes.
pub mod command {
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    pub const DEVICE_WATCHDOG: u32 = 280;
    pub const ACCOUNTING: u32 = 271;
}

/// How an AVP's JSON value is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvpKind {
    Utf8String,
    Unsigned32,
    Integer32,
    Grouped,
}

/// Dictionary entry for one AVP.
#[derive(Debug, Clone, Copy)]
pub struct AvpDef {
    pub code: u32,
    pub vendor: Option<u32>,
    pub kind: AvpKind,
}

/// Look up an AVP by the name used in charging event JSON.
pub fn lookup(name: &str) -> Option<AvpDef> {
    use AvpKind::*;

    let (code, vendor, kind) = match name {
        // Base accounting AVPs
        "Session-Id" => (code::SESSION_ID, None, Utf8String),
        "Accounting-Record-Type" => (code::ACCOUNTING_RECORD_TYPE, None, Unsigned32),
        "Accounting-Record-Number" => (code::ACCOUNTING_RECORD_NUMBER, None, Unsigned32),
        "Acct-Interim-Interval" => (code::ACCT_INTERIM_INTERVAL, None, Unsigned32),
        "Service-Context-Id" => (code::SERVICE_CONTEXT_ID, None, Utf8String),
        "User-Name" => (1, None, Utf8String),
        "Event-Timestamp" => (55, None, Unsigned32),

        // 3GPP Rf service information (TS 32.299)
        "Service-Information" => (873, Some(VENDOR_3GPP), Grouped),
        "Subscription-Id" => (443, None, Grouped),
        "Subscription-Id-Type" => (450, None, Unsigned32),
        "Subscription-Id-Data" => (444, None, Utf8String),
        "IMS-Information" => (876, Some(VENDOR_3GPP), Grouped),
        "Event-Type" => (823, Some(VENDOR_3GPP), Grouped),
        "SIP-Method" => (824, Some(VENDOR_3GPP), Utf8String),
        "Expires" => (888, Some(VENDOR_3GPP), Unsigned32),
        "Role-Of-Node" => (829, Some(VENDOR_3GPP), Unsigned32),
        "Node-Functionality" => (862, Some(VENDOR_3GPP), Unsigned32),
        "User-Session-Id" => (830, Some(VENDOR_3GPP), Utf8String),
        "Calling-Party-Address" => (831, Some(VENDOR_3GPP), Utf8String),
        "Called-Party-Address" => (832, Some(VENDOR_3GPP), Utf8String),
        "Requested-Party-Address" => (1251, Some(VENDOR_3GPP), Utf8String),
        "Called-Asserted-Identity" => (1250, Some(VENDOR_3GPP), Utf8String),
        "Associated-URI" => (856, Some(VENDOR_3GPP), Utf8String),
        "Time-Stamps" => (833, Some(VENDOR_3GPP), Grouped),
        "SIP-Request-Timestamp" => (834, Some(VENDOR_3GPP), Unsigned32),
        "SIP-Response-Timestamp" => (835, Some(VENDOR_3GPP), Unsigned32),
        "SIP-Request-Timestamp-Fraction" => (2301, Some(VENDOR_3GPP), Unsigned32),
        "SIP-Response-Timestamp-Fraction" => (2302, Some(VENDOR_3GPP), Unsigned32),
        "Application-Server-Information" => (850, Some(VENDOR_3GPP), Grouped),
        "Application-Server" => (836, Some(VENDOR_3GPP), Utf8String),
        "Application-Provided-Called-Party-Address" => (837, Some(VENDOR_3GPP), Utf8String),
        "Inter-Operator-Identifier" => (838, Some(VENDOR_3GPP), Grouped),
        "Originating-IOI" => (839, Some(VENDOR_3GPP), Utf8String),
        "Terminating-IOI" => (840, Some(VENDOR_3GPP), Utf8String),
        "IMS-Charging-Identifier" => (841, Some(VENDOR_3GPP), Utf8String),
        "SDP-Session-Description" => (842, Some(VENDOR_3GPP), Utf8String),
        "SDP-Media-Component" => (843, Some(VENDOR_3GPP), Grouped),
        "SDP-Media-Name" => (844, Some(VENDOR_3GPP), Utf8String),
        "SDP-Media-Description" => (845, Some(VENDOR_3GPP), Utf8String),
        "SDP-Type" => (2036, Some(VENDOR_3GPP), Unsigned32),
        "Served-Party-IP-Address" => (848, Some(VENDOR_3GPP), Utf8String),
        "Server-Capabilities" => (603, Some(VENDOR_3GPP), Grouped),
        "Cause-Code" => (861, Some(VENDOR_3GPP), Integer32),
        "Reason-Code" => (872, Some(VENDOR_3GPP), Unsigned32),
        "Access-Network-Information" => (1263, Some(VENDOR_3GPP), Utf8String),
        "IMS-Visited-Network-Identifier" => (2713, Some(VENDOR_3GPP), Utf8String),
        "Instance-Id" => (3402, Some(VENDOR_3GPP), Utf8String),
        "Session-Priority" => (650, Some(VENDOR_3GPP), Unsigned32),
        "Initial-IMS-Charging-Identifier" => (2321, Some(VENDOR_3GPP), Utf8String),

        _ => return None,
    };

    Some(AvpDef { code, vendor, kind })
}

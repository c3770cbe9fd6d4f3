//! Core session and message types.

use std::fmt;

/// Accounting record type carried in a charging event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// One-shot event, no session
    Event = 1,
    /// First record of a session
    Start = 2,
    /// Mid-session record keeping the billing window open
    Interim = 3,
    /// Final record of a session
    Stop = 4,
}

impl RecordType {
    /// Map the wire integer to a record type.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Event),
            2 => Some(Self::Start),
            3 => Some(Self::Interim),
            4 => Some(Self::Stop),
            _ => None,
        }
    }

    /// The wire integer for this record type.
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Get the string name of this record type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Start => "start",
            Self::Interim => "interim",
            Self::Stop => "stop",
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event)
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    pub fn is_interim(&self) -> bool {
        matches!(self, Self::Interim)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Role of the SIP node that emitted the event.
///
/// The raw integer participates in the session key, so unknown values are
/// carried through rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRole(pub u32);

impl NodeRole {
    pub const ORIGINATING: NodeRole = NodeRole(0);
    pub const TERMINATING: NodeRole = NodeRole(1);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "originating",
            1 => "terminating",
            _ => "unknown",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Functionality of the SIP node that emitted the event.
///
/// Distinct functionalities for the same Call-ID yield distinct sessions: a
/// call traversing both an S-CSCF and a P-CSCF is billed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeFunctionality(pub u32);

impl NodeFunctionality {
    pub const SCSCF: NodeFunctionality = NodeFunctionality(0);
    pub const PCSCF: NodeFunctionality = NodeFunctionality(1);
    pub const ICSCF: NodeFunctionality = NodeFunctionality(2);
    pub const MRFC: NodeFunctionality = NodeFunctionality(3);
    pub const MGCF: NodeFunctionality = NodeFunctionality(4);
    pub const BGCF: NodeFunctionality = NodeFunctionality(5);
    pub const AS: NodeFunctionality = NodeFunctionality(6);
    pub const IBCF: NodeFunctionality = NodeFunctionality(7);
    pub const SGW: NodeFunctionality = NodeFunctionality(8);
    pub const PGW: NodeFunctionality = NodeFunctionality(9);
    pub const HSGW: NodeFunctionality = NodeFunctionality(10);
    pub const ECSCF: NodeFunctionality = NodeFunctionality(11);
    pub const MME: NodeFunctionality = NodeFunctionality(12);
    pub const TRF: NodeFunctionality = NodeFunctionality(13);
    pub const TF: NodeFunctionality = NodeFunctionality(14);
    pub const ATCF: NodeFunctionality = NodeFunctionality(15);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "S-CSCF",
            1 => "P-CSCF",
            2 => "I-CSCF",
            3 => "MRFC",
            4 => "MGCF",
            5 => "BGCF",
            6 => "AS",
            7 => "IBCF",
            8 => "S-GW",
            9 => "P-GW",
            10 => "HSGW",
            11 => "E-CSCF",
            12 => "MME",
            13 => "TRF",
            14 => "TF",
            15 => "ATCF",
            _ => "unknown",
        }
    }
}

impl fmt::Display for NodeFunctionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key identifying one charging session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub call_id: String,
    pub role: NodeRole,
    pub function: NodeFunctionality,
}

impl SessionKey {
    pub fn new(
        call_id: impl Into<String>,
        role: NodeRole,
        function: NodeFunctionality,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            role,
            function,
        }
    }

    /// The store key: call-id with the role and functionality integers
    /// appended in decimal.
    pub fn store_key(&self) -> String {
        format!("{}{}{}", self.call_id, self.role.0, self.function.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{})",
            self.call_id,
            self.role.name(),
            self.function.name()
        )
    }
}

/// An in-flight charging event.
///
/// Owned linearly: the parser builds it, the session manager mutates it, the
/// ACR sender borrows it for the duration of the Diameter exchange, and the
/// manager's response handling consumes it.
#[derive(Debug)]
pub struct Message {
    pub call_id: String,
    pub role: NodeRole,
    pub function: NodeFunctionality,
    pub record_type: RecordType,

    /// The `event` object from the received HTTP body; its members become
    /// the ACR's vendor AVPs.
    pub received_event: serde_json::Value,

    /// Ordered CCF list; non-empty for Start/Event.
    pub ccfs: Vec<String>,

    /// Ordered ECF list, carried for completeness.
    pub ecfs: Vec<String>,

    /// Session refresh window in seconds (`Acct-Interim-Interval` on the
    /// HTTP event).
    pub session_refresh_time: u32,

    /// True when this request was generated by a timer pop rather than the
    /// signalling layer.
    pub timer_interim: bool,

    pub accounting_record_number: u32,
    pub session_id: String,
    pub timer_id: String,
    pub interim_interval: u32,

    /// Correlation id threaded through logs for this request.
    pub trail: u64,
}

impl Message {
    pub fn new(
        call_id: impl Into<String>,
        role: NodeRole,
        function: NodeFunctionality,
        record_type: RecordType,
        received_event: serde_json::Value,
        session_refresh_time: u32,
        timer_interim: bool,
        trail: u64,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            role,
            function,
            record_type,
            received_event,
            ccfs: Vec::new(),
            ecfs: Vec::new(),
            session_refresh_time,
            timer_interim,
            accounting_record_number: 0,
            session_id: String::new(),
            timer_id: String::new(),
            interim_interval: 0,
            trail,
        }
    }

    /// The session key this message addresses.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.call_id.clone(), self.role, self.function)
    }
}

/// Stored charging session state.
///
/// In-memory values are short-lived read-modify-write snapshots; the `cas`
/// tag pins the version they were read at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    /// Diameter Session-Id allocated when the CDF accepted the Start
    pub session_id: String,

    /// CCF list fixed at session creation
    pub ccfs: Vec<String>,

    /// Strictly increasing per session; the Start carries 1
    pub acct_record_number: u32,

    /// Interim timer id, or [`crate::session::NO_TIMER`] when scheduling
    /// failed
    pub timer_id: String,

    /// Session refresh window in seconds
    pub session_refresh_time: u32,

    /// Interval between interim records, as dictated by the CDF
    pub interim_interval: u32,

    /// CAS version this snapshot was read at; not persisted
    pub cas: u64,
}

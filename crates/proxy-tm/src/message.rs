//! Message model consumed by the transaction engine.
//!
//! Parsing is owned by the transport layer. The engine only needs the handful of
//! fields that identify a transaction and classify a reply, plus the raw bytes
//! handed back to the [`MessageBuilder`](crate::interfaces::MessageBuilder).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// SIP request methods the engine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Register,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Other(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

/// Transport protocol of a destination or local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
}

impl Protocol {
    /// Reliable transports never retransmit requests or replies themselves.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Sctp => "SCTP",
            Protocol::Ws => "WS",
        };
        f.write_str(s)
    }
}

/// A local listening socket chosen to send towards a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalSocket {
    pub addr: SocketAddr,
    pub protocol: Protocol,
}

/// A resolved next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    /// Local socket bound for this destination. Filled in when the branch is created.
    pub socket: Option<LocalSocket>,
}

impl Destination {
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Self {
        Self { addr, protocol, socket: None }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(addr, Protocol::Udp)
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(addr, Protocol::Tcp)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.addr)
    }
}

/// The fields of the topmost Via header the engine relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// The `branch` parameter, if present.
    pub branch: Option<String>,
    /// Host and port of the sent-by field.
    pub sent_by: String,
}

/// An inbound or locally originated request.
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: Method,
    pub request_uri: String,
    /// Outbound proxy / destination URI set by routing, if any.
    pub next_hop: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub from_tag: Option<String>,
    pub top_via: Via,
    /// Content of a Reason header, carried from an upstream CANCEL.
    pub reason: Option<String>,
    /// Where replies to this request are sent.
    pub source: Destination,
    pub raw: Bytes,
}

impl SipRequest {
    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

/// An inbound response.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    /// Method from the CSeq header.
    pub cseq_method: Method,
    /// Branch parameter of the topmost Via, which is the one this proxy added.
    pub top_via_branch: Option<String>,
    /// Retry-After header value in seconds.
    pub retry_after: Option<u32>,
    pub source: Destination,
    pub raw: Bytes,
}

impl SipResponse {
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

/// Default reason phrase for locally generated replies.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        408 => "Request Timeout",
        478 => "Unresolvable destination",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => match code / 100 {
            1 => "Provisional",
            2 => "OK",
            3 => "Redirect",
            4 => "Client Error",
            5 => "Server Error",
            6 => "Global Failure",
            _ => "Unknown",
        },
    }
}

//! Asynchronous (`650`-class) events.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::err::ProtoError;
use crate::reply::{Reply, ReplySegment};

/// The recognized asynchronous event keywords, plus a passthrough for
/// anything this crate does not know.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// `CIRC`
    Circ,
    /// `STREAM`
    Stream,
    /// `ORCONN`
    OrConn,
    /// `BW`
    Bw,
    /// `DEBUG`
    Debug,
    /// `INFO`
    Info,
    /// `NOTICE`
    Notice,
    /// `WARN`
    Warn,
    /// `ERR`
    Err,
    /// `NEWDESC`
    NewDesc,
    /// `ADDRMAP`
    AddrMap,
    /// `DESCCHANGED`
    DescChanged,
    /// `STATUS_GENERAL`
    StatusGeneral,
    /// `STATUS_CLIENT`
    StatusClient,
    /// `STATUS_SERVER`
    StatusServer,
    /// `GUARD`
    Guard,
    /// `NS`
    Ns,
    /// `STREAM_BW`
    StreamBw,
    /// `CLIENTS_SEEN`
    ClientsSeen,
    /// `NEWCONSENSUS`
    NewConsensus,
    /// `BUILDTIMEOUT_SET`
    BuildTimeoutSet,
    /// `SIGNAL`
    Signal,
    /// `CONF_CHANGED`
    ConfChanged,
    /// `CIRC_MINOR`
    CircMinor,
    /// `TRANSPORT_LAUNCHED`
    TransportLaunched,
    /// `CONN_BW`
    ConnBw,
    /// `CIRC_BW`
    CircBw,
    /// `CELL_STATS`
    CellStats,
    /// `HS_DESC`
    HsDesc,
    /// `HS_DESC_CONTENT`
    HsDescContent,
    /// `NETWORK_LIVENESS`
    NetworkLiveness,
    /// An event keyword this crate does not recognize.
    Unrecognized(String),
}

impl EventKind {
    /// The wire keyword for this event, as used with `SETEVENTS`.
    pub fn as_str(&self) -> &str {
        use EventKind::*;
        match self {
            Circ => "CIRC",
            Stream => "STREAM",
            OrConn => "ORCONN",
            Bw => "BW",
            Debug => "DEBUG",
            Info => "INFO",
            Notice => "NOTICE",
            Warn => "WARN",
            Err => "ERR",
            NewDesc => "NEWDESC",
            AddrMap => "ADDRMAP",
            DescChanged => "DESCCHANGED",
            StatusGeneral => "STATUS_GENERAL",
            StatusClient => "STATUS_CLIENT",
            StatusServer => "STATUS_SERVER",
            Guard => "GUARD",
            Ns => "NS",
            StreamBw => "STREAM_BW",
            ClientsSeen => "CLIENTS_SEEN",
            NewConsensus => "NEWCONSENSUS",
            BuildTimeoutSet => "BUILDTIMEOUT_SET",
            Signal => "SIGNAL",
            ConfChanged => "CONF_CHANGED",
            CircMinor => "CIRC_MINOR",
            TransportLaunched => "TRANSPORT_LAUNCHED",
            ConnBw => "CONN_BW",
            CircBw => "CIRC_BW",
            CellStats => "CELL_STATS",
            HsDesc => "HS_DESC",
            HsDescContent => "HS_DESC_CONTENT",
            NetworkLiveness => "NETWORK_LIVENESS",
            Unrecognized(s) => s,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        use EventKind::*;
        Ok(match s {
            "CIRC" => Circ,
            "STREAM" => Stream,
            "ORCONN" => OrConn,
            "BW" => Bw,
            "DEBUG" => Debug,
            "INFO" => Info,
            "NOTICE" => Notice,
            "WARN" => Warn,
            "ERR" => Err,
            "NEWDESC" => NewDesc,
            "ADDRMAP" => AddrMap,
            "DESCCHANGED" => DescChanged,
            "STATUS_GENERAL" => StatusGeneral,
            "STATUS_CLIENT" => StatusClient,
            "STATUS_SERVER" => StatusServer,
            "GUARD" => Guard,
            "NS" => Ns,
            "STREAM_BW" => StreamBw,
            "CLIENTS_SEEN" => ClientsSeen,
            "NEWCONSENSUS" => NewConsensus,
            "BUILDTIMEOUT_SET" => BuildTimeoutSet,
            "SIGNAL" => Signal,
            "CONF_CHANGED" => ConfChanged,
            "CIRC_MINOR" => CircMinor,
            "TRANSPORT_LAUNCHED" => TransportLaunched,
            "CONN_BW" => ConnBw,
            "CIRC_BW" => CircBw,
            "CELL_STATS" => CellStats,
            "HS_DESC" => HsDesc,
            "HS_DESC_CONTENT" => HsDescContent,
            "NETWORK_LIVENESS" => NetworkLiveness,
            other => Unrecognized(other.to_owned()),
        })
    }
}

/// A parsed asynchronous event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CtrlEvent {
    /// Which event this is.
    kind: EventKind,
    /// The event content: the first line with the keyword stripped,
    /// followed by any further lines of the reply.
    lines: Vec<String>,
    /// Data payloads carried by the reply, if any (`HS_DESC_CONTENT`
    /// descriptors arrive this way).
    data: Vec<String>,
}

impl CtrlEvent {
    /// Interpret an asynchronous [`Reply`] as an event.
    ///
    /// The first word of the first line is the event keyword; the
    /// remainder and all further lines are the content.
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtoError> {
        let segments = reply.segments();
        let first = segments.first().ok_or(ProtoError::EmptyEvent)?;
        let (keyword, rest) = match first.line.split_once(' ') {
            Some((k, r)) => (k, Some(r)),
            None => (first.line.as_str(), None),
        };
        if keyword.is_empty() {
            return Err(ProtoError::EmptyEvent);
        }
        #[allow(clippy::unwrap_used)] // FromStr is infallible
        let kind = keyword.parse().unwrap();

        let mut lines = Vec::with_capacity(segments.len());
        lines.push(rest.unwrap_or("").to_owned());
        lines.extend(segments.iter().skip(1).map(|s| s.line.clone()));
        let data = segments
            .iter()
            .filter_map(|s: &ReplySegment| s.data.clone())
            .collect();
        Ok(CtrlEvent { kind, lines, data })
    }

    /// Which event this is.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// The content lines (keyword stripped from the first).
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Any data payloads the event carried.
    pub fn data(&self) -> &[String] {
        &self.data
    }

    /// The first content line.
    pub fn content(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }
}

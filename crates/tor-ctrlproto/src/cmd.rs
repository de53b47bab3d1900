//! Typed commands and their wire encodings.

use std::fmt::{self, Display};

use crate::event::EventKind;

/// Authentication material for `AUTHENTICATE`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Auth {
    /// No authentication configured; send a bare `AUTHENTICATE`.
    None,
    /// Cookie authentication: the raw bytes of the cookie file, sent hex
    /// encoded.
    Cookie(Vec<u8>),
    /// Password authentication, sent as a quoted string.
    Password(String),
}

/// A signal accepted by `SIGNAL`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Signal {
    /// Reload configuration (like SIGHUP).
    Reload,
    /// Controlled shutdown: clean shutdown for clients, delayed for relays.
    Shutdown,
    /// Dump stats (like SIGUSR1).
    Dump,
    /// Switch to loglevel debug (like SIGUSR2).
    Debug,
    /// Immediate shutdown (like SIGTERM).
    Halt,
    /// Switch to clean circuits for new streams.
    NewNym,
    /// Forget client-side cached DNS results.
    ClearDnsCache,
    /// Dump an unscheduled heartbeat log message.
    Heartbeat,
    /// Leave the dormant state.
    Active,
    /// Enter the dormant state.
    Dormant,
}

impl Signal {
    /// The wire keyword for this signal.
    pub fn as_str(&self) -> &'static str {
        use Signal::*;
        match self {
            Reload => "RELOAD",
            Shutdown => "SHUTDOWN",
            Dump => "DUMP",
            Debug => "DEBUG",
            Halt => "HALT",
            NewNym => "NEWNYM",
            ClearDnsCache => "CLEARDNSCACHE",
            Heartbeat => "HEARTBEAT",
            Active => "ACTIVE",
            Dormant => "DORMANT",
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A control-port command.
///
/// [`encode`](CtrlCommand::encode) produces the complete wire form,
/// including the terminating CRLF (and the dot terminator for multi-line
/// commands).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CtrlCommand {
    /// `AUTHENTICATE`
    Authenticate(Auth),
    /// `PROTOCOLINFO`
    ProtocolInfo,
    /// `SETEVENTS`, replacing the current event subscription set.
    SetEvents(Vec<EventKind>),
    /// `SIGNAL`
    Signal(Signal),
    /// `GETINFO` for one or more keys.
    GetInfo(Vec<String>),
    /// `GETCONF` for one or more keywords.
    GetConf(Vec<String>),
    /// `SETCONF` keyword/value pairs; a `None` value resets the keyword.
    SetConf(Vec<(String, Option<String>)>),
    /// `RESETCONF` for one or more keywords.
    ResetConf(Vec<String>),
    /// `+LOADCONF`, replacing the configuration with the given text.
    LoadConf(String),
    /// `TAKEOWNERSHIP`: Tor exits when this connection closes.
    TakeOwnership,
    /// `DROPOWNERSHIP`
    DropOwnership,
    /// `HSFETCH` of an onion-service descriptor.
    HsFetch {
        /// The `v3` address or `v3-<DescId>` form to fetch.
        address: String,
        /// Optional `SERVER=` directory servers to ask.
        servers: Vec<String>,
    },
    /// `ONION_CLIENT_AUTH_ADD`
    OnionClientAuthAdd {
        /// The onion address the credential is for, without `.onion`.
        address: String,
        /// The `x25519:<base64>` private key blob.
        key_blob: String,
        /// Optional `ClientName=`.
        client_name: Option<String>,
        /// Optional flags (`Permanent`).
        flags: Vec<String>,
    },
    /// `ONION_CLIENT_AUTH_REMOVE`
    OnionClientAuthRemove {
        /// The onion address whose credential to discard.
        address: String,
    },
    /// `ONION_CLIENT_AUTH_VIEW`
    OnionClientAuthView {
        /// Restrict the view to one address, if given.
        address: Option<String>,
    },
    /// An escape hatch: a raw command line, sent verbatim.
    Raw(String),
}

impl CtrlCommand {
    /// The command keyword, for logging.
    pub fn name(&self) -> &'static str {
        use CtrlCommand::*;
        match self {
            Authenticate(_) => "AUTHENTICATE",
            ProtocolInfo => "PROTOCOLINFO",
            SetEvents(_) => "SETEVENTS",
            Signal(_) => "SIGNAL",
            GetInfo(_) => "GETINFO",
            GetConf(_) => "GETCONF",
            SetConf(_) => "SETCONF",
            ResetConf(_) => "RESETCONF",
            LoadConf(_) => "LOADCONF",
            TakeOwnership => "TAKEOWNERSHIP",
            DropOwnership => "DROPOWNERSHIP",
            HsFetch { .. } => "HSFETCH",
            OnionClientAuthAdd { .. } => "ONION_CLIENT_AUTH_ADD",
            OnionClientAuthRemove { .. } => "ONION_CLIENT_AUTH_REMOVE",
            OnionClientAuthView { .. } => "ONION_CLIENT_AUTH_VIEW",
            Raw(_) => "RAW",
        }
    }

    /// True if this command may be written before authentication
    /// completes.
    ///
    /// Tor rejects everything else on an unauthenticated connection, so
    /// the connection layer refuses to send it in the first place.
    pub fn allowed_before_auth(&self) -> bool {
        matches!(
            self,
            CtrlCommand::Authenticate(_) | CtrlCommand::ProtocolInfo
        )
    }

    /// Produce the wire form, including all line terminators.
    pub fn encode(&self) -> String {
        use CtrlCommand::*;
        match self {
            Authenticate(Auth::None) => "AUTHENTICATE\r\n".into(),
            Authenticate(Auth::Cookie(cookie)) => {
                format!("AUTHENTICATE {}\r\n", hex::encode(cookie))
            }
            Authenticate(Auth::Password(pw)) => {
                format!("AUTHENTICATE {}\r\n", quoted(pw))
            }
            ProtocolInfo => "PROTOCOLINFO 1\r\n".into(),
            SetEvents(kinds) => {
                let mut line = String::from("SETEVENTS");
                for kind in kinds {
                    line.push(' ');
                    line.push_str(kind.as_str());
                }
                line.push_str("\r\n");
                line
            }
            Signal(sig) => format!("SIGNAL {}\r\n", sig),
            GetInfo(keys) => format!("GETINFO {}\r\n", keys.join(" ")),
            GetConf(keys) => format!("GETCONF {}\r\n", keys.join(" ")),
            SetConf(pairs) => {
                let mut line = String::from("SETCONF");
                for (key, value) in pairs {
                    line.push(' ');
                    line.push_str(key);
                    if let Some(value) = value {
                        line.push('=');
                        line.push_str(&quote_if_needed(value));
                    }
                }
                line.push_str("\r\n");
                line
            }
            ResetConf(keys) => format!("RESETCONF {}\r\n", keys.join(" ")),
            LoadConf(text) => {
                // Multi-line command: dot-escape the payload, terminate
                // with a bare dot.
                let mut out = String::from("+LOADCONF\r\n");
                for line in text.lines() {
                    if let Some(rest) = line.strip_prefix('.') {
                        out.push_str("..");
                        out.push_str(rest);
                    } else {
                        out.push_str(line);
                    }
                    out.push_str("\r\n");
                }
                out.push_str(".\r\n");
                out
            }
            TakeOwnership => "TAKEOWNERSHIP\r\n".into(),
            DropOwnership => "DROPOWNERSHIP\r\n".into(),
            HsFetch { address, servers } => {
                let mut line = format!("HSFETCH {}", address);
                for server in servers {
                    line.push_str(" SERVER=");
                    line.push_str(server);
                }
                line.push_str("\r\n");
                line
            }
            OnionClientAuthAdd {
                address,
                key_blob,
                client_name,
                flags,
            } => {
                let mut line = format!("ONION_CLIENT_AUTH_ADD {} {}", address, key_blob);
                if let Some(name) = client_name {
                    line.push_str(" ClientName=");
                    line.push_str(name);
                }
                if !flags.is_empty() {
                    line.push_str(" Flags=");
                    line.push_str(&flags.join(","));
                }
                line.push_str("\r\n");
                line
            }
            OnionClientAuthRemove { address } => {
                format!("ONION_CLIENT_AUTH_REMOVE {}\r\n", address)
            }
            OnionClientAuthView { address } => match address {
                Some(addr) => format!("ONION_CLIENT_AUTH_VIEW {}\r\n", addr),
                None => "ONION_CLIENT_AUTH_VIEW\r\n".into(),
            },
            Raw(line) => format!("{}\r\n", line.trim_end_matches(['\r', '\n'])),
        }
    }
}

/// Render a quoted string with `\` and `"` escaped.
fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a SETCONF value unless it is a bare word.
fn quote_if_needed(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./:".contains(c)) {
        s.to_owned()
    } else {
        quoted(s)
    }
}

//! Decoding the replies of the introspection commands: `PROTOCOLINFO`,
//! `GETINFO`, and `GETCONF`.

use std::path::PathBuf;

use crate::err::ProtoError;
use crate::reply::Reply;

/// What `PROTOCOLINFO` told us about the daemon.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct ProtocolInfo {
    /// The accepted authentication methods (`NULL`, `COOKIE`,
    /// `SAFECOOKIE`, `HASHEDPASSWORD`).
    pub auth_methods: Vec<String>,
    /// Where the auth cookie lives, when cookie auth is offered.
    pub cookie_file: Option<PathBuf>,
    /// The daemon's version string.
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    /// Decode a `PROTOCOLINFO` reply.
    ///
    /// ```text
    /// 250-PROTOCOLINFO 1
    /// 250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/run/tor/cookie"
    /// 250-VERSION Tor="0.4.8.9"
    /// 250 OK
    /// ```
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtoError> {
        let mut info = ProtocolInfo::default();
        let mut saw_header = false;
        for line in reply.lines() {
            match line.split(' ').next() {
                Some("PROTOCOLINFO") => saw_header = true,
                Some("AUTH") => {
                    if let Some(methods) = word_after(line, "METHODS=") {
                        info.auth_methods = methods.split(',').map(str::to_owned).collect();
                    }
                    if line.contains("COOKIEFILE=") {
                        info.cookie_file = word_after(line, "COOKIEFILE=").map(PathBuf::from);
                    }
                }
                Some("VERSION") => {
                    if let Some(version) = word_after(line, "Tor=") {
                        info.tor_version = Some(version);
                    }
                }
                _ => {}
            }
        }
        if !saw_header {
            return Err(ProtoError::MalformedLine(
                reply.terminal_line().to_owned(),
            ));
        }
        Ok(info)
    }

    /// True if cookie authentication is offered.
    pub fn has_cookie_auth(&self) -> bool {
        self.auth_methods
            .iter()
            .any(|m| m == "COOKIE" || m == "SAFECOOKIE")
    }
}

/// Extract the (possibly quoted) value following `key` in `line`.
fn word_after(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        Some(unescape_quoted(quoted))
    } else {
        Some(
            rest.split(' ')
                .next()
                .unwrap_or("")
                .trim_matches('"')
                .to_owned(),
        )
    }
}

/// Undo control-spec QuotedString escaping up to the closing quote.
fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Decode a `GETINFO` reply into its key/value pairs.
///
/// Single-line values arrive as `key=value`; larger ones as a `key=`
/// line with a data payload.
pub fn parse_info_reply(reply: &Reply) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for segment in reply.segments() {
        if segment.line == "OK" {
            continue;
        }
        let Some((key, inline)) = segment.line.split_once('=') else {
            continue;
        };
        let value = match &segment.data {
            Some(data) if inline.is_empty() => data.clone(),
            _ => inline.to_owned(),
        };
        pairs.push((key.to_owned(), value));
    }
    pairs
}

/// Decode a `GETCONF` reply.
///
/// A keyword at its default arrives bare, with no `=`; that decodes as
/// `None`.
pub fn parse_conf_reply(reply: &Reply) -> Vec<(String, Option<String>)> {
    reply
        .lines()
        .filter(|line| *line != "OK" && !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, value)) => (key.to_owned(), Some(value.to_owned())),
            None => (line.to_owned(), None),
        })
        .collect()
}

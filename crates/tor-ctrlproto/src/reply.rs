//! Reassembly of control-port replies from their constituent lines.
//!
//! The control protocol frames every reply as one or more CRLF lines,
//! each beginning with a three-digit status and a separator: `-` for a
//! middle line, `+` for a line that opens a dot-terminated data payload,
//! and a space for the terminal line. Status `6xx` marks asynchronous
//! events, which never belong to a command.

use crate::err::ProtoError;

/// One line of a reply, with any data payload that followed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplySegment {
    /// The three-digit status code on this line.
    pub status: u16,
    /// The line content after the separator.
    pub line: String,
    /// The dot-terminated payload, joined with `\n`, if the line opened
    /// one.
    pub data: Option<String>,
}

/// A complete reply: every line between (and including) the first line
/// and the terminal line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    /// The reply's segments, terminal line last. Never empty.
    segments: Vec<ReplySegment>,
}

impl Reply {
    /// The status code of the terminal line.
    pub fn status(&self) -> u16 {
        self.segments.last().map(|s| s.status).unwrap_or(0)
    }

    /// True if this reply is an asynchronous event (status `6xx`).
    pub fn is_async(&self) -> bool {
        (600..700).contains(&self.status())
    }

    /// True if the terminal status reports success (`2xx`).
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status())
    }

    /// All segments, in arrival order.
    pub fn segments(&self) -> &[ReplySegment] {
        &self.segments
    }

    /// Iterate over the line contents, ignoring payloads.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.line.as_str())
    }

    /// The content of the terminal line.
    pub fn terminal_line(&self) -> &str {
        self.segments.last().map(|s| s.line.as_str()).unwrap_or("")
    }

    /// Take ownership of the segments.
    pub fn into_segments(self) -> Vec<ReplySegment> {
        self.segments
    }
}

/// Incremental reply parser.
///
/// Feed complete (CRLF-stripped) lines in arrival order; a [`Reply`] pops
/// out whenever a terminal line completes one.
#[derive(Debug, Default)]
pub struct ReplyParser {
    /// Segments of the reply currently being assembled.
    current: Vec<ReplySegment>,
    /// Payload lines of an open `+` segment, if one is open.
    payload: Option<Vec<String>>,
}

impl ReplyParser {
    /// Return a fresh parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line; return a finished reply if this line completed
    /// one.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<Reply>, ProtoError> {
        if let Some(payload) = self.payload.as_mut() {
            if line == "." {
                let data = payload.join("\n");
                self.payload = None;
                match self.current.last_mut() {
                    Some(seg) => seg.data = Some(data),
                    None => return Err(ProtoError::UnexpectedPayload),
                }
            } else {
                // A leading doubled dot escapes a payload line that starts
                // with a dot.
                let unescaped = match line.strip_prefix("..") {
                    Some(rest) => format!(".{}", rest),
                    None => line.to_owned(),
                };
                payload.push(unescaped);
            }
            return Ok(None);
        }

        let (status, sep, rest) = split_status(line)?;
        self.current.push(ReplySegment {
            status,
            line: rest.to_owned(),
            data: None,
        });
        match sep {
            b'-' => Ok(None),
            b'+' => {
                self.payload = Some(Vec::new());
                Ok(None)
            }
            b' ' => Ok(Some(Reply {
                segments: std::mem::take(&mut self.current),
            })),
            _ => Err(ProtoError::MalformedLine(line.to_owned())),
        }
    }

    /// True if a reply is partially assembled.
    pub fn is_mid_reply(&self) -> bool {
        !self.current.is_empty() || self.payload.is_some()
    }
}

/// Split `NNN<sep>rest`, validating the status digits and separator.
fn split_status(line: &str) -> Result<(u16, u8, &str), ProtoError> {
    let bytes = line.as_bytes();
    if bytes.len() < 4
        || !bytes[..3].iter().all(u8::is_ascii_digit)
        || !matches!(bytes[3], b' ' | b'-' | b'+')
    {
        return Err(ProtoError::MalformedLine(line.to_owned()));
    }
    let status: u16 = line[..3]
        .parse()
        .map_err(|_| ProtoError::MalformedLine(line.to_owned()))?;
    Ok((status, bytes[3], &line[4..]))
}

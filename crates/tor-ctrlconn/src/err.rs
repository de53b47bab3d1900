//! Connection-level errors.

use std::io;
use std::sync::Arc;

use tor_ctrlproto::ProtoError;

/// An error on a control connection.
///
/// Errors are `Clone` because a single connection failure fans out to
/// every in-flight command.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnError {
    /// The connection has been closed locally; no further writes are
    /// accepted.
    #[error("control connection is closed")]
    Closed,

    /// `start_read` was invoked a second time.
    #[error("read loop already started on this connection")]
    AlreadyReading,

    /// A command that requires authentication was attempted before
    /// `AUTHENTICATE` succeeded.
    #[error("cannot send {cmd} before authentication")]
    NotAuthenticated {
        /// The refused command's keyword.
        cmd: &'static str,
    },

    /// Tor refused our `AUTHENTICATE`.
    #[error("authentication refused ({status}): {msg}")]
    AuthRefused {
        /// The reply status (usually 515, or 514 for a missing password).
        status: u16,
        /// The reply line Tor sent.
        msg: String,
    },

    /// Tor rejected a command we expected to succeed.
    #[error("command {cmd} rejected ({status}): {msg}")]
    CommandRejected {
        /// The rejected command's keyword.
        cmd: &'static str,
        /// The reply status.
        status: u16,
        /// The reply line Tor sent.
        msg: String,
    },

    /// The peer sent something we could not parse.
    #[error("protocol error")]
    Proto(#[from] ProtoError),

    /// The peer closed the connection, or an I/O error destroyed it; all
    /// in-flight commands fail with this.
    #[error("control connection lost")]
    ConnectionLost(#[source] Option<Arc<io::Error>>),

    /// An I/O error while establishing the connection.
    #[error("unable to open control connection")]
    Connect(#[source] Arc<io::Error>),
}

impl ConnError {
    /// Wrap an I/O error from the active read/write path.
    pub(crate) fn lost(e: io::Error) -> Self {
        ConnError::ConnectionLost(Some(Arc::new(e)))
    }

    /// The peer closed the stream without an error.
    pub(crate) fn peer_closed() -> Self {
        ConnError::ConnectionLost(None)
    }
}

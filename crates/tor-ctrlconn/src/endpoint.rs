//! Where a control port lives, and how to reach it.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(unix)]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::err::ConnError;

/// A bidirectional byte stream to a control port.
///
/// Boxed so that TCP and unix-socket transports share one connection
/// type.
pub(crate) trait CtrlSocket: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> CtrlSocket for T {}

/// The location of a Tor control port.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CtrlEndpoint {
    /// A TCP listener, conventionally on localhost.
    Tcp(SocketAddr),
    /// A unix-domain stream socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl CtrlEndpoint {
    /// Open a stream to this endpoint.
    ///
    /// No protocol I/O happens here; the caller starts the read loop and
    /// authenticates afterwards.
    pub(crate) async fn open(&self) -> Result<Box<dyn CtrlSocket>, ConnError> {
        match self {
            CtrlEndpoint::Tcp(addr) => {
                let sock = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| ConnError::Connect(Arc::new(e)))?;
                Ok(Box::new(sock))
            }
            #[cfg(unix)]
            CtrlEndpoint::Unix(path) => {
                let sock = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| ConnError::Connect(Arc::new(e)))?;
                Ok(Box::new(sock))
            }
        }
    }
}

impl Display for CtrlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlEndpoint::Tcp(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            CtrlEndpoint::Unix(path) => write!(f, "unix:\"{}\"", path.display()),
        }
    }
}

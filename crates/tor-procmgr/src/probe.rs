//! Port-availability probing.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

/// How long a probe may take before the port is declared unavailable.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(15);

/// Answers "would a bind/listen on this port succeed right now?".
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Return true iff the port can currently be bound on `host`.
    ///
    /// `EADDRINUSE` maps to `false`; a probe that exceeds its budget also
    /// reports `false`. Any other error surfaces to the caller.
    async fn is_available(&self, host: IpAddr, port: u16) -> Result<bool, io::Error>;
}

/// The default probe: try to bind a TCP listener and drop it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_available(&self, host: IpAddr, port: u16) -> Result<bool, io::Error> {
        let bind = tokio::net::TcpListener::bind((host, port));
        match tokio::time::timeout(PROBE_TIMEOUT, bind).await {
            Ok(Ok(listener)) => {
                drop(listener);
                Ok(true)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::AddrInUse => Ok(false),
            Ok(Err(e)) => Err(e),
            // Ran out of budget: treat as unavailable.
            Err(_elapsed) => Ok(false),
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn taken_port_reports_unavailable() {
        let holder = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = holder.local_addr().unwrap().port();
        let probe = TcpPortProbe;
        assert!(!probe
            .is_available(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap());
        drop(holder);
        assert!(probe
            .is_available(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap());
    }
}

//! A process-wide cache of the localhost addresses.
//!
//! Listener ports written without a host bind localhost; the generator
//! needs concrete addresses for its availability probes. The cache
//! refreshes through the system resolver and falls back to the loopback
//! constants when resolution fails.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;

/// The cached addresses, IPv4 then IPv6.
static CACHE: Lazy<Mutex<(IpAddr, IpAddr)>> = Lazy::new(|| {
    Mutex::new((
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ))
});

/// The cached IPv4 localhost address.
pub(crate) fn ipv4() -> IpAddr {
    CACHE.lock().expect("poisoned lock").0
}

/// The cached IPv6 localhost address.
pub(crate) fn ipv6() -> IpAddr {
    CACHE.lock().expect("poisoned lock").1
}

/// Re-resolve `localhost`, updating the cache.
///
/// Resolution failures are swallowed: the loopback constants always
/// remain usable.
pub(crate) async fn refresh() {
    match tokio::net::lookup_host(("localhost", 0)).await {
        Ok(addrs) => {
            let mut v4 = None;
            let mut v6 = None;
            for addr in addrs {
                match addr.ip() {
                    ip @ IpAddr::V4(_) if v4.is_none() => v4 = Some(ip),
                    ip @ IpAddr::V6(_) if v6.is_none() => v6 = Some(ip),
                    _ => {}
                }
            }
            let mut cache = CACHE.lock().expect("poisoned lock");
            if let Some(ip) = v4 {
                cache.0 = ip;
            }
            if let Some(ip) = v6 {
                cache.1 = ip;
            }
        }
        Err(e) => debug!("localhost refresh failed (ignored): {}", e),
    }
}

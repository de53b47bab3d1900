//! Tracking the listeners Tor reports through `NOTICE` events.
//!
//! Tor announces `Opened <kind> listener connection (ready) on <addr>`
//! when a listener comes up and `Closing <kind> listener on <addr>` (or
//! `Closing no-longer-configured <kind> listener …`) when one goes away.

use std::collections::BTreeSet;

/// The listener kinds we track.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub(crate) enum ListenerKind {
    /// SOCKS proxy listeners.
    Socks,
    /// DNS resolver listeners.
    Dns,
    /// HTTP CONNECT tunnel listeners.
    HttpTunnel,
    /// Transparent-proxy listeners.
    Trans,
    /// Control-port listeners.
    Control,
    /// OR (relay) listeners.
    Or,
    /// Directory listeners.
    Dir,
    /// Metrics listeners.
    Metrics,
}

impl ListenerKind {
    /// Map Tor's listener descriptor to a kind.
    fn from_descriptor(s: &str) -> Option<Self> {
        Some(match s {
            "Socks" => ListenerKind::Socks,
            "DNS" => ListenerKind::Dns,
            "HTTP tunnel" => ListenerKind::HttpTunnel,
            "Transparent pf/netfilter" | "Transparent natd" => ListenerKind::Trans,
            "Control" => ListenerKind::Control,
            "OR" | "Extended OR" => ListenerKind::Or,
            "Directory" => ListenerKind::Dir,
            "Metrics" => ListenerKind::Metrics,
            _ => return None,
        })
    }
}

/// The current set of open listeners, by kind.
///
/// Addresses are kept as the strings Tor reported (`127.0.0.1:9050`,
/// `unix:/run/tor/socks`): they are identifiers here, not dial targets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct TorListeners {
    /// SOCKS listeners.
    pub socks: BTreeSet<String>,
    /// DNS listeners.
    pub dns: BTreeSet<String>,
    /// HTTP tunnel listeners.
    pub http_tunnel: BTreeSet<String>,
    /// Transparent-proxy listeners.
    pub trans: BTreeSet<String>,
    /// Control listeners.
    pub control: BTreeSet<String>,
    /// OR listeners.
    pub or: BTreeSet<String>,
    /// Directory listeners.
    pub dir: BTreeSet<String>,
    /// Metrics listeners.
    pub metrics: BTreeSet<String>,
}

impl TorListeners {
    /// The mutable set for one kind.
    fn set_mut(&mut self, kind: ListenerKind) -> &mut BTreeSet<String> {
        match kind {
            ListenerKind::Socks => &mut self.socks,
            ListenerKind::Dns => &mut self.dns,
            ListenerKind::HttpTunnel => &mut self.http_tunnel,
            ListenerKind::Trans => &mut self.trans,
            ListenerKind::Control => &mut self.control,
            ListenerKind::Or => &mut self.or,
            ListenerKind::Dir => &mut self.dir,
            ListenerKind::Metrics => &mut self.metrics,
        }
    }

    /// Apply one parsed notice. Returns true if anything changed.
    pub(crate) fn apply_notice(&mut self, line: &str) -> bool {
        let Some(change) = parse_listener_notice(line) else {
            return false;
        };
        let set = self.set_mut(change.kind);
        if change.opened {
            set.insert(change.address)
        } else {
            set.remove(&change.address)
        }
    }

    /// Record a SOCKS unix-socket listener reported via `CONF_CHANGED`.
    /// Returns true if anything changed.
    pub(crate) fn apply_socks_unix(&mut self, path: &str) -> bool {
        self.socks.insert(format!("unix:{}", path))
    }
}

/// One parsed listener notice.
struct ListenerChange {
    /// Which set to touch.
    kind: ListenerKind,
    /// The reported address.
    address: String,
    /// Opened (true) or closing (false).
    opened: bool,
}

/// Parse an `Opened …`/`Closing …` listener notice, if that is what the
/// line is.
fn parse_listener_notice(line: &str) -> Option<ListenerChange> {
    let (rest, opened) = if let Some(rest) = line.strip_prefix("Opened ") {
        (rest, true)
    } else if let Some(rest) = line.strip_prefix("Closing ") {
        // "Closing no-longer-configured Socks listener on …"
        (
            rest.strip_prefix("no-longer-configured ").unwrap_or(rest),
            false,
        )
    } else {
        return None;
    };
    let marker = rest.find(" listener")?;
    let kind = ListenerKind::from_descriptor(&rest[..marker])?;
    let address = rest.rsplit(" on ").next()?.trim_end_matches('.');
    if address.is_empty() {
        return None;
    }
    Some(ListenerChange {
        kind,
        address: address.to_owned(),
        opened,
    })
}

//! The closed set of torrc keywords that the daemon supervisor emits.
//!
//! Each keyword carries its wire string, whether it is passed on the
//! command line at process start or loaded later over the control port,
//! and what kind of argument it takes. Everything here is data, not
//! behavior: callers match exhaustively, per the closed-model design.

use std::fmt::{self, Display};

/// What kind of argument a [`Keyword`](crate::Keyword) expects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ValueKind {
    /// An on/off boolean, serialized `1`/`0`.
    Bool,
    /// `auto`, `1`, or `0`.
    AutoBool,
    /// A listener port argument: `auto`, `0`, a port, or a unix socket.
    Port,
    /// A path to a file.
    File,
    /// A path to a directory.
    Dir,
    /// A free-form identifier or line remainder.
    Ident,
    /// A process id.
    Pid,
    /// A duration with an explicit unit.
    Interval,
    /// A hidden-service block.
    HiddenService,
}

/// A torrc keyword known to this crate.
///
/// The set is sparse on purpose: it covers what the supervisor needs to
/// generate, not Tor's whole configuration surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum Keyword {
    /// `CacheDirectory`
    CacheDirectory,
    /// `ConnectionPadding`
    ConnectionPadding,
    /// `__ControlPort` (non-persistent variant)
    ControlPort,
    /// `ControlPortWriteToFile`
    ControlPortWriteToFile,
    /// `CookieAuthFile`
    CookieAuthFile,
    /// `CookieAuthentication`
    CookieAuthentication,
    /// `DataDirectory`
    DataDirectory,
    /// `DisableNetwork`
    DisableNetwork,
    /// `__DNSPort` (non-persistent variant)
    DnsPort,
    /// `DormantCanceledByStartup`
    DormantCanceledByStartup,
    /// `DormantClientTimeout`
    DormantClientTimeout,
    /// `DormantOnFirstStartup`
    DormantOnFirstStartup,
    /// `DormantTimeoutDisabledByIdleStreams`
    DormantTimeoutDisabledByIdleStreams,
    /// `GeoIPFile`
    GeoIpFile,
    /// `GeoIPv6File`
    GeoIpv6File,
    /// `HashedControlPassword`
    HashedControlPassword,
    /// `HiddenServiceDir`, carrying a whole hidden-service block.
    HiddenServiceDir,
    /// `__HTTPTunnelPort` (non-persistent variant)
    HttpTunnelPort,
    /// `Log`
    Log,
    /// `__OwningControllerProcess`
    OwningControllerProcess,
    /// `ReducedConnectionPadding`
    ReducedConnectionPadding,
    /// `RunAsDaemon`
    RunAsDaemon,
    /// `__SocksPort` (non-persistent variant)
    SocksPort,
    /// `__TransPort` (non-persistent variant)
    TransPort,
}

impl Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Keyword {
    /// Return the exact string Tor expects for this keyword.
    pub fn as_str(&self) -> &'static str {
        use Keyword::*;
        match self {
            CacheDirectory => "CacheDirectory",
            ConnectionPadding => "ConnectionPadding",
            ControlPort => "__ControlPort",
            ControlPortWriteToFile => "ControlPortWriteToFile",
            CookieAuthFile => "CookieAuthFile",
            CookieAuthentication => "CookieAuthentication",
            DataDirectory => "DataDirectory",
            DisableNetwork => "DisableNetwork",
            DnsPort => "__DNSPort",
            DormantCanceledByStartup => "DormantCanceledByStartup",
            DormantClientTimeout => "DormantClientTimeout",
            DormantOnFirstStartup => "DormantOnFirstStartup",
            DormantTimeoutDisabledByIdleStreams => "DormantTimeoutDisabledByIdleStreams",
            GeoIpFile => "GeoIPFile",
            GeoIpv6File => "GeoIPv6File",
            HashedControlPassword => "HashedControlPassword",
            HiddenServiceDir => "HiddenServiceDir",
            HttpTunnelPort => "__HTTPTunnelPort",
            Log => "Log",
            OwningControllerProcess => "__OwningControllerProcess",
            ReducedConnectionPadding => "ReducedConnectionPadding",
            RunAsDaemon => "RunAsDaemon",
            SocksPort => "__SocksPort",
            TransPort => "__TransPort",
        }
    }

    /// Return the kind of argument this keyword takes.
    pub fn expects(&self) -> ValueKind {
        use Keyword::*;
        match self {
            CacheDirectory | DataDirectory => ValueKind::Dir,
            ControlPortWriteToFile | CookieAuthFile | GeoIpFile | GeoIpv6File => ValueKind::File,
            ControlPort | DnsPort | HttpTunnelPort | SocksPort | TransPort => ValueKind::Port,
            ConnectionPadding => ValueKind::AutoBool,
            CookieAuthentication
            | DisableNetwork
            | DormantCanceledByStartup
            | DormantOnFirstStartup
            | DormantTimeoutDisabledByIdleStreams
            | ReducedConnectionPadding
            | RunAsDaemon => ValueKind::Bool,
            DormantClientTimeout => ValueKind::Interval,
            HashedControlPassword | Log => ValueKind::Ident,
            HiddenServiceDir => ValueKind::HiddenService,
            OwningControllerProcess => ValueKind::Pid,
        }
    }

    /// Return true if this keyword names a listener port.
    pub fn is_port(&self) -> bool {
        matches!(self.expects(), ValueKind::Port)
    }

    /// Return true if this keyword accepts a unix socket in place of a
    /// TCP port.
    ///
    /// Tor only supports unix-socket listeners for its SOCKS and control
    /// ports.
    pub fn supports_unix_socket(&self) -> bool {
        matches!(self, Keyword::SocksPort | Keyword::ControlPort)
    }

    /// Return true if an unavailable concrete port for this keyword may be
    /// reassigned to `auto` by the configuration generator.
    pub fn allows_port_reassign(&self) -> bool {
        self.is_port()
    }

    /// Return true if this keyword must be passed on Tor's command line at
    /// process start, rather than loaded over the control connection.
    ///
    /// Everything the daemon needs before a control connection exists is a
    /// start argument: storage locations, the control listener and its
    /// authentication material, and the switches that keep the daemon
    /// quiescent until the runtime takes over.
    pub fn is_start_argument(&self) -> bool {
        use Keyword::*;
        match self {
            CacheDirectory
            | ControlPort
            | ControlPortWriteToFile
            | CookieAuthFile
            | CookieAuthentication
            | DataDirectory
            | DisableNetwork
            | DnsPort
            | DormantCanceledByStartup
            | GeoIpFile
            | GeoIpv6File
            | HashedControlPassword
            | HttpTunnelPort
            | OwningControllerProcess
            | RunAsDaemon
            | SocksPort
            | TransPort => true,
            ConnectionPadding
            | DormantClientTimeout
            | DormantOnFirstStartup
            | DormantTimeoutDisabledByIdleStreams
            | HiddenServiceDir
            | Log
            | ReducedConnectionPadding => false,
        }
    }
}

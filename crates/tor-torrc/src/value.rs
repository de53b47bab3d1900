//! Argument values for torrc settings.

use std::fmt::{self, Display};
use std::net::IpAddr;
use std::num::NonZeroU16;
use std::path::PathBuf;

use crate::err::ConfigError;
use crate::hs::HiddenService;

/// A three-state boolean, serialized as `auto`, `1`, or `0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum AutoBool {
    /// Let Tor decide.
    #[display("auto")]
    Auto,
    /// Explicitly enabled.
    #[display("1")]
    On,
    /// Explicitly disabled.
    #[display("0")]
    Off,
}

/// A concrete listener address: an optional host and a nonzero port.
///
/// A bare port (no host) binds the default localhost address; the
/// configuration generator resolves it to an explicit address family when
/// probing availability.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortAddr {
    /// The host part, if one was given.
    host: Option<IpAddr>,
    /// The TCP port.
    port: NonZeroU16,
}

impl PortAddr {
    /// Construct a `PortAddr` from a bare port.
    pub fn port(port: u16) -> Result<Self, ConfigError> {
        let port = NonZeroU16::new(port)
            .ok_or_else(|| ConfigError::illegal("port must be in 1..=65535"))?;
        Ok(PortAddr { host: None, port })
    }

    /// Construct a `PortAddr` with an explicit host.
    pub fn addr(host: IpAddr, port: u16) -> Result<Self, ConfigError> {
        let port = NonZeroU16::new(port)
            .ok_or_else(|| ConfigError::illegal("port must be in 1..=65535"))?;
        Ok(PortAddr {
            host: Some(host),
            port,
        })
    }

    /// Return the host part, if one was given.
    pub fn host(&self) -> Option<IpAddr> {
        self.host
    }

    /// Return the port.
    pub fn value(&self) -> u16 {
        self.port.get()
    }
}

impl Display for PortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(IpAddr::V6(a)) => write!(f, "[{}]:{}", a, self.port),
            Some(IpAddr::V4(a)) => write!(f, "{}:{}", a, self.port),
            None => write!(f, "{}", self.port),
        }
    }
}

/// The argument of a listener-port keyword.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PortArg {
    /// Let Tor pick a port (`auto`).
    Auto,
    /// Turn the listener off (`0`).
    Disable,
    /// Bind a concrete port.
    Addr(PortAddr),
}

impl PortArg {
    /// Construct a concrete port argument from a bare port number.
    pub fn new(port: u16) -> Result<Self, ConfigError> {
        Ok(PortArg::Addr(PortAddr::port(port)?))
    }

    /// Return the concrete address, if this argument is one.
    pub fn as_addr(&self) -> Option<&PortAddr> {
        match self {
            PortArg::Addr(a) => Some(a),
            _ => None,
        }
    }
}

impl Display for PortArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortArg::Auto => write!(f, "auto"),
            PortArg::Disable => write!(f, "0"),
            PortArg::Addr(a) => write!(f, "{}", a),
        }
    }
}

/// A duration with an explicit unit, as Tor's interval options take them.
///
/// Tor rejects zero intervals, so a zero count serializes as `1 <unit>`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Interval {
    /// A count of minutes.
    Minutes(u32),
    /// A count of hours.
    Hours(u32),
    /// A count of days.
    Days(u32),
    /// A count of weeks.
    Weeks(u32),
}

impl Interval {
    /// Return the raw count, before the minimum-of-one rule.
    pub fn count(&self) -> u32 {
        match self {
            Interval::Minutes(n) | Interval::Hours(n) | Interval::Days(n) | Interval::Weeks(n) => {
                *n
            }
        }
    }

    /// Return the unit suffix Tor expects.
    fn unit(&self) -> &'static str {
        match self {
            Interval::Minutes(_) => "minutes",
            Interval::Hours(_) => "hours",
            Interval::Days(_) => "days",
            Interval::Weeks(_) => "weeks",
        }
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count().max(1), self.unit())
    }
}

/// The value carried by a [`Setting`](crate::Setting).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SettingValue {
    /// An on/off boolean.
    Bool(bool),
    /// An auto/on/off boolean.
    AutoBool(AutoBool),
    /// A listener-port argument.
    Port(PortArg),
    /// A unix-socket listener, serialized `unix:"<path>"`.
    UnixSocket(PathBuf),
    /// A file path.
    File(PathBuf),
    /// A directory path.
    Dir(PathBuf),
    /// A free-form identifier or line remainder.
    Ident(String),
    /// A process id.
    Pid(u32),
    /// An interval with unit.
    Interval(Interval),
    /// A hidden-service block.
    HiddenService(HiddenService),
}

impl SettingValue {
    /// Return true if this value collapses to "not set".
    ///
    /// Empty paths and empty identifiers are treated as absent rather than
    /// serialized as empty arguments; a hidden service is absent until it
    /// has both a directory and at least one virtual port.
    pub fn is_absent(&self) -> bool {
        match self {
            SettingValue::UnixSocket(p) | SettingValue::File(p) | SettingValue::Dir(p) => {
                p.as_os_str().is_empty()
            }
            SettingValue::Ident(s) => s.is_empty(),
            SettingValue::HiddenService(hs) => hs.is_absent(),
            _ => false,
        }
    }

    /// A short label for this value's kind, used in error messages.
    pub(crate) fn kind_label(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "Bool",
            SettingValue::AutoBool(_) => "AutoBool",
            SettingValue::Port(_) => "Port",
            SettingValue::UnixSocket(_) => "UnixSocket",
            SettingValue::File(_) => "File",
            SettingValue::Dir(_) => "Dir",
            SettingValue::Ident(_) => "Ident",
            SettingValue::Pid(_) => "Pid",
            SettingValue::Interval(_) => "Interval",
            SettingValue::HiddenService(_) => "HiddenService",
        }
    }

    /// Serialize this value as a torrc argument.
    ///
    /// Hidden services have no single-line argument; they are emitted as
    /// blocks by the snapshot serializer and yield `None` here.
    pub(crate) fn argument(&self) -> Option<String> {
        match self {
            SettingValue::Bool(true) => Some("1".into()),
            SettingValue::Bool(false) => Some("0".into()),
            SettingValue::AutoBool(v) => Some(v.to_string()),
            SettingValue::Port(p) => Some(p.to_string()),
            SettingValue::UnixSocket(p) => Some(format!("unix:\"{}\"", p.display())),
            SettingValue::File(p) | SettingValue::Dir(p) => Some(p.display().to_string()),
            SettingValue::Ident(s) => Some(s.clone()),
            SettingValue::Pid(pid) => Some(pid.to_string()),
            SettingValue::Interval(i) => Some(i.to_string()),
            SettingValue::HiddenService(_) => None,
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

    #[test]
    fn port_args() {
        assert_eq!(PortArg::Auto.to_string(), "auto");
        assert_eq!(PortArg::Disable.to_string(), "0");
        assert_eq!(PortArg::new(9050).unwrap().to_string(), "9050");
        assert!(PortArg::new(0).is_err());

        let v4 = PortAddr::addr("127.0.0.1".parse().unwrap(), 9051).unwrap();
        assert_eq!(v4.to_string(), "127.0.0.1:9051");
        let v6 = PortAddr::addr("::1".parse().unwrap(), 9051).unwrap();
        assert_eq!(v6.to_string(), "[::1]:9051");
    }

    #[test]
    fn zero_interval_serializes_as_one() {
        assert_eq!(Interval::Minutes(0).to_string(), "1 minutes");
        assert_eq!(Interval::Hours(0).to_string(), "1 hours");
        assert_eq!(Interval::Days(3).to_string(), "3 days");
        assert_eq!(Interval::Weeks(0).to_string(), "1 weeks");
    }

    #[test]
    fn absent_values() {
        assert!(SettingValue::File(PathBuf::new()).is_absent());
        assert!(SettingValue::Ident(String::new()).is_absent());
        assert!(!SettingValue::File(PathBuf::from("/x")).is_absent());
        assert!(!SettingValue::Bool(false).is_absent());
    }

    #[test]
    fn unix_socket_argument() {
        let v = SettingValue::UnixSocket(PathBuf::from("/run/tor/socks.sock"));
        assert_eq!(v.argument().unwrap(), "unix:\"/run/tor/socks.sock\"");
    }
}

//! A single torrc setting: keyword, value, and listener flags.

use std::fmt::{self, Display};

use tracing::debug;

use crate::err::ConfigError;
use crate::keyword::{Keyword, ValueKind};
use crate::value::{Interval, SettingValue};

/// An isolation session group, serialized `SessionGroup=<id>`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionGroup(i32);

impl SessionGroup {
    /// Construct a session group; negative ids are rejected.
    pub fn new(id: i32) -> Result<Self, ConfigError> {
        if id < 0 {
            return Err(ConfigError::illegal(format!(
                "SessionGroup id {} must be non-negative",
                id
            )));
        }
        Ok(SessionGroup(id))
    }

    /// Return the group id.
    pub fn id(&self) -> i32 {
        self.0
    }
}

/// A stream-isolation flag accepted by Tor's listener ports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IsolationFlag {
    /// `IsolateClientAddr`
    IsolateClientAddr,
    /// `IsolateSOCKSAuth`
    IsolateSocksAuth,
    /// `IsolateClientProtocol`
    IsolateClientProtocol,
    /// `IsolateDestPort`
    IsolateDestPort,
    /// `IsolateDestAddr`
    IsolateDestAddr,
    /// `KeepAliveIsolateSOCKSAuth`
    KeepAliveIsolateSocksAuth,
    /// `SessionGroup=<id>`
    SessionGroup(SessionGroup),
    /// `OnionTrafficOnly`
    OnionTrafficOnly,
}

impl Display for IsolationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IsolationFlag::*;
        match self {
            IsolateClientAddr => write!(f, "IsolateClientAddr"),
            IsolateSocksAuth => write!(f, "IsolateSOCKSAuth"),
            IsolateClientProtocol => write!(f, "IsolateClientProtocol"),
            IsolateDestPort => write!(f, "IsolateDestPort"),
            IsolateDestAddr => write!(f, "IsolateDestAddr"),
            KeepAliveIsolateSocksAuth => write!(f, "KeepAliveIsolateSOCKSAuth"),
            SessionGroup(g) => write!(f, "SessionGroup={}", g.id()),
            OnionTrafficOnly => write!(f, "OnionTrafficOnly"),
        }
    }
}

/// A filesystem flag accepted by Tor's unix-socket listeners.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocketFlag {
    /// `GroupWritable`
    GroupWritable,
    /// `WorldWritable`
    WorldWritable,
    /// `RelaxDirModeCheck`
    RelaxDirModeCheck,
}

impl Display for SocketFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketFlag::GroupWritable => write!(f, "GroupWritable"),
            SocketFlag::WorldWritable => write!(f, "WorldWritable"),
            SocketFlag::RelaxDirModeCheck => write!(f, "RelaxDirModeCheck"),
        }
    }
}

/// One torrc setting.
///
/// Settings compare equal by keyword, with two exceptions from the
/// configuration model: two port settings with concrete values are equal
/// iff their ports are equal (so that one TCP port cannot be bound under
/// two keywords), and hidden services are equal iff their directories are.
#[derive(Clone, Debug, Eq)]
pub struct Setting {
    /// The keyword.
    keyword: Keyword,
    /// The argument value.
    value: SettingValue,
    /// Socket flags, written after the argument.
    flags: Vec<SocketFlag>,
    /// Isolation flags, written after the socket flags.
    isolation: Vec<IsolationFlag>,
    /// True if this setting was injected by the generator's defaults
    /// rather than by user configuration.
    from_default: bool,
}

impl PartialEq for Setting {
    fn eq(&self, other: &Self) -> bool {
        match (&self.value, &other.value) {
            (SettingValue::HiddenService(a), SettingValue::HiddenService(b)) => a == b,
            (SettingValue::Port(a), SettingValue::Port(b)) => {
                match (a.as_addr(), b.as_addr()) {
                    // Concrete ports collide across keywords.
                    (Some(pa), Some(pb)) => pa.value() == pb.value(),
                    _ => self.keyword == other.keyword,
                }
            }
            _ => self.keyword == other.keyword,
        }
    }
}

impl Setting {
    /// Construct a setting, checking the value kind against the keyword.
    pub fn new(keyword: Keyword, value: SettingValue) -> Result<Self, ConfigError> {
        let value = match (keyword.expects(), value) {
            (ValueKind::Port, v @ SettingValue::Port(_)) => v,
            (ValueKind::Port, v @ SettingValue::UnixSocket(_)) if keyword.supports_unix_socket() => {
                v
            }
            (ValueKind::Interval, SettingValue::Interval(iv)) => {
                SettingValue::Interval(coerce_interval(keyword, iv))
            }
            (expected, v) if kind_matches(expected, &v) => v,
            (_, v) => {
                return Err(ConfigError::WrongValueKind {
                    keyword,
                    given: v.kind_label(),
                });
            }
        };
        Ok(Setting {
            keyword,
            value,
            flags: Vec::new(),
            isolation: Vec::new(),
            from_default: false,
        })
    }

    /// Append a socket flag.
    pub fn socket_flag(mut self, flag: SocketFlag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    /// Append an isolation flag.
    ///
    /// At most one `SessionGroup` is kept per setting; a new group id
    /// replaces the old one.
    pub fn isolation_flag(mut self, flag: IsolationFlag) -> Self {
        if let IsolationFlag::SessionGroup(new) = &flag {
            if let Some(pos) = self
                .isolation
                .iter()
                .position(|f| matches!(f, IsolationFlag::SessionGroup(_)))
            {
                debug!(
                    "replacing SessionGroup on {} with id {}",
                    self.keyword,
                    new.id()
                );
                self.isolation.remove(pos);
            }
        } else if self.isolation.contains(&flag) {
            return self;
        }
        self.isolation.push(flag);
        self
    }

    /// Rebuild this setting around a different value, keeping its
    /// keyword, flags, and provenance.
    ///
    /// The new value is checked against the keyword like
    /// [`new`](Setting::new) does.
    pub fn with_value(self, value: SettingValue) -> Result<Self, ConfigError> {
        let mut replacement = Setting::new(self.keyword, value)?;
        replacement.flags = self.flags;
        replacement.isolation = self.isolation;
        replacement.from_default = self.from_default;
        Ok(replacement)
    }

    /// Mark this setting as generator-injected.
    pub fn mark_default(mut self) -> Self {
        self.from_default = true;
        self
    }

    /// The setting's keyword.
    pub fn keyword(&self) -> Keyword {
        self.keyword
    }

    /// The setting's value.
    pub fn value(&self) -> &SettingValue {
        &self.value
    }

    /// The setting's socket flags.
    pub fn flags(&self) -> &[SocketFlag] {
        &self.flags
    }

    /// The setting's isolation flags.
    pub fn isolation(&self) -> &[IsolationFlag] {
        &self.isolation
    }

    /// True if this setting came from the generator's defaults.
    pub fn is_from_default(&self) -> bool {
        self.from_default
    }

    /// Serialize the argument portion of this setting's line: the value
    /// followed by socket flags and isolation flags, in that order.
    ///
    /// Hidden services serialize as blocks instead and yield `None`.
    pub(crate) fn argument(&self) -> Option<String> {
        let mut arg = self.value.argument()?;
        for flag in &self.flags {
            arg.push(' ');
            arg.push_str(&flag.to_string());
        }
        for flag in &self.isolation {
            arg.push(' ');
            arg.push_str(&flag.to_string());
        }
        Some(arg)
    }
}

/// True if `value` is acceptable for a keyword expecting `kind`.
fn kind_matches(kind: ValueKind, value: &SettingValue) -> bool {
    matches!(
        (kind, value),
        (ValueKind::Bool, SettingValue::Bool(_))
            | (ValueKind::AutoBool, SettingValue::AutoBool(_))
            | (ValueKind::File, SettingValue::File(_))
            | (ValueKind::Dir, SettingValue::Dir(_))
            | (ValueKind::Ident, SettingValue::Ident(_))
            | (ValueKind::Pid, SettingValue::Pid(_))
            | (ValueKind::Interval, SettingValue::Interval(_))
            | (ValueKind::HiddenService, SettingValue::HiddenService(_))
    )
}

/// Apply per-keyword interval floors.
///
/// Tor silently treats `DormantClientTimeout` values under ten minutes as
/// ten minutes; we make the coercion explicit so the serialized config
/// matches what the daemon will actually do.
fn coerce_interval(keyword: Keyword, interval: Interval) -> Interval {
    match (keyword, interval) {
        (Keyword::DormantClientTimeout, Interval::Minutes(m)) if m < 10 => Interval::Minutes(10),
        (_, iv) => iv,
    }
}

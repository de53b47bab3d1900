//! Hidden-service configuration blocks.
//!
//! A hidden service is declared in torrc as a `HiddenServiceDir` line
//! followed by the lines that belong to that directory. The whole block is
//! modeled as one aggregate value so that the serializer can keep its lines
//! together and in order.

use std::num::NonZeroU16;
use std::path::{Path, PathBuf};

use crate::err::ConfigError;

/// A limit on concurrent streams per circuit for a hidden service.
///
/// Tor accepts 0..=65535; 0 means unlimited.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MaxStreams(u16);

impl MaxStreams {
    /// Construct a stream limit, rejecting out-of-range values.
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        u16::try_from(value)
            .map(MaxStreams)
            .map_err(|_| ConfigError::illegal(format!("MaxStreams {} out of range 0..=65535", value)))
    }

    /// Return the raw limit.
    pub fn get(&self) -> u16 {
        self.0
    }
}

/// One port mapping of a hidden service.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum VirtualPort {
    /// Forward `virt` to a TCP port on localhost.
    Tcp {
        /// The port exposed on the onion address.
        virt: NonZeroU16,
        /// The local target port; defaults to `virt` when absent.
        target: Option<NonZeroU16>,
    },
    /// Forward `virt` to a unix socket. Only meaningful on unix platforms.
    Unix {
        /// The port exposed on the onion address.
        virt: NonZeroU16,
        /// The unix socket receiving the traffic.
        target: PathBuf,
    },
}

impl VirtualPort {
    /// Construct a TCP port mapping.
    pub fn tcp(virt: u16, target: Option<u16>) -> Result<Self, ConfigError> {
        let virt = nonzero(virt)?;
        let target = target.map(nonzero).transpose()?;
        Ok(VirtualPort::Tcp { virt, target })
    }

    /// Construct a unix-socket port mapping.
    pub fn unix(virt: u16, target: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Ok(VirtualPort::Unix {
            virt: nonzero(virt)?,
            target: target.into(),
        })
    }

    /// The port exposed on the onion address.
    pub fn virt(&self) -> u16 {
        match self {
            VirtualPort::Tcp { virt, .. } | VirtualPort::Unix { virt, .. } => virt.get(),
        }
    }

    /// Serialize the target half of a `HiddenServicePort` line.
    pub(crate) fn target_argument(&self) -> String {
        match self {
            VirtualPort::Tcp { virt, target } => {
                format!("127.0.0.1:{}", target.unwrap_or(*virt))
            }
            VirtualPort::Unix { target, .. } => format!("unix:\"{}\"", target.display()),
        }
    }
}

/// Checked conversion to a nonzero port.
fn nonzero(port: u16) -> Result<NonZeroU16, ConfigError> {
    NonZeroU16::new(port).ok_or_else(|| ConfigError::illegal("port must be in 1..=65535"))
}

/// A complete hidden-service declaration.
///
/// Two hidden services are the same setting iff they share a directory.
#[derive(Clone, Debug, Eq)]
pub struct HiddenService {
    /// The service directory (`HiddenServiceDir`).
    dir: PathBuf,
    /// Port mappings, deduplicated by virtual port.
    ports: Vec<VirtualPort>,
    /// Stream limit, if configured.
    max_streams: Option<MaxStreams>,
    /// Whether exceeding the stream limit closes the circuit.
    max_streams_close_circuit: Option<bool>,
}

impl PartialEq for HiddenService {
    fn eq(&self, other: &Self) -> bool {
        self.dir == other.dir
    }
}

impl HiddenService {
    /// Begin building a hidden service rooted at `dir`.
    pub fn builder(dir: impl Into<PathBuf>) -> HiddenServiceBuilder {
        HiddenServiceBuilder {
            hs: HiddenService {
                dir: dir.into(),
                ports: Vec::new(),
                max_streams: None,
                max_streams_close_circuit: None,
            },
        }
    }

    /// The service directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The configured port mappings.
    pub fn ports(&self) -> &[VirtualPort] {
        &self.ports
    }

    /// True if this block would not be emitted: a service needs both a
    /// directory and at least one port mapping.
    pub fn is_absent(&self) -> bool {
        self.dir.as_os_str().is_empty() || self.ports.is_empty()
    }

    /// Append this block's torrc lines to `out`.
    pub(crate) fn write_block(&self, out: &mut String) {
        out.push_str(&format!("HiddenServiceDir {}\n", self.dir.display()));
        for port in &self.ports {
            out.push_str(&format!(
                "HiddenServicePort {} {}\n",
                port.virt(),
                port.target_argument()
            ));
        }
        if self.max_streams.is_some() || self.max_streams_close_circuit.is_some() {
            let streams = self.max_streams.map(|m| m.get()).unwrap_or(0);
            let close = self.max_streams_close_circuit.unwrap_or(false);
            out.push_str(&format!("HiddenServiceMaxStreams {}\n", streams));
            out.push_str(&format!(
                "HiddenServiceMaxStreamsCloseCircuit {}\n",
                u8::from(close)
            ));
        }
    }
}

/// Builder for a [`HiddenService`].
#[derive(Clone, Debug)]
pub struct HiddenServiceBuilder {
    /// The service under construction.
    hs: HiddenService,
}

impl HiddenServiceBuilder {
    /// Add a port mapping.
    ///
    /// A mapping with the same virtual port as an existing one replaces it.
    /// Unix-socket mappings are dropped on platforms without unix sockets.
    pub fn port(mut self, port: VirtualPort) -> Self {
        if cfg!(not(unix)) {
            if let VirtualPort::Unix { virt, .. } = &port {
                tracing::debug!(
                    "dropping unix-socket mapping for virtual port {}: no unix sockets on this platform",
                    virt
                );
                return self;
            }
        }
        self.hs.ports.retain(|p| p.virt() != port.virt());
        self.hs.ports.push(port);
        self
    }

    /// Set the stream limit.
    pub fn max_streams(mut self, limit: MaxStreams) -> Self {
        self.hs.max_streams = Some(limit);
        self
    }

    /// Set whether exceeding the stream limit closes the whole circuit.
    pub fn max_streams_close_circuit(mut self, close: bool) -> Self {
        self.hs.max_streams_close_circuit = Some(close);
        self
    }

    /// Finish building.
    pub fn build(self) -> HiddenService {
        self.hs
    }
}

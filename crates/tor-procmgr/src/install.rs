//! The resource-installer seam.
//!
//! Installing a Tor binary (extracting it from an asset bundle, checking
//! hashes, unpacking geoip databases) is someone else's job; the
//! supervisor only needs the resulting paths.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::env::TorEnv;

/// Where the installed resources ended up.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct InstallPaths {
    /// The tor executable.
    pub tor: PathBuf,
    /// The IPv4 geoip database, if installed.
    pub geoip: Option<PathBuf>,
    /// The IPv6 geoip database, if installed.
    pub geoip6: Option<PathBuf>,
}

/// The installer failed.
#[derive(Clone, Debug, thiserror::Error)]
#[error("resource installation failed")]
pub struct InstallError(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>);

impl InstallError {
    /// Wrap an installer's own error type.
    pub fn new(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        InstallError(Arc::new(e))
    }
}

/// Installs (or locates) the Tor daemon's resources for an environment.
#[async_trait]
pub trait ResourceInstaller: Send + Sync {
    /// Make the resources available, returning their paths.
    ///
    /// Called on every start; implementations are expected to be
    /// idempotent.
    async fn install(&self, env: &TorEnv) -> Result<InstallPaths, InstallError>;
}

/// An installer for a Tor that is already on disk.
///
/// Useful for embedders that ship their own binary, and for tests.
#[derive(Clone, Debug)]
pub struct ProvidedTor {
    /// The paths handed back verbatim.
    paths: InstallPaths,
}

impl ProvidedTor {
    /// Wrap an existing tor executable.
    pub fn new(tor: impl Into<PathBuf>) -> Self {
        ProvidedTor {
            paths: InstallPaths {
                tor: tor.into(),
                geoip: None,
                geoip6: None,
            },
        }
    }

    /// Also hand out geoip databases.
    pub fn with_geoip(mut self, geoip: impl Into<PathBuf>, geoip6: impl Into<PathBuf>) -> Self {
        self.paths.geoip = Some(geoip.into());
        self.paths.geoip6 = Some(geoip6.into());
        self
    }
}

#[async_trait]
impl ResourceInstaller for ProvidedTor {
    async fn install(&self, _env: &TorEnv) -> Result<InstallPaths, InstallError> {
        if !self.paths.tor.exists() {
            return Err(InstallError::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no tor executable at {}", self.paths.tor.display()),
            )));
        }
        Ok(self.paths.clone())
    }
}

//! Combining user configuration with environment defaults.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use tor_torrc::{Keyword, PortArg, Setting, SettingValue, Torrc, TorrcBuilder};

use crate::env::TorEnv;
use crate::err::ProcError;
use crate::install::{InstallPaths, ResourceInstaller};
use crate::localhost;
use crate::probe::{PortProbe, TcpPortProbe};

/// A user configuration hook, applied to the builder in registration
/// order.
type ConfigHook = Arc<dyn Fn(&mut TorrcBuilder) + Send + Sync + 'static>;

/// Synthesizes the torrc for one environment.
///
/// The generator owns no environment itself; the same generator can be
/// reused across restarts, and ports are re-probed every time because
/// availability changes between runs.
#[derive(Clone)]
pub struct ConfigGenerator {
    /// User hooks, in registration order.
    hooks: Vec<ConfigHook>,
    /// The availability probe for concrete listener ports.
    probe: Arc<dyn PortProbe>,
    /// Skip the GeoIP file defaults entirely.
    omit_geoip: bool,
    /// Allow replacing unavailable concrete ports with `auto`.
    allow_reassign: bool,
}

impl Default for ConfigGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigGenerator {
    /// A generator with no user configuration and the default probe.
    pub fn new() -> Self {
        ConfigGenerator {
            hooks: Vec::new(),
            probe: Arc::new(TcpPortProbe),
            omit_geoip: false,
            allow_reassign: true,
        }
    }

    /// Register a configuration hook. Hooks run in registration order.
    pub fn config_hook(mut self, hook: impl Fn(&mut TorrcBuilder) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Skip the GeoIP defaults (for environments without the databases).
    pub fn omit_geoip(mut self, omit: bool) -> Self {
        self.omit_geoip = omit;
        self
    }

    /// Allow or forbid reassigning unavailable ports to `auto`.
    pub fn allow_port_reassignment(mut self, allow: bool) -> Self {
        self.allow_reassign = allow;
        self
    }

    /// Substitute the availability probe.
    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Produce the configuration for one start attempt.
    pub async fn generate(
        &self,
        env: &TorEnv,
        installer: &dyn ResourceInstaller,
    ) -> Result<(Torrc, InstallPaths), ProcError> {
        let paths = installer.install(env).await?;
        localhost::refresh().await;

        let mut builder = TorrcBuilder::new();
        for hook in &self.hooks {
            hook(&mut builder);
        }
        self.apply_defaults(&mut builder, env, &paths)?;
        if self.allow_reassign {
            self.reassign_unavailable(&mut builder).await?;
        }
        Ok((builder.build(), paths))
    }

    /// Fill in everything the supervisor relies on, deferring to any
    /// user-supplied setting.
    fn apply_defaults(
        &self,
        b: &mut TorrcBuilder,
        env: &TorEnv,
        paths: &InstallPaths,
    ) -> Result<(), ProcError> {
        use Keyword::*;
        use SettingValue::*;

        if !self.omit_geoip {
            if let Some(geoip) = &paths.geoip {
                b.put_if_absent(Setting::new(GeoIpFile, File(geoip.clone()))?.mark_default());
            }
            if let Some(geoip6) = &paths.geoip6 {
                b.put_if_absent(Setting::new(GeoIpv6File, File(geoip6.clone()))?.mark_default());
            }
        }

        b.put_if_absent(Setting::new(DataDirectory, Dir(env.data_dir()))?.mark_default());
        b.put_if_absent(Setting::new(CacheDirectory, Dir(env.cache_dir().to_owned()))?.mark_default());
        b.put_if_absent(
            Setting::new(ControlPortWriteToFile, File(env.control_port_file()))?.mark_default(),
        );

        // Cookie authentication is the default, but never fights a
        // user-provided authentication story.
        if !b.contains(CookieAuthentication) && !b.contains(HashedControlPassword) {
            b.put(Setting::new(CookieAuthentication, Bool(true))?.mark_default());
        }
        let cookie_on = matches!(
            b.get(CookieAuthentication).map(|s| s.value()),
            Some(&Bool(true))
        );
        if cookie_on {
            b.put_if_absent(
                Setting::new(CookieAuthFile, File(env.cookie_auth_file()))?.mark_default(),
            );
        }

        b.put_if_absent(
            Setting::new(SocksPort, Port(PortArg::new(9050)?))?.mark_default(),
        );
        if !b.contains(ControlPort) {
            let value = if cfg!(unix) {
                UnixSocket(env.control_socket())
            } else {
                Port(PortArg::Auto)
            };
            b.put(Setting::new(ControlPort, value)?.mark_default());
        }

        b.put_if_absent(Setting::new(DisableNetwork, Bool(true))?.mark_default());
        b.put_if_absent(Setting::new(RunAsDaemon, Bool(false))?.mark_default());
        b.put_if_absent(
            Setting::new(OwningControllerProcess, Pid(std::process::id()))?.mark_default(),
        );
        b.put_if_absent(
            Setting::new(DormantCanceledByStartup, Bool(true))?.mark_default(),
        );
        Ok(())
    }

    /// Probe every reassignable concrete port; swap unavailable ones for
    /// `auto`.
    async fn reassign_unavailable(&self, b: &mut TorrcBuilder) -> Result<(), ProcError> {
        let mut unavailable: Vec<(Keyword, u16)> = Vec::new();
        for setting in b.settings() {
            if !setting.keyword().allows_port_reassign() {
                continue;
            }
            let SettingValue::Port(PortArg::Addr(addr)) = setting.value() else {
                continue;
            };
            // A bare port binds localhost; pick the cached address of the
            // right family.
            let host = match addr.host() {
                Some(IpAddr::V6(_)) => localhost::ipv6(),
                Some(IpAddr::V4(_)) | None => localhost::ipv4(),
            };
            let available = self
                .probe
                .is_available(host, addr.value())
                .await
                .map_err(ProcError::io)?;
            if available {
                debug!("{} {} is available", setting.keyword(), addr.value());
            } else {
                warn!(
                    "UNAVAILABLE_PORT[{}] {} reassigned to 'auto'",
                    setting.keyword(),
                    addr.value()
                );
                unavailable.push((setting.keyword(), addr.value()));
            }
        }
        for (keyword, port) in unavailable {
            b.replace_where(
                |s| {
                    s.keyword() == keyword
                        && matches!(s.value(),
                            SettingValue::Port(PortArg::Addr(a)) if a.value() == port)
                },
                |s| {
                    s.clone()
                        .with_value(SettingValue::Port(PortArg::Auto))
                        .unwrap_or(s)
                },
            );
        }
        Ok(())
    }
}

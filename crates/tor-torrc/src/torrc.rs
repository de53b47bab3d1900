//! The mutable builder and the committed, immutable snapshot.

use std::collections::HashSet;

use tracing::debug;

use crate::keyword::Keyword;
use crate::setting::Setting;
use crate::value::{PortArg, SettingValue};

/// Serialization class of a setting; classes order the output.
///
/// Listener ports come first, then unix-socket listeners, then everything
/// else; within a class, keywords sort lexicographically.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Class {
    /// TCP listener ports (including `auto` and disabled ones).
    Ports,
    /// Unix-socket listeners.
    UnixSockets,
    /// All remaining keywords.
    Other,
}

/// Classify a setting for output ordering.
fn class_of(setting: &Setting) -> Class {
    match setting.value() {
        SettingValue::Port(_) => Class::Ports,
        SettingValue::UnixSocket(_) => Class::UnixSockets,
        _ => Class::Other,
    }
}

/// Accumulates settings before committing them to a [`Torrc`] snapshot.
///
/// The builder is the only mutable surface of the configuration model:
/// once [`build`](TorrcBuilder::build) runs, the snapshot cannot change.
#[derive(Clone, Debug, Default)]
pub struct TorrcBuilder {
    /// Settings in insertion order; deduplicated on insert.
    settings: Vec<Setting>,
}

impl TorrcBuilder {
    /// Return a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a setting, replacing any setting equal to it.
    ///
    /// Inserting a setting whose value is absent (an empty path, an empty
    /// identifier, a hidden service without ports) removes the equal
    /// setting instead: absent values collapse to "not set".
    ///
    /// Transparent-proxy ports only exist on Linux; on other platforms a
    /// `__TransPort` insert is dropped.
    pub fn put(&mut self, setting: Setting) -> &mut Self {
        if setting.keyword() == Keyword::TransPort && cfg!(not(target_os = "linux")) {
            debug!("dropping __TransPort: transparent proxying is Linux-only");
            return self;
        }
        let existing = self.settings.iter().position(|s| *s == setting);
        if setting.value().is_absent() {
            if let Some(pos) = existing {
                self.settings.remove(pos);
            }
            return self;
        }
        match existing {
            Some(pos) => self.settings[pos] = setting,
            None => self.settings.push(setting),
        }
        self
    }

    /// Insert a setting only if nothing equal to it is already present.
    pub fn put_if_absent(&mut self, setting: Setting) -> &mut Self {
        if setting.value().is_absent() {
            return self;
        }
        if !self.settings.iter().any(|s| *s == setting) {
            self.settings.push(setting);
        }
        self
    }

    /// Return true if any setting with `keyword` is present.
    pub fn contains(&self, keyword: Keyword) -> bool {
        self.settings.iter().any(|s| s.keyword() == keyword)
    }

    /// Return the first setting with `keyword`, if any.
    pub fn get(&self, keyword: Keyword) -> Option<&Setting> {
        self.settings.iter().find(|s| s.keyword() == keyword)
    }

    /// Return all accumulated settings, in insertion order.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Replace the settings matched by `predicate` using `replace`.
    ///
    /// Used by the configuration generator to swap unavailable concrete
    /// ports for `auto` without disturbing anything else.
    pub fn replace_where(
        &mut self,
        mut predicate: impl FnMut(&Setting) -> bool,
        mut replace: impl FnMut(Setting) -> Setting,
    ) -> &mut Self {
        for slot in self.settings.iter_mut() {
            if predicate(slot) {
                let taken = slot.clone();
                *slot = replace(taken);
            }
        }
        self
    }

    /// Commit the accumulated settings into an immutable snapshot.
    pub fn build(self) -> Torrc {
        let mut settings = self.settings;

        // A disabled port keyword swallows every other setting that shares
        // its keyword; only the Disable-valued settings stay committed.
        let disabled: HashSet<Keyword> = settings
            .iter()
            .filter(|s| matches!(s.value(), SettingValue::Port(PortArg::Disable)))
            .map(|s| s.keyword())
            .collect();
        settings.retain(|s| match s.value() {
            SettingValue::Port(arg) if disabled.contains(&s.keyword()) => {
                matches!(arg, PortArg::Disable)
            }
            _ => true,
        });

        settings.sort_by(|a, b| {
            (class_of(a), a.keyword().as_str()).cmp(&(class_of(b), b.keyword().as_str()))
        });

        let text = serialize(&settings, &disabled);
        Torrc { settings, text }
    }
}

/// Render the ordered settings as torrc text.
fn serialize(settings: &[Setting], disabled: &HashSet<Keyword>) -> String {
    let mut out = String::new();
    let mut written_disabled: HashSet<Keyword> = HashSet::new();
    let mut prev_was_hs = false;

    for setting in settings {
        if let SettingValue::HiddenService(hs) = setting.value() {
            if !out.is_empty() && !prev_was_hs {
                out.push('\n');
            }
            hs.write_block(&mut out);
            prev_was_hs = true;
            continue;
        }
        prev_was_hs = false;

        if disabled.contains(&setting.keyword()) {
            // Exactly one `<Keyword> 0` line, regardless of how many
            // Disable-valued settings share the keyword.
            if written_disabled.insert(setting.keyword()) {
                out.push_str(setting.keyword().as_str());
                out.push_str(" 0\n");
            }
            continue;
        }

        if let Some(arg) = setting.argument() {
            out.push_str(setting.keyword().as_str());
            out.push(' ');
            out.push_str(&arg);
            out.push('\n');
        }
    }
    out
}

/// An immutable torrc snapshot: the committed settings plus their
/// canonical serialization.
///
/// Two snapshots are equal iff their texts are equal.
#[derive(Clone, Debug, Eq)]
pub struct Torrc {
    /// The committed settings, in output order.
    settings: Vec<Setting>,
    /// The canonical serialization.
    text: String,
}

impl PartialEq for Torrc {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Torrc {
    /// The canonical torrc text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The committed settings, in output order.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Return the command-line argument list for the settings whose
    /// keywords are start-time arguments: `--<keyword> <argument>` pairs.
    pub fn start_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for setting in &self.settings {
            if !setting.keyword().is_start_argument() {
                continue;
            }
            let Some(arg) = setting.argument() else {
                continue;
            };
            args.push(format!("--{}", setting.keyword().as_str()));
            args.push(arg);
        }
        args
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
    use crate::hs::{HiddenService, MaxStreams, VirtualPort};
    use crate::value::{PortArg, SettingValue};

    fn port(kw: Keyword, arg: PortArg) -> Setting {
        Setting::new(kw, SettingValue::Port(arg)).unwrap()
    }

    #[test]
    fn ports_before_unix_sockets_before_others() {
        let mut b = TorrcBuilder::new();
        b.put(Setting::new(Keyword::DataDirectory, SettingValue::Dir("/d".into())).unwrap())
            .put(
                Setting::new(
                    Keyword::ControlPort,
                    SettingValue::UnixSocket("/run/control.sock".into()),
                )
                .unwrap(),
            )
            .put(port(Keyword::SocksPort, PortArg::new(9050).unwrap()))
            .put(port(Keyword::DnsPort, PortArg::Auto));
        let torrc = b.build();
        assert_eq!(
            torrc.text(),
            "__DNSPort auto\n\
             __SocksPort 9050\n\
             __ControlPort unix:\"/run/control.sock\"\n\
             DataDirectory /d\n"
        );
    }

    #[test]
    fn disabled_port_collapses_to_single_zero_line() {
        let mut b = TorrcBuilder::new();
        b.put(port(Keyword::DnsPort, PortArg::new(5353).unwrap()))
            .put(port(Keyword::DnsPort, PortArg::Disable))
            .put(port(Keyword::SocksPort, PortArg::new(9050).unwrap()));
        let torrc = b.build();
        assert_eq!(torrc.text(), "__DNSPort 0\n__SocksPort 9050\n");
        // The Disable-valued setting stays committed; the concrete one is
        // dropped from the snapshot.
        assert_eq!(
            torrc
                .settings()
                .iter()
                .filter(|s| s.keyword() == Keyword::DnsPort)
                .count(),
            1
        );
        assert!(matches!(
            torrc
                .settings()
                .iter()
                .find(|s| s.keyword() == Keyword::DnsPort)
                .unwrap()
                .value(),
            SettingValue::Port(PortArg::Disable)
        ));
    }

    #[test]
    fn absent_value_clears_setting() {
        let mut b = TorrcBuilder::new();
        b.put(Setting::new(Keyword::GeoIpFile, SettingValue::File("/g".into())).unwrap());
        assert!(b.contains(Keyword::GeoIpFile));
        b.put(Setting::new(Keyword::GeoIpFile, SettingValue::File("".into())).unwrap());
        assert!(!b.contains(Keyword::GeoIpFile));
    }

    #[test]
    fn equal_port_replaces_across_keywords() {
        let mut b = TorrcBuilder::new();
        b.put(port(Keyword::SocksPort, PortArg::new(9050).unwrap()))
            .put(port(Keyword::DnsPort, PortArg::new(9050).unwrap()));
        let torrc = b.build();
        // One concrete binding of 9050 survives.
        assert_eq!(torrc.text(), "__DNSPort 9050\n");
    }

    #[test]
    fn put_if_absent_defers_to_user_settings() {
        let mut b = TorrcBuilder::new();
        b.put(Setting::new(Keyword::RunAsDaemon, SettingValue::Bool(true)).unwrap());
        b.put_if_absent(
            Setting::new(Keyword::RunAsDaemon, SettingValue::Bool(false))
                .unwrap()
                .mark_default(),
        );
        let torrc = b.build();
        assert_eq!(torrc.text(), "RunAsDaemon 1\n");
    }

    #[cfg(unix)]
    #[test]
    fn hidden_service_blocks_and_blank_lines() {
        let hs1 = HiddenService::builder("/hs1")
            .port(VirtualPort::tcp(80, Some(8080)).unwrap())
            .port(VirtualPort::unix(443, "/hs1/hs.sock").unwrap())
            .max_streams(MaxStreams::new(2).unwrap())
            .build();
        let hs2 = HiddenService::builder("/hs2")
            .port(VirtualPort::tcp(80, None).unwrap())
            .build();
        let mut b = TorrcBuilder::new();
        b.put(Setting::new(Keyword::DataDirectory, SettingValue::Dir("/d".into())).unwrap())
            .put(Setting::new(Keyword::HiddenServiceDir, SettingValue::HiddenService(hs1)).unwrap())
            .put(Setting::new(Keyword::HiddenServiceDir, SettingValue::HiddenService(hs2)).unwrap());
        let torrc = b.build();
        assert_eq!(
            torrc.text(),
            "DataDirectory /d\n\
             \n\
             HiddenServiceDir /hs1\n\
             HiddenServicePort 80 127.0.0.1:8080\n\
             HiddenServicePort 443 unix:\"/hs1/hs.sock\"\n\
             HiddenServiceMaxStreams 2\n\
             HiddenServiceMaxStreamsCloseCircuit 0\n\
             HiddenServiceDir /hs2\n\
             HiddenServicePort 80 127.0.0.1:80\n"
        );
    }

    #[test]
    fn snapshot_equality_is_by_text() {
        let mut a = TorrcBuilder::new();
        a.put(port(Keyword::SocksPort, PortArg::Auto));
        let mut b = TorrcBuilder::new();
        b.put(port(Keyword::SocksPort, PortArg::Auto));
        assert_eq!(a.build(), b.build());
    }

    #[test]
    fn start_args_cover_start_keywords_only() {
        let mut b = TorrcBuilder::new();
        b.put(Setting::new(Keyword::DataDirectory, SettingValue::Dir("/d".into())).unwrap())
            .put(port(Keyword::SocksPort, PortArg::Auto))
            .put(
                Setting::new(Keyword::Log, SettingValue::Ident("notice stdout".into())).unwrap(),
            );
        let torrc = b.build();
        let args = torrc.start_args();
        assert_eq!(
            args,
            vec![
                "--__SocksPort".to_string(),
                "auto".to_string(),
                "--DataDirectory".to_string(),
                "/d".to_string(),
            ]
        );
    }

    #[test]
    fn round_trip_modulo_ordering() {
        let mut b = TorrcBuilder::new();
        b.put(port(Keyword::SocksPort, PortArg::new(9050).unwrap()))
            .put(Setting::new(Keyword::DataDirectory, SettingValue::Dir("/d".into())).unwrap())
            .put(Setting::new(Keyword::DisableNetwork, SettingValue::Bool(true)).unwrap());
        let torrc = b.build();

        // Every non-blank serialized line is `<keyword> <argument>`, and
        // re-rendering the committed settings reproduces exactly those
        // lines.
        let mut serialized: Vec<&str> = torrc.text().lines().filter(|l| !l.is_empty()).collect();
        let mut rendered: Vec<String> = torrc
            .settings()
            .iter()
            .map(|s| format!("{} {}", s.keyword().as_str(), s.argument().unwrap()))
            .collect();
        serialized.sort_unstable();
        rendered.sort_unstable();
        assert_eq!(serialized, rendered);
    }
}

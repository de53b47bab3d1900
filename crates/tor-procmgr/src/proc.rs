//! Spawning the daemon and discovering its control endpoint.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use tor_ctrlconn::CtrlEndpoint;
use tor_ctrlproto::{Auth, CtrlCommand};
use tor_torrc::{Keyword, SettingValue, Torrc};

use crate::ctrlfile::parse_control_port_file;
use crate::env::{create_dir_700, create_file_600, Fid, TorEnv};
use crate::err::ProcError;
use crate::feed::{drain_stderr, StdoutFeed};
use crate::generate::ConfigGenerator;
use crate::install::ResourceInstaller;
use crate::ProcessLogSink;

/// Minimum pause between stopping one daemon and starting the next for
/// the same environment.
const INTER_RUN_DELAY: Duration = Duration::from_millis(500);

/// Granularity of the inter-run wait and of the file polls.
const POLL_TICK: Duration = Duration::from_millis(50);

/// How long after spawn an exit still counts as "exited early".
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(250);

/// Budget for the control-port file to appear and parse.
const CTRL_FILE_TIMEOUT: Duration = Duration::from_secs(3);

/// Budget for the cookie file, counted once stdout shows real progress.
const COOKIE_TIMEOUT: Duration = Duration::from_secs(1);

/// The cookie budget only starts after this many stdout lines.
const COOKIE_MIN_STDOUT_LINES: usize = 5;

/// Hard cap on the cookie wait, independent of stdout progress.
const COOKIE_OVERALL_CAP: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Daemon lifecycle notifications published by the supervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProcStatus {
    /// A start attempt began.
    Starting,
    /// The daemon is gone (start failed, or a stop completed).
    Off,
}

/// A sink for [`ProcStatus`] notifications.
type StatusSink = Arc<dyn Fn(ProcStatus) + Send + Sync + 'static>;

/// Internals of a [`TorChild`].
struct ChildInner {
    /// The OS process id at spawn time.
    pid: Option<u32>,
    /// The child handle; `None` once reaped.
    child: tokio::sync::Mutex<Option<Child>>,
    /// The recorded exit status, once known.
    exit: Mutex<Option<std::process::ExitStatus>>,
}

/// A handle on the running daemon process.
///
/// Clones share the same process; reaping through any clone is visible
/// to all.
#[derive(Clone)]
pub struct TorChild {
    /// Shared process state.
    inner: Arc<ChildInner>,
}

impl fmt::Debug for TorChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TorChild(pid={:?})", self.inner.pid)
    }
}

impl TorChild {
    /// Wrap a freshly spawned child.
    fn new(child: Child) -> Self {
        TorChild {
            inner: Arc::new(ChildInner {
                pid: child.id(),
                child: tokio::sync::Mutex::new(Some(child)),
                exit: Mutex::new(None),
            }),
        }
    }

    /// The daemon's process id, if it was still running at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// The recorded exit status, if the process has been reaped.
    pub fn exit_status(&self) -> Option<std::process::ExitStatus> {
        *self.inner.exit.lock().expect("poisoned lock")
    }

    /// Non-blocking exit check; records and returns the status if the
    /// process is gone.
    pub async fn try_exit(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.inner.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return self.exit_status();
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                *self.inner.exit.lock().expect("poisoned lock") = Some(status);
                *guard = None;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("try_wait on tor failed: {}", e);
                None
            }
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.inner.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return self.exit_status();
        };
        match child.wait().await {
            Ok(status) => {
                *self.inner.exit.lock().expect("poisoned lock") = Some(status);
                *guard = None;
                Some(status)
            }
            Err(e) => {
                warn!("wait on tor failed: {}", e);
                *guard = None;
                None
            }
        }
    }

    /// Terminate the process: SIGTERM, a grace period, then SIGKILL.
    ///
    /// Idempotent; returns the exit status when one is known.
    pub async fn destroy(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.inner.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return self.exit_status();
        };
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // The polite signal first; tor flushes state on SIGTERM.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let status = match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("wait after SIGTERM failed: {}", e);
                None
            }
            Err(_elapsed) => {
                warn!("tor ignored SIGTERM for {:?}; killing", TERM_GRACE);
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        if let Some(status) = status {
            *self.inner.exit.lock().expect("poisoned lock") = Some(status);
        }
        *guard = None;
        status
    }
}

/// Everything a control connection needs after a successful start.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CtrlArguments {
    /// The running daemon.
    pub child: TorChild,
    /// The `AUTHENTICATE` command to open the session with.
    pub authenticate: CtrlCommand,
    /// The `+LOADCONF` carrying the generated configuration text.
    pub load_conf: CtrlCommand,
    /// Where the control port listens.
    pub endpoint: CtrlEndpoint,
    /// The committed configuration snapshot.
    pub torrc: Torrc,
}

/// Per-fid supervision state.
struct Supervision {
    /// The daemon last started for this fid, if any.
    last_child: Option<TorChild>,
    /// When the last daemon for this fid went away.
    last_stop: Option<Instant>,
}

/// One keeper entry: an async lock serializing start attempts.
struct FidState {
    /// Held for the whole of a start attempt.
    lock: tokio::sync::Mutex<Supervision>,
}

/// The process-wide keeper, keyed by fid.
static KEEPER: Lazy<Mutex<HashMap<String, Arc<FidState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Look up (or create) the keeper entry for a fid.
fn fid_state(fid: &Fid) -> Arc<FidState> {
    Arc::clone(
        KEEPER
            .lock()
            .expect("poisoned lock")
            .entry(fid.as_str().to_owned())
            .or_insert_with(|| {
                Arc::new(FidState {
                    lock: tokio::sync::Mutex::new(Supervision {
                        last_child: None,
                        last_stop: None,
                    }),
                })
            }),
    )
}

/// Launches and tears down the daemon for an environment.
#[derive(Clone)]
pub struct Supervisor {
    /// The configuration generator run on every start.
    generator: ConfigGenerator,
    /// Locates the tor binary and geoip data.
    installer: Arc<dyn ResourceInstaller>,
    /// Receives every stdout/stderr line.
    log_sink: ProcessLogSink,
    /// Receives daemon lifecycle notifications.
    status_sink: StatusSink,
}

impl Supervisor {
    /// Build a supervisor from a generator and an installer.
    pub fn new(generator: ConfigGenerator, installer: Arc<dyn ResourceInstaller>) -> Self {
        Supervisor {
            generator,
            installer,
            log_sink: Arc::new(|_, _| {}),
            status_sink: Arc::new(|_| {}),
        }
    }

    /// Attach a sink for the daemon's standard streams.
    pub fn with_log_sink(mut self, sink: ProcessLogSink) -> Self {
        self.log_sink = sink;
        self
    }

    /// Attach a sink for lifecycle notifications.
    pub fn with_status_sink(
        mut self,
        sink: impl Fn(ProcStatus) + Send + Sync + 'static,
    ) -> Self {
        self.status_sink = Arc::new(sink);
        self
    }

    /// Start the daemon for `env`.
    ///
    /// Start attempts for one fid serialize on the keeper lock; any
    /// previous daemon for the fid is torn down first, and at least
    /// [`INTER_RUN_DELAY`] passes between two daemons of one fid.
    pub async fn start(&self, env: &TorEnv) -> Result<CtrlArguments, ProcError> {
        let keeper = fid_state(env.fid());
        let mut sup = keeper.lock.lock().await;

        if let Some(previous) = sup.last_child.take() {
            debug!("tearing down previous daemon {:?}", previous);
            previous.destroy().await;
        }
        tokio::task::yield_now().await;

        (self.status_sink)(ProcStatus::Starting);

        if let Some(stopped) = sup.last_stop {
            if stopped.elapsed() < INTER_RUN_DELAY {
                info!(
                    "delaying tor relaunch for {}ms",
                    (INTER_RUN_DELAY - stopped.elapsed()).as_millis()
                );
                while stopped.elapsed() < INTER_RUN_DELAY {
                    tokio::time::sleep(POLL_TICK).await;
                }
                info!("tor relaunch delay complete");
            }
        }

        match self.start_inner(env).await {
            Ok(args) => {
                sup.last_child = Some(args.child.clone());
                Ok(args)
            }
            Err(e) => {
                sup.last_stop = Some(Instant::now());
                let _ = std::fs::remove_file(env.control_port_file());
                (self.status_sink)(ProcStatus::Off);
                Err(e)
            }
        }
    }

    /// Tear the daemon down and record the stop.
    ///
    /// The caller is expected to have asked Tor to shut down over the
    /// control connection first, where one is alive; this finishes the
    /// job either way.
    pub async fn stop(&self, env: &TorEnv, child: &TorChild) {
        let keeper = fid_state(env.fid());
        let mut sup = keeper.lock.lock().await;
        child.destroy().await;
        sup.last_child = None;
        sup.last_stop = Some(Instant::now());
        let _ = std::fs::remove_file(env.control_port_file());
        (self.status_sink)(ProcStatus::Off);
    }

    /// The fallible part of a start attempt.
    async fn start_inner(&self, env: &TorEnv) -> Result<CtrlArguments, ProcError> {
        let (torrc, paths) = self.generator.generate(env, self.installer.as_ref()).await?;
        prepare_filesystem(env, &torrc).map_err(ProcError::io)?;
        let _ = std::fs::remove_file(env.control_port_file());

        let mut cmd = Command::new(&paths.tor);
        cmd.arg("-f")
            .arg(env.torrc_file())
            .arg("--defaults-torrc")
            .arg(env.torrc_defaults_file())
            .arg("--ignore-missing-torrc")
            .args(torrc.start_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("HOME", env.work_dir())
            .kill_on_drop(true);
        debug!("spawning {} with the generated arguments", paths.tor.display());
        let mut spawned = cmd.spawn().map_err(|e| ProcError::Spawn(Arc::new(e)))?;

        let Some(stdout) = spawned.stdout.take() else {
            return Err(ProcError::Spawn(Arc::new(io::Error::other(
                "spawned tor without a stdout pipe",
            ))));
        };
        let feed = StdoutFeed::spawn(stdout, self.log_sink.clone());
        if let Some(stderr) = spawned.stderr.take() {
            drain_stderr(stderr, self.log_sink.clone());
        }
        let child = TorChild::new(spawned);

        if let Err(e) = self.await_startup(env, &feed, &child).await {
            child.destroy().await;
            return Err(e);
        }
        let endpoint = match self.await_ctrl_file(env, &feed, &child).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                child.destroy().await;
                return Err(e);
            }
        };

        let cookie_on = torrc.settings().iter().any(|s| {
            s.keyword() == Keyword::CookieAuthentication
                && matches!(s.value(), SettingValue::Bool(true))
        });
        let auth = if cookie_on {
            match self.await_cookie(env, &feed, &child).await {
                Ok(cookie) => Auth::Cookie(cookie),
                Err(e) => {
                    child.destroy().await;
                    return Err(e);
                }
            }
        } else {
            Auth::None
        };

        info!("tor is up (pid {:?}, control {})", child.pid(), endpoint);
        Ok(CtrlArguments {
            child,
            authenticate: CtrlCommand::Authenticate(auth),
            load_conf: CtrlCommand::LoadConf(torrc.text().to_owned()),
            endpoint,
            torrc,
        })
    }

    /// Watch the early-exit window: a daemon that dies or logs a fatal
    /// error right away never gets as far as control-port discovery.
    async fn await_startup(
        &self,
        _env: &TorEnv,
        feed: &StdoutFeed,
        child: &TorChild,
    ) -> Result<(), ProcError> {
        let deadline = Instant::now() + EARLY_EXIT_WINDOW;
        loop {
            if let Some(e) = feed.startup_error() {
                return Err(e);
            }
            if let Some(status) = child.try_exit().await {
                return Err(feed
                    .startup_error()
                    .unwrap_or(ProcError::ExitedEarly {
                        code: status.code(),
                    }));
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }

    /// Poll for the control-port file, propagating any startup failure
    /// the stdout feed latches meanwhile.
    async fn await_ctrl_file(
        &self,
        env: &TorEnv,
        feed: &StdoutFeed,
        child: &TorChild,
    ) -> Result<CtrlEndpoint, ProcError> {
        let deadline = Instant::now() + CTRL_FILE_TIMEOUT;
        let path = env.control_port_file();
        let mut last_parse_err = None;
        loop {
            if let Some(e) = feed.startup_error() {
                return Err(e);
            }
            if let Some(status) = child.try_exit().await {
                return Err(ProcError::ExitedEarly {
                    code: status.code(),
                });
            }
            if let Ok(contents) = std::fs::read_to_string(&path) {
                match parse_control_port_file(&contents) {
                    Ok(endpoint) => return Ok(endpoint),
                    // Possibly written halfway; keep polling.
                    Err(e) => last_parse_err = Some(e),
                }
            }
            if Instant::now() >= deadline {
                return Err(last_parse_err.unwrap_or(ProcError::CtrlFileTimeout));
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }

    /// Poll for the cookie file. Its budget only counts down once the
    /// daemon has shown some stdout progress.
    async fn await_cookie(
        &self,
        env: &TorEnv,
        feed: &StdoutFeed,
        child: &TorChild,
    ) -> Result<Vec<u8>, ProcError> {
        let entered = Instant::now();
        let path = env.cookie_auth_file();
        let mut budget_start: Option<Instant> = None;
        loop {
            if let Some(e) = feed.startup_error() {
                return Err(e);
            }
            if let Some(status) = child.try_exit().await {
                return Err(ProcError::ExitedEarly {
                    code: status.code(),
                });
            }
            if let Ok(cookie) = std::fs::read(&path) {
                if !cookie.is_empty() {
                    return Ok(cookie);
                }
            }
            if budget_start.is_none() && feed.lines_seen() >= COOKIE_MIN_STDOUT_LINES {
                budget_start = Some(Instant::now());
            }
            let budget_spent = budget_start
                .map(|t| t.elapsed() >= COOKIE_TIMEOUT)
                .unwrap_or(false);
            if budget_spent || entered.elapsed() >= COOKIE_OVERALL_CAP {
                return Err(ProcError::CookieTimeout);
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }
}

/// Create every directory a configuration references (mode 700) and the
/// torrc files it is launched with (mode 600).
fn prepare_filesystem(env: &TorEnv, torrc: &Torrc) -> io::Result<()> {
    for setting in torrc.settings() {
        match setting.value() {
            SettingValue::Dir(dir) => create_dir_700(dir)?,
            SettingValue::HiddenService(hs) => create_dir_700(hs.dir())?,
            _ => {}
        }
    }
    create_file_600(&env.torrc_file())?;
    create_file_600(&env.torrc_defaults_file())?;
    Ok(())
}

#[cfg(all(test, unix))]
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
    use crate::install::ProvidedTor;
    use crate::probe::PortProbe;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::os::unix::fs::PermissionsExt;

    /// A probe that finds every port available, keeping tests hermetic.
    struct YesProbe;

    #[async_trait]
    impl PortProbe for YesProbe {
        async fn is_available(&self, _h: IpAddr, _p: u16) -> Result<bool, io::Error> {
            Ok(true)
        }
    }

    /// Write an executable fake-tor script.
    fn fake_tor(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-tor");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_env(tmp: &tempfile::TempDir) -> TorEnv {
        TorEnv::new(tmp.path().join("w"), tmp.path().join("c")).unwrap()
    }

    fn supervisor(tor: std::path::PathBuf) -> Supervisor {
        let generator = ConfigGenerator::new().with_probe(Arc::new(YesProbe));
        Supervisor::new(generator, Arc::new(ProvidedTor::new(tor)))
    }

    #[tokio::test]
    async fn err_line_fails_start_with_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let tor = fake_tor(
            tmp.path(),
            "echo 'Jan 01 00:00:00.000 [notice] Tor starting'\n\
             echo 'Jan 01 00:00:00.000 [err] Reading config failed'\n\
             sleep 30",
        );
        let statuses: Arc<Mutex<Vec<ProcStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        let sup = supervisor(tor).with_status_sink(move |s| seen.lock().unwrap().push(s));

        let err = sup.start(&env).await.unwrap_err();
        match err {
            ProcError::StartupLog { buffer } => {
                assert!(buffer.contains("[err] Reading config failed"));
                assert!(buffer.contains("[notice] Tor starting"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ProcStatus::Starting, ProcStatus::Off]
        );
        assert!(!env.control_port_file().exists());
    }

    #[tokio::test]
    async fn early_exit_is_reported_with_code() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let tor = fake_tor(tmp.path(), "exit 3");
        let sup = supervisor(tor);
        let err = sup.start(&env).await.unwrap_err();
        assert!(matches!(err, ProcError::ExitedEarly { code: Some(3) }));
    }

    #[tokio::test]
    async fn discovery_returns_endpoint_and_cookie() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let ctrl = env.control_port_file();
        let cookie = env.cookie_auth_file();
        let body = format!(
            "for i in 1 2 3 4 5 6; do echo \"[notice] line $i\"; done\n\
             printf 'cookiecookiecookiecookiecookie12' > {cookie}\n\
             printf 'PORT=127.0.0.1:39155\\n' > {ctrl}\n\
             exec sleep 30",
            cookie = cookie.display(),
            ctrl = ctrl.display(),
        );
        let tor = fake_tor(tmp.path(), &body);
        let sup = supervisor(tor);

        let args = sup.start(&env).await.unwrap();
        assert_eq!(
            args.endpoint,
            CtrlEndpoint::Tcp("127.0.0.1:39155".parse().unwrap())
        );
        match &args.authenticate {
            CtrlCommand::Authenticate(Auth::Cookie(bytes)) => {
                assert_eq!(bytes.len(), 32);
            }
            other => panic!("unexpected auth {:?}", other),
        }
        match &args.load_conf {
            CtrlCommand::LoadConf(text) => assert_eq!(text, args.torrc.text()),
            other => panic!("unexpected load_conf {:?}", other),
        }

        sup.stop(&env, &args.child).await;
        assert!(!env.control_port_file().exists());
        assert!(args.child.exit_status().is_some());
    }

    #[tokio::test]
    async fn restart_waits_out_the_inter_run_delay() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let ctrl = env.control_port_file();
        let cookie = env.cookie_auth_file();
        let body = format!(
            "for i in 1 2 3 4 5 6; do echo \"[notice] line $i\"; done\n\
             printf 'cookiecookiecookiecookiecookie12' > {cookie}\n\
             printf 'PORT=127.0.0.1:39156\\n' > {ctrl}\n\
             exec sleep 30",
            cookie = cookie.display(),
            ctrl = ctrl.display(),
        );
        let tor = fake_tor(tmp.path(), &body);
        let sup = supervisor(tor);

        let args = sup.start(&env).await.unwrap();
        sup.stop(&env, &args.child).await;

        let second_start = Instant::now();
        let args = sup.start(&env).await.unwrap();
        assert!(
            second_start.elapsed() >= INTER_RUN_DELAY,
            "second start must wait out the inter-run delay"
        );
        sup.stop(&env, &args.child).await;
    }

    #[tokio::test]
    async fn missing_control_file_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let tor = fake_tor(
            tmp.path(),
            "echo '[notice] chatty but never writes the file'\nexec sleep 30",
        );
        let sup = supervisor(tor);
        let started = Instant::now();
        let err = sup.start(&env).await.unwrap_err();
        assert!(matches!(err, ProcError::CtrlFileTimeout));
        assert!(started.elapsed() >= CTRL_FILE_TIMEOUT);
    }
}

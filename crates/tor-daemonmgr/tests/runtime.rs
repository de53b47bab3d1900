//! End-to-end runtime tests against a scripted daemon and an in-process
//! control server.

#![cfg(unix)]
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

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tor_daemonmgr::{
    Action, Connectivity, CtrlCommand, Daemon, DaemonMgr, DaemonStatus, Error, NetSink,
    NetworkObserver, ProvidedTor, TorEnv,
};

/// Shared state of the scripted control server.
struct CtrlServer {
    /// Every command line received, across connections.
    requests: Mutex<Vec<String>>,
    /// Writer to the most recent connection, for event injection.
    push: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl CtrlServer {
    fn take_requests(&self) -> Vec<String> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn push_event(&self, raw: &str) {
        let guard = self.push.lock().unwrap();
        guard
            .as_ref()
            .expect("no live control connection")
            .send(raw.to_owned())
            .unwrap();
    }
}

/// Spawn a control server that accepts any authentication, answers
/// `250 OK` to everything, and hangs up after a `SIGNAL SHUTDOWN`.
async fn spawn_ctrl_server() -> (SocketAddr, Arc<CtrlServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(CtrlServer {
        requests: Mutex::new(Vec::new()),
        push: Mutex::new(None),
    });
    let server = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
            *server.push.lock().unwrap() = Some(push_tx);
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0_u8; 1024];
                let mut in_multiline = false;
                'conn: loop {
                    tokio::select! {
                        pushed = push_rx.recv() => {
                            let Some(pushed) = pushed else { break };
                            if sock.write_all(pushed.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        r = sock.read(&mut chunk) => {
                            let n = match r { Ok(0) | Err(_) => break, Ok(n) => n };
                            buf.extend_from_slice(&chunk[..n]);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = buf.drain(..=pos).collect();
                                let line = String::from_utf8_lossy(&line).trim_end().to_string();
                                if in_multiline {
                                    if line == "." {
                                        in_multiline = false;
                                    } else {
                                        continue;
                                    }
                                } else if let Some(rest) = line.strip_prefix('+') {
                                    server.requests.lock().unwrap().push(rest.to_owned());
                                    in_multiline = true;
                                    continue;
                                } else {
                                    server.requests.lock().unwrap().push(line.clone());
                                }
                                if sock.write_all(b"250 OK\r\n").await.is_err() {
                                    break 'conn;
                                }
                                if line.starts_with("SIGNAL SHUTDOWN") {
                                    // Tor exits after a shutdown signal;
                                    // so does this connection.
                                    break 'conn;
                                }
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, state)
}

/// Write a fake tor: logs some notices, drops the cookie and
/// control-port files, then idles until signalled.
fn fake_tor(dir: &std::path::Path, env: &TorEnv, ctrl_addr: SocketAddr) -> PathBuf {
    let path = dir.join("fake-tor");
    let script = format!(
        "#!/bin/sh\n\
         for i in 1 2 3 4 5 6; do echo \"[notice] starting up $i\"; done\n\
         printf 'cookiecookiecookiecookiecookie12' > {cookie}\n\
         printf 'PORT={addr}\\n' > {ctrl}\n\
         exec sleep 600\n",
        cookie = env.cookie_auth_file().display(),
        ctrl = env.control_port_file().display(),
        addr = ctrl_addr,
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A full test fixture: environment, control server, runtime.
async fn fixture(tmp: &tempfile::TempDir) -> (DaemonMgr, Arc<CtrlServer>) {
    let env = TorEnv::new(tmp.path().join("work"), tmp.path().join("cache")).unwrap();
    let (addr, server) = spawn_ctrl_server().await;
    let tor = fake_tor(tmp.path(), &env, addr);
    let mgr = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .build()
        .unwrap();
    (mgr, server)
}

/// Wait (bounded) until `predicate` holds.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}

#[tokio::test]
async fn start_opens_and_configures_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, server) = fixture(&tmp).await;

    mgr.start().unwrap().wait().await.unwrap();
    assert!(mgr.is_started());

    let requests = server.requests();
    assert!(requests[0].starts_with("AUTHENTICATE "));
    assert!(requests.iter().any(|r| r == "LOADCONF"));
    assert!(requests
        .iter()
        .any(|r| r.starts_with("SETEVENTS") && r.contains("NOTICE") && r.contains("CONF_CHANGED")));
    // No observer means Connected: the network opens on start.
    assert!(requests.iter().any(|r| r == "RESETCONF DisableNetwork"));
    assert!(!requests.iter().any(|r| r == "TAKEOWNERSHIP"));

    // Bootstrap notices become published state.
    server.push_event("650 NOTICE Bootstrapped 45%: Loading relay descriptors\r\n");
    wait_until(|| mgr.status().daemon == Daemon::On(45)).await;
    assert!(!mgr.is_ready());
    server.push_event("650 NOTICE Bootstrapped 100%: Done\r\n");
    wait_until(|| mgr.is_ready()).await;

    // Listener notices become the typed set.
    server.push_event(
        "650 NOTICE Opened Socks listener connection (ready) on 127.0.0.1:9050\r\n",
    );
    wait_until(|| mgr.listeners().socks.contains("127.0.0.1:9050")).await;

    mgr.stop().unwrap().wait().await.unwrap();
    assert_eq!(mgr.status(), DaemonStatus::default());
    mgr.destroy().await;
}

#[tokio::test]
async fn start_is_idempotent_when_started() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, server) = fixture(&tmp).await;

    mgr.start().unwrap().wait().await.unwrap();
    let auths = || {
        server
            .requests()
            .iter()
            .filter(|r| r.starts_with("AUTHENTICATE"))
            .count()
    };
    let before = auths();
    mgr.start().unwrap().wait().await.unwrap();
    assert_eq!(auths(), before, "second start must have no side effects");

    mgr.destroy().await;
}

#[tokio::test]
async fn stop_on_off_runtime_succeeds_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, _server) = fixture(&tmp).await;
    mgr.stop().unwrap().wait().await.unwrap();
    assert_eq!(mgr.status().daemon, Daemon::Off);
    mgr.destroy().await;
}

#[tokio::test]
async fn stop_interrupts_an_executing_start() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, _server) = fixture(&tmp).await;

    let start = mgr.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stop = mgr.stop().unwrap();

    let start_result = start.wait().await;
    assert!(matches!(start_result, Err(Error::Interrupted)));
    stop.wait().await.unwrap();
    wait_until(|| mgr.status().daemon == Daemon::Off).await;
    assert!(!mgr.is_started());
    mgr.destroy().await;
}

#[tokio::test]
async fn restart_builds_a_fresh_session() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, server) = fixture(&tmp).await;

    mgr.start().unwrap().wait().await.unwrap();
    server.take_requests();

    mgr.restart().unwrap().wait().await.unwrap();
    assert!(mgr.is_started());
    let requests = server.requests();
    assert!(requests.iter().any(|r| r.starts_with("SIGNAL SHUTDOWN")));
    assert!(requests.iter().any(|r| r.starts_with("AUTHENTICATE")));
    mgr.destroy().await;
}

#[tokio::test]
async fn duplicate_starts_share_one_outcome() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, server) = fixture(&tmp).await;

    let first = mgr.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Enqueued while the first executes: rides along.
    let second = mgr.start().unwrap();

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    let auth_count = server
        .requests()
        .iter()
        .filter(|r| r.starts_with("AUTHENTICATE"))
        .count();
    assert_eq!(auth_count, 1, "attached job must not start a second tor");
    mgr.destroy().await;
}

#[tokio::test]
async fn second_runtime_for_same_environment_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let env = TorEnv::new(tmp.path().join("work"), tmp.path().join("cache")).unwrap();
    let (addr, _server) = spawn_ctrl_server().await;
    let tor = fake_tor(tmp.path(), &env, addr);

    let first = DaemonMgr::builder(env.clone())
        .installer(Arc::new(ProvidedTor::new(tor.clone())))
        .build()
        .unwrap();
    let second = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .build();
    assert!(matches!(second, Err(Error::AlreadyExists { .. })));

    // Destroying the first frees the fid.
    first.destroy().await;
    let env = TorEnv::new(tmp.path().join("work"), tmp.path().join("cache")).unwrap();
    let (addr, _server) = spawn_ctrl_server().await;
    let tor = fake_tor(tmp.path(), &env, addr);
    let third = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .build()
        .unwrap();
    third.destroy().await;
}

#[tokio::test]
async fn commands_require_started() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, _server) = fixture(&tmp).await;
    let err = mgr
        .send_command(CtrlCommand::GetInfo(vec!["version".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    mgr.destroy().await;
}

#[tokio::test]
async fn enqueue_after_destroy_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, _server) = fixture(&tmp).await;
    mgr.destroy().await;
    assert!(matches!(
        mgr.enqueue(Action::Start),
        Err(Error::Destroyed)
    ));
}

/// A hand-cranked connectivity observer.
struct TestObserver {
    /// The sink the runtime attached, once it did.
    sink: Mutex<Option<NetSink>>,
    /// What `current` reports.
    current: Mutex<Connectivity>,
}

impl TestObserver {
    fn new(initial: Connectivity) -> Arc<Self> {
        Arc::new(TestObserver {
            sink: Mutex::new(None),
            current: Mutex::new(initial),
        })
    }

    fn fire(&self, connectivity: Connectivity) {
        *self.current.lock().unwrap() = connectivity;
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(connectivity);
        }
    }
}

impl NetworkObserver for TestObserver {
    fn current(&self) -> Connectivity {
        *self.current.lock().unwrap()
    }

    fn attach(&self, sink: NetSink) -> Box<dyn FnOnce() + Send> {
        *self.sink.lock().unwrap() = Some(sink);
        Box::new(|| {})
    }
}

#[tokio::test]
async fn connectivity_flaps_debounce_to_one_setconf() {
    let tmp = tempfile::tempdir().unwrap();
    let env = TorEnv::new(tmp.path().join("work"), tmp.path().join("cache")).unwrap();
    let (addr, server) = spawn_ctrl_server().await;
    let tor = fake_tor(tmp.path(), &env, addr);
    let observer = TestObserver::new(Connectivity::Connected);
    let mgr = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .network_observer(observer.clone())
        .build()
        .unwrap();

    mgr.start().unwrap().wait().await.unwrap();
    server.take_requests();

    // Two transitions 100 ms apart: the second supersedes the first.
    observer.fire(Connectivity::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    observer.fire(Connectivity::Connected);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let toggles: Vec<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.starts_with("SETCONF DisableNetwork"))
        .collect();
    assert_eq!(toggles, vec!["SETCONF DisableNetwork=0".to_string()]);
    mgr.destroy().await;
}

#[tokio::test]
async fn take_ownership_is_issued_when_requested() {
    let tmp = tempfile::tempdir().unwrap();
    let env = TorEnv::new(tmp.path().join("work"), tmp.path().join("cache")).unwrap();
    let (addr, server) = spawn_ctrl_server().await;
    let tor = fake_tor(tmp.path(), &env, addr);
    let mgr = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .take_ownership(true)
        .build()
        .unwrap();

    mgr.start().unwrap().wait().await.unwrap();
    assert!(server.requests().iter().any(|r| r == "TAKEOWNERSHIP"));
    mgr.destroy().await;
}

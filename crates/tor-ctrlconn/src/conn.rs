//! The connection state machine: one transport, one read loop, ordered
//! writes, and an in-flight command FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use educe::Educe;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, trace, warn};

use tor_ctrlproto::{Auth, CtrlCommand, CtrlEvent, Reply, ReplyParser};

use crate::endpoint::{CtrlEndpoint, CtrlSocket};
use crate::err::ConnError;

/// How many events the broadcast channel buffers for a slow subscriber
/// before it starts observing lag.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Authentication progress on a connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthState {
    /// No `AUTHENTICATE` has been accepted yet.
    Unauthenticated,
    /// An `AUTHENTICATE` is in flight.
    Authenticating,
    /// Tor accepted our credentials.
    Authenticated,
}

/// One command awaiting its terminal reply.
struct PendingCmd {
    /// The command keyword, for diagnostics.
    name: &'static str,
    /// Completes with the terminal reply, or with `ConnectionLost`.
    tx: oneshot::Sender<Result<Reply, ConnError>>,
}

/// Mutable connection state, guarded by a plain mutex.
///
/// The lock is held only for short, non-suspending critical sections.
struct State {
    /// Authentication progress.
    auth: AuthState,
    /// True once `close` has run (or destruction began): no new writes.
    closed: bool,
    /// True once destruction completed; hooks have run.
    destroyed: bool,
    /// True once the read loop has been started.
    reading: bool,
    /// True once `TAKEOWNERSHIP` succeeded on this connection.
    owned: bool,
    /// In-flight commands, oldest first. Pushed under the write lock, so
    /// queue order is wire order.
    pending: VecDeque<PendingCmd>,
    /// Callbacks to run exactly once when the connection is destroyed.
    on_destroy: Vec<Box<dyn FnOnce() + Send>>,
}

/// Shared internals of a [`CtrlConn`].
#[derive(Educe)]
#[educe(Debug)]
struct Inner {
    /// The write half; `None` after close. The mutex serializes writes so
    /// command framing is atomic.
    #[educe(Debug(ignore))]
    writer: tokio::sync::Mutex<Option<WriteHalf<Box<dyn CtrlSocket>>>>,
    /// The read half, waiting for `start_read` to claim it.
    #[educe(Debug(ignore))]
    reader: Mutex<Option<ReadHalf<Box<dyn CtrlSocket>>>>,
    /// Mutable state.
    #[educe(Debug(ignore))]
    state: Mutex<State>,
    /// Fan-out for asynchronous events.
    events: broadcast::Sender<CtrlEvent>,
    /// Wakes the read loop on local close. `notify_one` leaves a permit,
    /// so a close that races the loop is never lost.
    close_notify: Notify,
}

/// An open control connection.
///
/// Cheap to clone; all clones share the same transport and state.
#[derive(Clone, Debug)]
pub struct CtrlConn {
    /// Shared internals.
    inner: Arc<Inner>,
}

impl CtrlConn {
    /// Open a connection to `endpoint`.
    ///
    /// Nothing is read or written yet: call [`start_read`](Self::start_read)
    /// and then [`authenticate`](Self::authenticate).
    pub async fn connect(endpoint: &CtrlEndpoint) -> Result<Self, ConnError> {
        let sock = endpoint.open().await?;
        let (read, write) = tokio::io::split(sock);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(CtrlConn {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(Some(write)),
                reader: Mutex::new(Some(read)),
                state: Mutex::new(State {
                    auth: AuthState::Unauthenticated,
                    closed: false,
                    destroyed: false,
                    reading: false,
                    owned: false,
                    pending: VecDeque::new(),
                    on_destroy: Vec::new(),
                }),
                events,
                close_notify: Notify::new(),
            }),
        })
    }

    /// Start the background read loop.
    ///
    /// Fails with [`ConnError::AlreadyReading`] on a second invocation.
    pub fn start_read(&self) -> Result<tokio::task::JoinHandle<()>, ConnError> {
        {
            let mut st = self.lock_state();
            if st.reading {
                return Err(ConnError::AlreadyReading);
            }
            st.reading = true;
        }
        let read = self
            .inner
            .reader
            .lock()
            .expect("poisoned lock")
            .take()
            .ok_or(ConnError::AlreadyReading)?;
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(read_loop(inner, read)))
    }

    /// Subscribe to asynchronous events.
    ///
    /// Subscribers are not individually told about connection loss; the
    /// channel simply ends.
    pub fn events(&self) -> broadcast::Receiver<CtrlEvent> {
        self.inner.events.subscribe()
    }

    /// Send a command and wait for its terminal reply.
    ///
    /// Replies are delivered in the order commands were accepted by the
    /// writer. Before authentication, only commands that Tor permits
    /// pre-authentication may be sent.
    pub async fn send(&self, cmd: CtrlCommand) -> Result<Reply, ConnError> {
        {
            let st = self.lock_state();
            if st.closed {
                return Err(ConnError::Closed);
            }
            if st.auth != AuthState::Authenticated && !cmd.allowed_before_auth() {
                return Err(ConnError::NotAuthenticated { cmd: cmd.name() });
            }
        }
        let name = cmd.name();
        let encoded = cmd.encode();
        let (tx, rx) = oneshot::channel();

        let mut writer = self.inner.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(ConnError::Closed);
        };
        // Enqueue while holding the write lock, so FIFO order is wire
        // order.
        self.lock_state().pending.push_back(PendingCmd { name, tx });
        trace!("ctrl -> {}", name);
        let write_result = async {
            w.write_all(encoded.as_bytes()).await?;
            w.flush().await
        }
        .await;
        drop(writer);
        if let Err(e) = write_result {
            let cause = ConnError::lost(e);
            destroy(&self.inner, cause.clone()).await;
            return Err(cause);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnError::ConnectionLost(None)),
        }
    }

    /// Send a command, mapping any non-2xx terminal status to
    /// [`ConnError::CommandRejected`].
    pub async fn send_expect_ok(&self, cmd: CtrlCommand) -> Result<Reply, ConnError> {
        let name = cmd.name();
        let reply = self.send(cmd).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ConnError::CommandRejected {
                cmd: name,
                status: reply.status(),
                msg: reply.terminal_line().to_owned(),
            })
        }
    }

    /// Run the authentication handshake.
    ///
    /// On refusal the connection stays open and unauthenticated; the
    /// caller may retry with different credentials.
    pub async fn authenticate(&self, auth: &Auth) -> Result<(), ConnError> {
        {
            let mut st = self.lock_state();
            if st.auth == AuthState::Authenticated {
                return Ok(());
            }
            st.auth = AuthState::Authenticating;
        }
        let outcome = self.send(CtrlCommand::Authenticate(auth.clone())).await;
        let mut st = self.lock_state();
        match outcome {
            Ok(reply) if reply.is_ok() => {
                st.auth = AuthState::Authenticated;
                Ok(())
            }
            Ok(reply) => {
                st.auth = AuthState::Unauthenticated;
                Err(ConnError::AuthRefused {
                    status: reply.status(),
                    msg: reply.terminal_line().to_owned(),
                })
            }
            Err(e) => {
                st.auth = AuthState::Unauthenticated;
                Err(e)
            }
        }
    }

    /// Issue `TAKEOWNERSHIP`: once it succeeds, Tor exits when this
    /// connection closes.
    pub async fn take_ownership(&self) -> Result<(), ConnError> {
        self.send_expect_ok(CtrlCommand::TakeOwnership).await?;
        self.lock_state().owned = true;
        Ok(())
    }

    /// Write raw bytes, serialized against other writes.
    ///
    /// Empty writes are no-ops. The bytes do not join the command FIFO;
    /// use [`send`](Self::send) for anything that elicits a reply.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), ConnError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.lock_state().closed {
            return Err(ConnError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(ConnError::Closed);
        };
        let result = async {
            w.write_all(bytes).await?;
            w.flush().await
        }
        .await;
        drop(writer);
        if let Err(e) = result {
            let cause = ConnError::lost(e);
            destroy(&self.inner, cause.clone()).await;
            return Err(cause);
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Idempotent. Half-closes the transport (write side first), wakes
    /// the read loop, and cancels all in-flight commands with
    /// `ConnectionLost`.
    pub async fn close(&self) {
        let was_reading = {
            let mut st = self.lock_state();
            if st.closed {
                return;
            }
            st.closed = true;
            st.reading
        };
        if let Some(mut w) = self.inner.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        if was_reading {
            // The read loop observes the notification, drops the read
            // half, and finishes destruction.
            self.inner.close_notify.notify_one();
        } else {
            destroy(&self.inner, ConnError::Closed).await;
        }
    }

    /// Register a callback to run exactly once when the connection is
    /// destroyed. Runs immediately if destruction already happened.
    pub fn notify_on_destroy(&self, f: impl FnOnce() + Send + 'static) {
        let mut callback = Some(Box::new(f) as Box<dyn FnOnce() + Send>);
        {
            let mut st = self.lock_state();
            if !st.destroyed {
                if let Some(callback) = callback.take() {
                    st.on_destroy.push(callback);
                }
            }
        }
        // Already destroyed: run immediately, outside the lock.
        if let Some(callback) = callback {
            callback();
        }
    }

    /// The current authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.lock_state().auth
    }

    /// True once the connection is destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.lock_state().destroyed
    }

    /// True once `close` has been called or destruction began.
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// True if this connection took ownership of the daemon.
    pub fn is_owner(&self) -> bool {
        self.lock_state().owned
    }

    /// Lock the state mutex.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("poisoned lock")
    }
}

/// The background read loop: drain the socket, reassemble replies, and
/// route them.
async fn read_loop(inner: Arc<Inner>, mut read: ReadHalf<Box<dyn CtrlSocket>>) {
    let mut parser = ReplyParser::new();
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0_u8; 2048];

    let cause = 'read: loop {
        let n = tokio::select! {
            _ = inner.close_notify.notified() => break 'read ConnError::Closed,
            r = read.read(&mut chunk) => match r {
                Ok(0) => break 'read ConnError::peer_closed(),
                Ok(n) => n,
                Err(e) => break 'read ConnError::lost(e),
            },
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            trace!("ctrl <- {:?}", line);
            match parser.feed_line(&line) {
                Ok(Some(reply)) => dispatch(&inner, reply),
                Ok(None) => {}
                Err(e) => break 'read ConnError::Proto(e),
            }
        }
    };

    drop(read);
    buf.fill(0);
    buf.clear();
    destroy(&inner, cause).await;
}

/// Route one complete reply: events to the broadcast channel, everything
/// else to the oldest in-flight command.
fn dispatch(inner: &Arc<Inner>, reply: Reply) {
    if reply.is_async() {
        match CtrlEvent::from_reply(&reply) {
            // Nobody listening is fine.
            Ok(event) => {
                let _ = inner.events.send(event);
            }
            Err(e) => warn!("discarding unparseable event: {}", e),
        }
        return;
    }
    let head = inner
        .state
        .lock()
        .expect("poisoned lock")
        .pending
        .pop_front();
    match head {
        Some(cmd) => {
            let _ = cmd.tx.send(Ok(reply));
        }
        None => warn!(
            "unsolicited reply with status {} and no command in flight",
            reply.status()
        ),
    }
}

/// Destroy the connection exactly once: fail in-flight commands, close
/// the transport, run the on-destroy hooks.
async fn destroy(inner: &Arc<Inner>, cause: ConnError) {
    let (pending, hooks) = {
        let mut st = inner.state.lock().expect("poisoned lock");
        if st.destroyed {
            return;
        }
        st.destroyed = true;
        st.closed = true;
        (
            std::mem::take(&mut st.pending),
            std::mem::take(&mut st.on_destroy),
        )
    };
    debug!("control connection destroyed: {}", cause);
    for hook in hooks {
        hook();
    }
    let fanned_out = match &cause {
        lost @ ConnError::ConnectionLost(_) => lost.clone(),
        _ => ConnError::ConnectionLost(None),
    };
    for cmd in pending {
        trace!("cancelling in-flight {}", cmd.name);
        let _ = cmd.tx.send(Err(fanned_out.clone()));
    }
    if let Some(mut w) = inner.writer.lock().await.take() {
        let _ = w.shutdown().await;
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
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tor_ctrlproto::{EventKind, Signal};

    /// Shared state of the in-process control server.
    struct ServerState {
        /// Command lines received, in order.
        requests: Mutex<Vec<String>>,
        /// Canned raw responses, consumed one per command. When empty,
        /// the server answers `250 OK`.
        responses: Mutex<VecDeque<String>>,
        /// Raw text pushed to the client outside the request cycle.
        push_tx: mpsc::UnboundedSender<String>,
    }

    impl ServerState {
        fn take_requests(&self) -> Vec<String> {
            std::mem::take(&mut self.requests.lock().unwrap())
        }

        fn push_canned(&self, raw: &str) {
            self.responses.lock().unwrap().push_back(raw.to_owned());
        }

        fn push_event(&self, raw: &str) {
            self.push_tx.send(raw.to_owned()).unwrap();
        }
    }

    /// Spawn a one-connection control server; returns its address.
    async fn spawn_server() -> (SocketAddr, Arc<ServerState>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
        let state = Arc::new(ServerState {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            push_tx,
        });
        let server = Arc::clone(&state);
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0_u8; 1024];
            let mut in_multiline = false;
            loop {
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
                            let line = String::from_utf8(line).unwrap();
                            let line = line.trim_end().to_owned();
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
                                server.requests.lock().unwrap().push(line);
                            }
                            let response = server
                                .responses
                                .lock()
                                .unwrap()
                                .pop_front()
                                .unwrap_or_else(|| "250 OK\r\n".to_owned());
                            if sock.write_all(response.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        (addr, state)
    }

    /// Connect to a spawned server and start reading.
    async fn connected() -> (CtrlConn, Arc<ServerState>) {
        let (addr, state) = spawn_server().await;
        let conn = CtrlConn::connect(&CtrlEndpoint::Tcp(addr)).await.unwrap();
        conn.start_read().unwrap();
        (conn, state)
    }

    #[tokio::test]
    async fn authenticate_and_pipeline() {
        let (conn, server) = connected().await;
        conn.authenticate(&Auth::None).await.unwrap();
        assert_eq!(conn.auth_state(), AuthState::Authenticated);

        server.push_canned("250-version=0.4.8.9\r\n250 OK\r\n");
        let version = conn
            .send(CtrlCommand::GetInfo(vec!["version".into()]))
            .await
            .unwrap();
        assert_eq!(version.lines().next().unwrap(), "version=0.4.8.9");

        conn.send_expect_ok(CtrlCommand::Signal(Signal::NewNym))
            .await
            .unwrap();

        assert_eq!(
            server.take_requests(),
            vec!["AUTHENTICATE", "GETINFO version", "SIGNAL NEWNYM"]
        );
    }

    #[tokio::test]
    async fn commands_gated_before_auth() {
        let (conn, _server) = connected().await;
        let err = conn
            .send(CtrlCommand::GetInfo(vec!["version".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::NotAuthenticated { cmd: "GETINFO" }));
        // PROTOCOLINFO is fine pre-auth.
        conn.send(CtrlCommand::ProtocolInfo).await.unwrap();
    }

    #[tokio::test]
    async fn auth_refusal_leaves_connection_usable() {
        let (conn, server) = connected().await;
        server.push_canned("515 Authentication failed: bad cookie\r\n");
        let err = conn
            .authenticate(&Auth::Cookie(vec![0_u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::AuthRefused { status: 515, .. }));
        assert_eq!(conn.auth_state(), AuthState::Unauthenticated);

        // A second attempt can still succeed.
        conn.authenticate(&Auth::None).await.unwrap();
        assert_eq!(conn.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn events_fan_out_without_consuming_command_slots() {
        let (conn, server) = connected().await;
        let mut events = conn.events();
        conn.authenticate(&Auth::None).await.unwrap();

        server.push_event("650 NOTICE Bootstrapped 14%: Handshaking with a relay\r\n");
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), &EventKind::Notice);
        assert!(event.content().starts_with("Bootstrapped 14%"));

        // The event did not eat the next command's reply.
        conn.send_expect_ok(CtrlCommand::SetEvents(vec![EventKind::Notice]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn peer_close_fails_pending_and_runs_hooks_once() {
        let (addr, _server) = spawn_server().await;
        let conn = CtrlConn::connect(&CtrlEndpoint::Tcp(addr)).await.unwrap();
        conn.start_read().unwrap();

        let hook_runs = Arc::new(AtomicUsize::new(0));
        let hook_counter = Arc::clone(&hook_runs);
        conn.notify_on_destroy(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });

        // An empty canned response leaves the command in flight.
        _server.push_canned("");
        let probe = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(CtrlCommand::ProtocolInfo).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await;

        let result = probe.await.unwrap();
        assert!(matches!(result, Err(ConnError::ConnectionLost(_))));
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert!(conn.is_destroyed());

        // Hooks registered after destruction run immediately.
        let late = Arc::new(AtomicUsize::new(0));
        let late_counter = Arc::clone(&late);
        conn.notify_on_destroy(move || {
            late_counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eof_from_peer_destroys() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = CtrlConn::connect(&CtrlEndpoint::Tcp(addr)).await.unwrap();
        conn.start_read().unwrap();
        let sock: TcpStream = accept.await.unwrap();
        drop(sock);

        // Wait for the read loop to observe EOF.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_destroyed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let err = conn.send(CtrlCommand::ProtocolInfo).await.unwrap_err();
        assert!(matches!(err, ConnError::Closed));
    }

    #[tokio::test]
    async fn double_start_read_rejected() {
        let (conn, _server) = connected().await;
        assert!(matches!(
            conn.start_read().unwrap_err(),
            ConnError::AlreadyReading
        ));
    }

    #[tokio::test]
    async fn write_after_close_rejected() {
        let (conn, _server) = connected().await;
        conn.close().await;
        assert!(matches!(
            conn.send(CtrlCommand::ProtocolInfo).await.unwrap_err(),
            ConnError::Closed
        ));
        assert!(matches!(
            conn.write_raw(b"GETINFO version\r\n").await.unwrap_err(),
            ConnError::Closed
        ));
        // Empty writes are no-ops even on a closed connection.
        conn.write_raw(b"").await.unwrap();
        // Close is idempotent.
        conn.close().await;
    }
}

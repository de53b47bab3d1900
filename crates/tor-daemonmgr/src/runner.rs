//! The action-processor loop: pops jobs LIFO and drives each one
//! through the supervisor and the control session.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tor_ctrlconn::CtrlConn;
use tor_ctrlproto::{Auth, CtrlCommand, CtrlEvent, EventKind, Signal};
use tor_procmgr::CtrlArguments;

use crate::action::{Action, ActionJob};
use crate::err::Error;
use crate::events::{LifecycleEvent, RuntimeEvent};
use crate::mgr::{LiveSession, RuntimeInner};
use crate::netwatch::Connectivity;
use crate::status::{Daemon, Network};

/// How long a graceful `SIGNAL SHUTDOWN` may take before we give up on
/// the reply and tear the process down directly.
const SHUTDOWN_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// The processor loop. One per runtime; exits on destroy.
pub(crate) async fn run_loop(inner: Arc<RuntimeInner>) {
    loop {
        tokio::select! {
            _ = inner.destroy_notify.notified() => break,
            _ = inner.queue_notify.notified() => {}
        }
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        while let Some(job) = pop(&inner) {
            process_one(&inner, job).await;
            if inner.destroyed.load(Ordering::SeqCst) {
                return;
            }
        }
    }
    debug!("action processor for {} stopped", inner.env.fid());
}

/// Pop the top of the LIFO stack.
fn pop(inner: &Arc<RuntimeInner>) -> Option<Arc<ActionJob>> {
    inner.stack.lock().expect("poisoned lock").pop()
}

/// Run one job to completion. An error here never poisons the loop.
async fn process_one(inner: &Arc<RuntimeInner>, job: Arc<ActionJob>) {
    // A job cancelled while still on the stack never executes.
    if job.cancel_requested() && !job.action().is_stop() {
        job.complete(&Err(Error::Cancelled));
        inner.emit_execute(&job);
        return;
    }
    if !job.try_execute() {
        return;
    }

    // Absorb same-group jobs still on the stack: they complete alongside
    // this one. A Stop left deeper in the stack interrupts this job.
    {
        let mut stack = inner.stack.lock().expect("poisoned lock");
        let drained: Vec<_> = stack.drain(..).collect();
        for other in drained {
            if other.action().same_group(job.action()) && job.attach_child(Arc::clone(&other)) {
                continue;
            }
            stack.push(other);
        }
        if !job.action().is_stop() && stack.iter().any(|j| j.action().is_stop()) {
            job.latch_interrupt();
        }
    }

    *inner.executing.lock().expect("poisoned lock") = Some(Arc::clone(&job));
    inner.emit_execute(&job);
    info!("executing {:?} job #{}", job.action(), job.id());

    let outcome = match job.action() {
        Action::Start => execute_start(inner, &job).await,
        Action::Stop => execute_stop(inner).await,
        Action::Restart => execute_restart(inner, &job).await,
    };
    if let Err(e) = &outcome {
        debug!("job #{} failed: {}", job.id(), e);
    }

    *inner.executing.lock().expect("poisoned lock") = None;
    job.complete(&outcome);
    inner.emit_execute(&job);
}

/// Bring the daemon up and open the control session.
async fn execute_start(inner: &Arc<RuntimeInner>, job: &Arc<ActionJob>) -> Result<(), Error> {
    if inner.is_started() {
        // Idempotent: a Started runtime completes the job with no side
        // effects.
        return Ok(());
    }
    job.check_cancellation_or_interrupt()?;

    let args = inner.supervisor.start(&inner.env).await.map_err(Error::from)?;

    match open_session(inner, job, &args).await {
        Ok(conn) => {
            install_session(inner, conn, &args);
            inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnStart));
            Ok(())
        }
        Err(e) => {
            // Whatever came up goes straight back down; the supervisor
            // publishes Off.
            inner.supervisor.stop(&inner.env, &args.child).await;
            Err(e)
        }
    }
}

/// Connect, authenticate, and configure the control session.
async fn open_session(
    inner: &Arc<RuntimeInner>,
    job: &Arc<ActionJob>,
    args: &CtrlArguments,
) -> Result<CtrlConn, Error> {
    job.check_cancellation_or_interrupt()?;
    let conn = CtrlConn::connect(&args.endpoint).await?;

    let configured: Result<(), Error> = async {
        conn.start_read()?;
        spawn_event_pump(Arc::downgrade(inner), conn.events());
        job.check_cancellation_or_interrupt()?;

        let auth = match &args.authenticate {
            CtrlCommand::Authenticate(auth) => auth.clone(),
            _ => Auth::None,
        };
        conn.authenticate(&auth).await?;
        job.check_cancellation_or_interrupt()?;

        conn.send_expect_ok(args.load_conf.clone()).await?;
        job.check_cancellation_or_interrupt()?;

        conn.send_expect_ok(CtrlCommand::SetEvents(inner.event_subscription()))
            .await?;
        job.check_cancellation_or_interrupt()?;

        if inner.take_ownership {
            conn.take_ownership().await?;
            job.check_cancellation_or_interrupt()?;
        }

        if inner.current_connectivity() == Connectivity::Connected {
            conn.send_expect_ok(CtrlCommand::ResetConf(vec!["DisableNetwork".to_owned()]))
                .await?;
            inner.publish_network(Network::Enabled);
        }
        job.check_cancellation_or_interrupt()?;
        Ok(())
    }
    .await;

    match configured {
        Ok(()) => Ok(conn),
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

/// Install the configured session as the live one and hook its
/// destruction into the runtime state.
fn install_session(inner: &Arc<RuntimeInner>, conn: CtrlConn, args: &CtrlArguments) {
    let epoch = inner.conn_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    *inner.live.lock().expect("poisoned lock") = Some(LiveSession {
        conn: conn.clone(),
        child: args.child.clone(),
        epoch,
    });
    inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnBind));

    let weak = Arc::downgrade(inner);
    conn.notify_on_destroy(move || {
        if let Some(inner) = weak.upgrade() {
            on_conn_destroyed(&inner, epoch);
        }
    });
}

/// React to the live connection dying under us: the daemon follows it
/// down.
fn on_conn_destroyed(inner: &Arc<RuntimeInner>, epoch: u64) {
    let session = {
        let mut live = inner.live.lock().expect("poisoned lock");
        match &*live {
            Some(current) if current.epoch == epoch => live.take(),
            // A session we already replaced or released; nothing to do.
            _ => None,
        }
    };
    let Some(session) = session else {
        return;
    };
    warn!("control connection lost; stopping tor");
    inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnUnbind));
    inner.publish_daemon(Daemon::Stopping);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        inner.supervisor.stop(&inner.env, &session.child).await;
        inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnStop));
    });
}

/// Tear the daemon down.
async fn execute_stop(inner: &Arc<RuntimeInner>) -> Result<(), Error> {
    let session = inner.live.lock().expect("poisoned lock").take();
    let Some(session) = session else {
        // Stop on an Off runtime succeeds immediately.
        return Ok(());
    };
    inner.publish_daemon(Daemon::Stopping);
    inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnUnbind));

    if !session.conn.is_destroyed() {
        // Ask politely first. The close below cancels everything else
        // still in flight.
        let shutdown = session.conn.send(CtrlCommand::Signal(Signal::Shutdown));
        if tokio::time::timeout(SHUTDOWN_REPLY_TIMEOUT, shutdown)
            .await
            .is_err()
        {
            debug!("no reply to SIGNAL SHUTDOWN; proceeding with teardown");
        }
    }
    session.conn.close().await;
    inner.supervisor.stop(&inner.env, &session.child).await;
    inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnStop));
    Ok(())
}

/// Stop, then Start with a freshly generated configuration.
async fn execute_restart(inner: &Arc<RuntimeInner>, job: &Arc<ActionJob>) -> Result<(), Error> {
    execute_stop(inner).await?;
    job.check_cancellation_or_interrupt()?;
    execute_start(inner, job).await
}

/// Forward daemon events from the connection's broadcast channel into
/// the runtime.
fn spawn_event_pump(weak: Weak<RuntimeInner>, mut events: broadcast::Receiver<CtrlEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    handle_event(&inner, event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event pump lagged; {} daemon events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Interpret one daemon event, then pass it through to subscribers.
pub(crate) fn handle_event(inner: &Arc<RuntimeInner>, event: CtrlEvent) {
    match event.kind() {
        EventKind::Notice => {
            let line = event.content();
            if let Some(pct) = parse_bootstrap(line) {
                inner.publish_daemon(Daemon::On(pct));
            } else {
                apply_listener_line(inner, line);
            }
        }
        EventKind::ConfChanged => {
            for line in event.lines() {
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                match key {
                    "DisableNetwork" => match value {
                        "0" => inner.publish_network(Network::Enabled),
                        "1" => inner.publish_network(Network::Disabled),
                        other => debug!("odd DisableNetwork value {:?}", other),
                    },
                    "SocksPort" => {
                        if let Some(path) = unix_socket_path(value) {
                            let snapshot = {
                                let mut listeners =
                                    inner.listeners.lock().expect("poisoned lock");
                                listeners.apply_socks_unix(path).then(|| listeners.clone())
                            };
                            if let Some(snapshot) = snapshot {
                                inner.emit(RuntimeEvent::Listeners(snapshot));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    inner.emit(RuntimeEvent::Tor(event));
}

/// Track a listener open/close notice.
fn apply_listener_line(inner: &Arc<RuntimeInner>, line: &str) {
    let snapshot = {
        let mut listeners = inner.listeners.lock().expect("poisoned lock");
        listeners.apply_notice(line).then(|| listeners.clone())
    };
    if let Some(snapshot) = snapshot {
        inner.emit(RuntimeEvent::Listeners(snapshot));
    }
}

/// Extract `N` from a `Bootstrapped N%…` notice.
fn parse_bootstrap(line: &str) -> Option<u8> {
    let rest = line.strip_prefix("Bootstrapped ")?;
    let pct: u8 = rest.split('%').next()?.trim().parse().ok()?;
    Some(pct.min(100))
}

/// Extract the path from a `unix:"<path>"…` config value.
fn unix_socket_path(value: &str) -> Option<&str> {
    value.strip_prefix("unix:\"")?.split('"').next()
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
    fn bootstrap_lines() {
        assert_eq!(parse_bootstrap("Bootstrapped 0%: Starting"), Some(0));
        assert_eq!(
            parse_bootstrap("Bootstrapped 45%: Asking for relay descriptors"),
            Some(45)
        );
        assert_eq!(parse_bootstrap("Bootstrapped 100%: Done"), Some(100));
        assert_eq!(parse_bootstrap("Opened Socks listener on x"), None);
        assert_eq!(parse_bootstrap("Bootstrapped x%: odd"), None);
    }

    #[test]
    fn unix_socket_values() {
        assert_eq!(
            unix_socket_path("unix:\"/run/tor/socks\""),
            Some("/run/tor/socks")
        );
        assert_eq!(
            unix_socket_path("unix:\"/run/tor/socks\" GroupWritable"),
            Some("/run/tor/socks")
        );
        assert_eq!(unix_socket_path("9050"), None);
    }
}

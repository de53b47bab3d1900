//! The public runtime handle, its builder, and the per-fid singleton
//! keeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use tokio::sync::Notify;
use tracing::debug;

use tor_ctrlconn::CtrlConn;
use tor_ctrlproto::{CtrlCommand, EventKind, Reply, Signal};
use tor_procmgr::{
    ConfigGenerator, Fid, ProcStatus, ProcessStream, ResourceInstaller, Supervisor, TorChild,
    TorEnv,
};
use tor_torrc::TorrcBuilder;

use crate::action::{Action, ActionHandle, ActionJob, JobState};
use crate::err::Error;
use crate::events::{
    EventSink, LifecycleEvent, LogEvent, RuntimeEvent, RuntimeEventKind, SubscriptionId,
    Subscribers,
};
use crate::listeners::TorListeners;
use crate::netwatch::{Connectivity, Debouncer, NetworkObserver};
use crate::runner;
use crate::status::{Daemon, DaemonStatus, Network, StatusEvents, StatusPublisher};

/// The events the runtime itself always subscribes to on the daemon.
const REQUIRED_EVENTS: [EventKind; 5] = [
    EventKind::Notice,
    EventKind::Warn,
    EventKind::Err,
    EventKind::ConfChanged,
    EventKind::StatusClient,
];

/// Process-wide map of live runtimes, keyed by fid.
///
/// Entries are weak; anything that no longer upgrades is swept the next
/// time someone builds a runtime.
static RUNTIMES: Lazy<Mutex<HashMap<String, Weak<RuntimeInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// One live daemon + control session.
pub(crate) struct LiveSession {
    /// The authenticated control connection.
    pub(crate) conn: CtrlConn,
    /// The daemon process behind it.
    pub(crate) child: TorChild,
    /// Distinguishes this session from any it replaced, so stale
    /// destroy callbacks can be ignored.
    pub(crate) epoch: u64,
}

/// Shared state behind a [`DaemonMgr`].
pub(crate) struct RuntimeInner {
    /// Where this daemon instance lives.
    pub(crate) env: TorEnv,
    /// Spawns and tears down the daemon.
    pub(crate) supervisor: Supervisor,
    /// Issue `TAKEOWNERSHIP` after authentication.
    pub(crate) take_ownership: bool,
    /// Extra `SETEVENTS` subscriptions requested by the embedder.
    pub(crate) extra_events: Vec<EventKind>,
    /// The connectivity source, if one was provided.
    pub(crate) observer: Option<Arc<dyn NetworkObserver>>,
    /// Detach closure for the observer subscription.
    pub(crate) net_detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// The debounced `DisableNetwork` scheduler.
    pub(crate) debouncer: Debouncer,
    /// State publishing.
    pub(crate) status: StatusPublisher,
    /// Template receiver cloned out to `status_events` callers.
    pub(crate) status_rx: Mutex<postage::watch::Receiver<DaemonStatus>>,
    /// Event observers.
    pub(crate) subscribers: Subscribers,
    /// The typed listener set.
    pub(crate) listeners: Mutex<TorListeners>,
    /// The live session, when Started.
    pub(crate) live: Mutex<Option<LiveSession>>,
    /// The LIFO action stack.
    pub(crate) stack: Mutex<Vec<Arc<ActionJob>>>,
    /// The job currently executing, if any.
    pub(crate) executing: Mutex<Option<Arc<ActionJob>>>,
    /// Wakes the processor loop.
    pub(crate) queue_notify: Notify,
    /// Job id source.
    pub(crate) next_job_id: AtomicU64,
    /// Session epoch source.
    pub(crate) conn_epoch: AtomicU64,
    /// Latched by destroy.
    pub(crate) destroyed: AtomicBool,
    /// Stops the processor loop.
    pub(crate) destroy_notify: Notify,
}

impl RuntimeInner {
    /// Publish a daemon transition (guarded) and fan it out.
    pub(crate) fn publish_daemon(&self, proposed: Daemon) {
        if let Some(snapshot) = self.status.update_daemon(proposed) {
            self.subscribers.emit(&RuntimeEvent::State(snapshot));
        }
    }

    /// Publish a network transition (guarded) and fan it out.
    pub(crate) fn publish_network(&self, proposed: Network) {
        if let Some(snapshot) = self.status.update_network(proposed) {
            self.subscribers.emit(&RuntimeEvent::State(snapshot));
        }
    }

    /// Fan out one event.
    pub(crate) fn emit(&self, event: RuntimeEvent) {
        self.subscribers.emit(&event);
    }

    /// Fan out a job state change.
    pub(crate) fn emit_execute(&self, job: &ActionJob) {
        self.emit(RuntimeEvent::Execute(crate::events::ExecuteEvent {
            id: job.id(),
            action: job.action(),
            state: job.state(),
        }));
    }

    /// True while a live session is installed.
    pub(crate) fn is_started(&self) -> bool {
        self.live.lock().expect("poisoned lock").is_some()
    }

    /// The live control connection, if Started.
    pub(crate) fn live_conn(&self) -> Option<CtrlConn> {
        self.live
            .lock()
            .expect("poisoned lock")
            .as_ref()
            .map(|s| s.conn.clone())
    }

    /// The connectivity the observer reports, or Connected when nobody
    /// is watching.
    pub(crate) fn current_connectivity(&self) -> Connectivity {
        self.observer
            .as_ref()
            .map(|o| o.current())
            .unwrap_or(Connectivity::Connected)
    }

    /// The full `SETEVENTS` set: required events plus embedder extras.
    pub(crate) fn event_subscription(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = REQUIRED_EVENTS.to_vec();
        for extra in &self.extra_events {
            if !kinds.contains(extra) {
                kinds.push(extra.clone());
            }
        }
        kinds
    }

    /// Enqueue one action onto the LIFO stack, applying the coalescing
    /// rules.
    pub(crate) fn enqueue(self: &Arc<Self>, action: Action) -> Result<ActionHandle, Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        let job = ActionJob::new(self.next_job_id.fetch_add(1, Ordering::SeqCst), action);
        self.emit_execute(&job);

        {
            let executing = self.executing.lock().expect("poisoned lock").clone();
            if let Some(current) = executing {
                if current.state() == JobState::Executing {
                    if current.action().same_group(action) {
                        // Same-group duplicates ride along with the
                        // executing job and share its outcome.
                        if current.attach_child(Arc::clone(&job)) {
                            return Ok(ActionHandle { job });
                        }
                    } else if action.is_stop() {
                        // Stop overrides an executing Start/Restart.
                        current.latch_interrupt();
                    }
                }
            }
            self.stack.lock().expect("poisoned lock").push(Arc::clone(&job));
        }
        self.queue_notify.notify_one();
        Ok(ActionHandle { job })
    }

    /// Handle a connectivity transition: schedule the debounced toggle.
    pub(crate) fn on_connectivity(self: &Arc<Self>, connectivity: Connectivity) {
        debug!("connectivity transition: {:?}", connectivity);
        let weak = Arc::downgrade(self);
        self.debouncer.schedule(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(conn) = inner.live_conn() else {
                return;
            };
            let (value, network) = match connectivity {
                Connectivity::Connected => ("0", Network::Enabled),
                Connectivity::Disconnected => ("1", Network::Disabled),
            };
            let cmd = CtrlCommand::SetConf(vec![(
                "DisableNetwork".to_owned(),
                Some(value.to_owned()),
            )]);
            match conn.send_expect_ok(cmd).await {
                Ok(_) => inner.publish_network(network),
                Err(e) => debug!("network toggle failed: {}", e),
            }
        });
    }

    /// Drop this runtime's keeper entry.
    fn unregister(&self) {
        RUNTIMES
            .lock()
            .expect("poisoned lock")
            .remove(self.env.fid().as_str());
    }
}

/// Builder for a [`DaemonMgr`].
pub struct DaemonMgrBuilder {
    /// Where the daemon lives.
    env: TorEnv,
    /// Locates the tor binary.
    installer: Option<Arc<dyn ResourceInstaller>>,
    /// The configuration generator under construction.
    generator: ConfigGenerator,
    /// Issue `TAKEOWNERSHIP` after authentication.
    take_ownership: bool,
    /// Extra daemon events to subscribe to.
    extra_events: Vec<EventKind>,
    /// The connectivity source.
    observer: Option<Arc<dyn NetworkObserver>>,
}

impl DaemonMgrBuilder {
    /// Supply the resource installer. Required.
    pub fn installer(mut self, installer: Arc<dyn ResourceInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Register a configuration hook; hooks run in registration order.
    pub fn config(mut self, hook: impl Fn(&mut TorrcBuilder) + Send + Sync + 'static) -> Self {
        self.generator = self.generator.config_hook(hook);
        self
    }

    /// Replace the whole generator (probe, geoip policy, hooks).
    pub fn generator(mut self, generator: ConfigGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Take ownership of the daemon, so it exits with the control
    /// connection.
    pub fn take_ownership(mut self, take: bool) -> Self {
        self.take_ownership = take;
        self
    }

    /// Subscribe to additional daemon events beyond the required set.
    pub fn events(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.extra_events.extend(kinds);
        self
    }

    /// Attach a connectivity observer.
    pub fn network_observer(mut self, observer: Arc<dyn NetworkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the runtime, register it in the per-fid keeper, and spawn
    /// its processor loop.
    ///
    /// Fails if another live runtime exists for the same environment, or
    /// if no installer was supplied.
    pub fn build(self) -> Result<DaemonMgr, Error> {
        let Some(installer) = self.installer else {
            return Err(Error::IllegalState(
                "a resource installer is required".to_owned(),
            ));
        };
        let fid = self.env.fid().clone();

        let mut keeper = RUNTIMES.lock().expect("poisoned lock");
        keeper.retain(|_, weak| weak.upgrade().is_some());
        if keeper.contains_key(fid.as_str()) {
            return Err(Error::AlreadyExists {
                fid: fid.as_str().to_owned(),
            });
        }

        let (status, status_rx) = StatusPublisher::new();
        let static_tag = format!("tord.{}", fid);
        let env = self.env;
        let generator = self.generator;
        let take_ownership = self.take_ownership;
        let extra_events = self.extra_events;
        let observer = self.observer;

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let status_weak = weak.clone();
            let log_weak = weak.clone();
            let supervisor = Supervisor::new(generator, installer)
                .with_status_sink(move |proc_status| {
                    let Some(inner) = status_weak.upgrade() else {
                        return;
                    };
                    match proc_status {
                        ProcStatus::Starting => {
                            inner.publish_daemon(Daemon::Starting);
                            inner.publish_network(Network::Disabled);
                        }
                        ProcStatus::Off => inner.publish_daemon(Daemon::Off),
                        _ => unreachable!("ProcStatus is non_exhaustive but has no other variants"),
                    }
                })
                .with_log_sink(Arc::new(move |stream, line: &str| {
                    let Some(inner) = log_weak.upgrade() else {
                        return;
                    };
                    let event = match stream {
                        ProcessStream::Stdout => LogEvent::Stdout(line.to_owned()),
                        ProcessStream::Stderr => LogEvent::Stderr(line.to_owned()),
                        _ => unreachable!("ProcessStream is non_exhaustive but has no other variants"),
                    };
                    inner.emit(RuntimeEvent::Log(event));
                }));
            RuntimeInner {
                env,
                supervisor,
                take_ownership,
                extra_events,
                observer,
                net_detach: Mutex::new(None),
                debouncer: Debouncer::default(),
                status,
                status_rx: Mutex::new(status_rx),
                subscribers: Subscribers::new(static_tag),
                listeners: Mutex::new(TorListeners::default()),
                live: Mutex::new(None),
                stack: Mutex::new(Vec::new()),
                executing: Mutex::new(None),
                queue_notify: Notify::new(),
                next_job_id: AtomicU64::new(1),
                conn_epoch: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                destroy_notify: Notify::new(),
            }
        });
        keeper.insert(fid.as_str().to_owned(), Arc::downgrade(&inner));
        drop(keeper);

        tokio::spawn(runner::run_loop(Arc::clone(&inner)));

        if let Some(observer) = inner.observer.clone() {
            let weak = Arc::downgrade(&inner);
            let detach = observer.attach(Arc::new(move |connectivity| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connectivity(connectivity);
                }
            }));
            *inner.net_detach.lock().expect("poisoned lock") = Some(detach);
        }

        inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnCreate));
        Ok(DaemonMgr { inner })
    }
}

/// One environment's runtime: at most one daemon, one control session,
/// and a queue of lifecycle actions.
///
/// Cheap to clone. Building a second `DaemonMgr` for the same
/// environment fails while the first is alive.
#[derive(Clone)]
pub struct DaemonMgr {
    /// Shared runtime state.
    inner: Arc<RuntimeInner>,
}

impl DaemonMgr {
    /// Start building a runtime for `env`.
    pub fn builder(env: TorEnv) -> DaemonMgrBuilder {
        DaemonMgrBuilder {
            env,
            installer: None,
            generator: ConfigGenerator::new(),
            take_ownership: false,
            extra_events: Vec::new(),
            observer: None,
        }
    }

    /// The environment this runtime drives.
    pub fn env(&self) -> &TorEnv {
        &self.inner.env
    }

    /// The environment's identity.
    pub fn fid(&self) -> &Fid {
        self.inner.env.fid()
    }

    /// The tag that exempts subscribers from bulk unsubscribe.
    pub fn static_tag(&self) -> &str {
        self.inner.subscribers.static_tag()
    }

    /// Enqueue an action.
    pub fn enqueue(&self, action: Action) -> Result<ActionHandle, Error> {
        self.inner.enqueue(action)
    }

    /// Enqueue a Start.
    pub fn start(&self) -> Result<ActionHandle, Error> {
        self.enqueue(Action::Start)
    }

    /// Enqueue a Stop.
    pub fn stop(&self) -> Result<ActionHandle, Error> {
        self.enqueue(Action::Stop)
    }

    /// Enqueue a Restart.
    pub fn restart(&self) -> Result<ActionHandle, Error> {
        self.enqueue(Action::Restart)
    }

    /// The current state snapshot.
    pub fn status(&self) -> DaemonStatus {
        self.inner.status.current()
    }

    /// A stream of state snapshots.
    pub fn status_events(&self) -> StatusEvents {
        StatusEvents {
            inner: self.inner.status_rx.lock().expect("poisoned lock").clone(),
        }
    }

    /// True while a live control session exists.
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// True iff bootstrap is complete and the network is enabled.
    pub fn is_ready(&self) -> bool {
        self.status().ready()
    }

    /// The currently known listener set.
    pub fn listeners(&self) -> TorListeners {
        self.inner.listeners.lock().expect("poisoned lock").clone()
    }

    /// Send a command on the live control session.
    pub async fn send_command(&self, cmd: CtrlCommand) -> Result<Reply, Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        Ok(conn.send(cmd).await?)
    }

    /// Ask for fresh circuits (`SIGNAL NEWNYM`).
    pub async fn newnym(&self) -> Result<(), Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        conn.send_expect_ok(CtrlCommand::Signal(Signal::NewNym))
            .await?;
        Ok(())
    }

    /// Send a signal to the daemon.
    pub async fn signal(&self, signal: Signal) -> Result<(), Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        conn.send_expect_ok(CtrlCommand::Signal(signal)).await?;
        Ok(())
    }

    /// `GETINFO` one or more keys, decoded into key/value pairs.
    pub async fn get_info(
        &self,
        keys: impl IntoIterator<Item = String>,
    ) -> Result<Vec<(String, String)>, Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        let reply = conn
            .send_expect_ok(CtrlCommand::GetInfo(keys.into_iter().collect()))
            .await?;
        Ok(tor_ctrlproto::parse_info_reply(&reply))
    }

    /// `GETCONF` one or more keywords; keywords at their default decode
    /// as `None`.
    pub async fn get_conf(
        &self,
        keywords: impl IntoIterator<Item = String>,
    ) -> Result<Vec<(String, Option<String>)>, Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        let reply = conn
            .send_expect_ok(CtrlCommand::GetConf(keywords.into_iter().collect()))
            .await?;
        Ok(tor_ctrlproto::parse_conf_reply(&reply))
    }

    /// `SETCONF` keyword/value pairs; a `None` value resets the keyword.
    pub async fn set_conf(
        &self,
        pairs: impl IntoIterator<Item = (String, Option<String>)>,
    ) -> Result<(), Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        conn.send_expect_ok(CtrlCommand::SetConf(pairs.into_iter().collect()))
            .await?;
        Ok(())
    }

    /// `RESETCONF` one or more keywords back to their defaults.
    pub async fn reset_conf(
        &self,
        keywords: impl IntoIterator<Item = String>,
    ) -> Result<(), Error> {
        let conn = self.inner.live_conn().ok_or(Error::NotStarted)?;
        conn.send_expect_ok(CtrlCommand::ResetConf(keywords.into_iter().collect()))
            .await?;
        Ok(())
    }

    /// Wait until the daemon is fully bootstrapped with the network
    /// enabled.
    ///
    /// Resolves immediately when already ready. Callers who need a
    /// bound should wrap this in a timeout.
    pub async fn await_ready(&self) {
        use futures::StreamExt;
        if self.is_ready() {
            return;
        }
        let mut events = self.status_events();
        while let Some(status) = events.next().await {
            if status.ready() {
                break;
            }
        }
    }

    /// Register an event observer; empty `kinds` means all kinds.
    pub fn subscribe(
        &self,
        tag: Option<String>,
        kinds: Vec<RuntimeEventKind>,
        sink: EventSink,
    ) -> SubscriptionId {
        let id = self.inner.subscribers.subscribe(tag, kinds, sink);
        self.inner
            .emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnSubscribed));
        id
    }

    /// Remove one observer.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.inner.subscribers.unsubscribe(id) {
            self.inner
                .emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnUnsubscribed));
        }
    }

    /// Remove every observer with `tag`, except those carrying the
    /// static tag.
    pub fn unsubscribe_all_by_tag(&self, tag: &str) {
        self.inner.subscribers.unsubscribe_all_by_tag(tag);
    }

    /// Destroy the runtime: cancel all jobs, detach the connectivity
    /// observer, tear down the session and daemon, and run the
    /// lifecycle teardown events. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.destroy_notify.notify_one();

        let executing = self.inner.executing.lock().expect("poisoned lock").take();
        if let Some(job) = executing {
            job.request_cancel();
            job.complete(&Err(Error::Cancelled));
        }
        let queued: Vec<_> = self
            .inner
            .stack
            .lock()
            .expect("poisoned lock")
            .drain(..)
            .collect();
        for job in queued {
            job.complete(&Err(Error::Cancelled));
        }

        if let Some(detach) = self.inner.net_detach.lock().expect("poisoned lock").take() {
            detach();
        }
        self.inner.debouncer.cancel();

        let live = self.inner.live.lock().expect("poisoned lock").take();
        if let Some(session) = live {
            self.inner.emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnUnbind));
            session.conn.close().await;
            self.inner.publish_daemon(Daemon::Stopping);
            self.inner
                .supervisor
                .stop(&self.inner.env, &session.child)
                .await;
        }

        self.inner
            .emit(RuntimeEvent::Lifecycle(LifecycleEvent::OnDestroy));
        self.inner.subscribers.clear();
        self.inner.unregister();
    }
}

impl std::fmt::Debug for DaemonMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DaemonMgr(fid={}, status={})",
            self.fid(),
            self.status()
        )
    }
}

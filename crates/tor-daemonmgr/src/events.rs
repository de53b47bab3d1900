//! The runtime's own event taxonomy and the subscriber registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use tor_ctrlproto::CtrlEvent;

use crate::action::{Action, JobState};
use crate::listeners::TorListeners;
use crate::status::DaemonStatus;

/// Lifecycle notifications about the runtime itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LifecycleEvent {
    /// The runtime was built.
    OnCreate,
    /// The runtime reached Started.
    OnStart,
    /// The runtime left Started.
    OnStop,
    /// The runtime was destroyed.
    OnDestroy,
    /// An observer subscribed.
    OnSubscribed,
    /// An observer unsubscribed.
    OnUnsubscribed,
    /// A control connection was bound to the runtime.
    OnBind,
    /// The control connection was released.
    OnUnbind,
}

/// A log line surfaced through the event bus.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LogEvent {
    /// Runtime debug chatter.
    Debug(String),
    /// Runtime informational messages.
    Info(String),
    /// Runtime warnings.
    Warn(String),
    /// Runtime errors.
    Error(String),
    /// A line from the daemon's stdout.
    Stdout(String),
    /// A line from the daemon's stderr.
    Stderr(String),
    /// A daemon process lifecycle note (spawned, exited, signalled).
    Process(String),
}

/// A state change of one [`ActionJob`](crate::ActionHandle).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ExecuteEvent {
    /// The job's id.
    pub id: u64,
    /// What the job does.
    pub action: Action,
    /// Where it now is.
    pub state: JobState,
}

/// Anything the runtime can tell its observers.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum RuntimeEvent {
    /// Runtime lifecycle.
    Lifecycle(LifecycleEvent),
    /// Log lines, ours and the daemon's.
    Log(LogEvent),
    /// Action-job progress.
    Execute(ExecuteEvent),
    /// A published state snapshot.
    State(DaemonStatus),
    /// The typed listener set changed.
    Listeners(TorListeners),
    /// A raw asynchronous event from Tor.
    Tor(CtrlEvent),
}

impl RuntimeEvent {
    /// The kind used for subscription filtering.
    pub fn kind(&self) -> RuntimeEventKind {
        match self {
            RuntimeEvent::Lifecycle(_) => RuntimeEventKind::Lifecycle,
            RuntimeEvent::Log(_) => RuntimeEventKind::Log,
            RuntimeEvent::Execute(_) => RuntimeEventKind::Execute,
            RuntimeEvent::State(_) => RuntimeEventKind::State,
            RuntimeEvent::Listeners(_) => RuntimeEventKind::Listeners,
            RuntimeEvent::Tor(_) => RuntimeEventKind::Tor,
        }
    }
}

/// The kinds of [`RuntimeEvent`], for filtering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum RuntimeEventKind {
    /// [`RuntimeEvent::Lifecycle`]
    Lifecycle,
    /// [`RuntimeEvent::Log`]
    Log,
    /// [`RuntimeEvent::Execute`]
    Execute,
    /// [`RuntimeEvent::State`]
    State,
    /// [`RuntimeEvent::Listeners`]
    Listeners,
    /// [`RuntimeEvent::Tor`]
    Tor,
}

/// An observer's sink.
pub type EventSink = Arc<dyn Fn(&RuntimeEvent) + Send + Sync + 'static>;

/// Identifies one subscription for removal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

/// One registered observer.
struct Subscriber {
    /// The subscription id.
    id: SubscriptionId,
    /// The observer's tag, if any. Observers tagged with the registry's
    /// static tag survive bulk unsubscribes.
    tag: Option<String>,
    /// Which kinds the observer wants; empty means all.
    kinds: Vec<RuntimeEventKind>,
    /// Where events go.
    sink: EventSink,
}

/// The registry of event observers.
pub(crate) struct Subscribers {
    /// The tag that exempts observers from bulk unsubscribe.
    static_tag: String,
    /// Registered observers.
    list: Mutex<Vec<Subscriber>>,
    /// Id source.
    next_id: AtomicU64,
}

impl Subscribers {
    /// A registry whose static tag is `static_tag`.
    pub(crate) fn new(static_tag: String) -> Self {
        Subscribers {
            static_tag,
            list: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The registry's static tag.
    pub(crate) fn static_tag(&self) -> &str {
        &self.static_tag
    }

    /// Register an observer; empty `kinds` subscribes to everything.
    pub(crate) fn subscribe(
        &self,
        tag: Option<String>,
        kinds: Vec<RuntimeEventKind>,
        sink: EventSink,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.list.lock().expect("poisoned lock").push(Subscriber {
            id,
            tag,
            kinds,
            sink,
        });
        id
    }

    /// Remove one observer. Returns true if it existed.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.lock().expect("poisoned lock");
        let before = list.len();
        list.retain(|s| s.id != id);
        list.len() != before
    }

    /// Remove every observer carrying `tag`, except those whose tag is
    /// the registry's static tag; those only go away on destroy.
    pub(crate) fn unsubscribe_all_by_tag(&self, tag: &str) {
        if tag == self.static_tag {
            trace!("ignoring bulk unsubscribe of the static tag");
            return;
        }
        self.list
            .lock()
            .expect("poisoned lock")
            .retain(|s| s.tag.as_deref() != Some(tag));
    }

    /// Remove everyone; used on destroy.
    pub(crate) fn clear(&self) {
        self.list.lock().expect("poisoned lock").clear();
    }

    /// Number of registered observers.
    pub(crate) fn len(&self) -> usize {
        self.list.lock().expect("poisoned lock").len()
    }

    /// Deliver one event to every matching observer.
    ///
    /// The list is snapshotted under the lock; sinks run outside it.
    pub(crate) fn emit(&self, event: &RuntimeEvent) {
        let kind = event.kind();
        let sinks: Vec<EventSink> = {
            let list = self.list.lock().expect("poisoned lock");
            list.iter()
                .filter(|s| s.kinds.is_empty() || s.kinds.contains(&kind))
                .map(|s| Arc::clone(&s.sink))
                .collect()
        };
        for sink in sinks {
            sink(event);
        }
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
    use std::sync::atomic::AtomicUsize;

    fn counting_sink() -> (EventSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        (
            Arc::new(move |_e: &RuntimeEvent| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn filtering_by_kind() {
        let subs = Subscribers::new("static".into());
        let (sink, count) = counting_sink();
        subs.subscribe(None, vec![RuntimeEventKind::Lifecycle], sink);
        subs.emit(&RuntimeEvent::Lifecycle(LifecycleEvent::OnCreate));
        subs.emit(&RuntimeEvent::Log(LogEvent::Info("x".into())));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_filter_means_everything() {
        let subs = Subscribers::new("static".into());
        let (sink, count) = counting_sink();
        subs.subscribe(None, vec![], sink);
        subs.emit(&RuntimeEvent::Lifecycle(LifecycleEvent::OnCreate));
        subs.emit(&RuntimeEvent::Log(LogEvent::Info("x".into())));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn static_tag_survives_bulk_unsubscribe() {
        let subs = Subscribers::new("static".into());
        let (sink_a, _) = counting_sink();
        let (sink_b, _) = counting_sink();
        let (sink_c, _) = counting_sink();
        subs.subscribe(Some("static".into()), vec![], sink_a);
        subs.subscribe(Some("app".into()), vec![], sink_b);
        subs.subscribe(Some("app".into()), vec![], sink_c);
        assert_eq!(subs.len(), 3);

        subs.unsubscribe_all_by_tag("app");
        assert_eq!(subs.len(), 1);

        // The static tag cannot be bulk-removed ...
        subs.unsubscribe_all_by_tag("static");
        assert_eq!(subs.len(), 1);

        // ... only destroyed.
        subs.clear();
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn unsubscribe_by_id() {
        let subs = Subscribers::new("static".into());
        let (sink, count) = counting_sink();
        let id = subs.subscribe(None, vec![], sink);
        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        subs.emit(&RuntimeEvent::Lifecycle(LifecycleEvent::OnCreate));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

//! Connectivity observation and the debounced `DisableNetwork` toggle.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// How long connectivity must hold still before we talk to Tor about it.
pub(crate) const DEBOUNCE: Duration = Duration::from_millis(300);

/// The host's view of its network connectivity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Connectivity {
    /// The host believes it can reach the network.
    Connected,
    /// The host believes it is offline.
    Disconnected,
}

/// A sink for connectivity transitions.
pub type NetSink = std::sync::Arc<dyn Fn(Connectivity) + Send + Sync + 'static>;

/// A platform-specific connectivity source.
///
/// Implementations wrap whatever the OS offers (netlink,
/// `NWPathMonitor`, polling) and push transitions into the sink the
/// runtime attaches. The returned detach closure must stop the pushes;
/// the runtime calls it on destroy.
pub trait NetworkObserver: Send + Sync {
    /// The current state, consulted at attach time and on Start.
    fn current(&self) -> Connectivity;

    /// Attach a sink; returns the detach closure.
    fn attach(&self, sink: NetSink) -> Box<dyn FnOnce() + Send>;
}

/// Runs at most one pending debounced job; scheduling a new one cancels
/// the old.
#[derive(Default)]
pub(crate) struct Debouncer {
    /// The currently scheduled job, if any.
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Schedule `job` to run after the debounce window; any previously
    /// scheduled job is cancelled.
    pub(crate) fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            job.await;
        });
        let mut pending = self.pending.lock().expect("poisoned lock");
        if let Some(old) = pending.replace(handle) {
            trace!("debounce: superseding a scheduled network toggle");
            old.abort();
        }
    }

    /// Cancel any scheduled job.
    pub(crate) fn cancel(&self) {
        if let Some(old) = self.pending.lock().expect("poisoned lock").take() {
            old.abort();
        }
    }
}

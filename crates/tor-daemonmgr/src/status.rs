//! The published daemon state, and the guard that keeps its transitions
//! honest.

use std::fmt::{self, Display};
use std::sync::Mutex;

use educe::Educe;
use futures::{Stream, StreamExt};
use tracing::trace;

/// The daemon half of the state: lifecycle plus bootstrap progress.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Daemon {
    /// No daemon process exists.
    #[default]
    Off,
    /// A start attempt is underway.
    Starting,
    /// The daemon runs; bootstrap progress in percent.
    On(u8),
    /// A stop is underway.
    Stopping,
}

impl Display for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Daemon::Off => write!(f, "Off"),
            Daemon::Starting => write!(f, "Starting"),
            Daemon::On(pct) => write!(f, "On({}%)", pct),
            Daemon::Stopping => write!(f, "Stopping"),
        }
    }
}

/// The network half of the state: whether `DisableNetwork` is lifted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Network {
    /// `DisableNetwork 1` is in force.
    #[default]
    Disabled,
    /// The daemon may touch the network.
    Enabled,
}

/// One published snapshot of the runtime's state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DaemonStatus {
    /// The daemon lifecycle state.
    pub daemon: Daemon,
    /// The network toggle.
    pub network: Network,
}

impl DaemonStatus {
    /// True iff the daemon is fully bootstrapped *and* the network is
    /// enabled. Goes false again the moment either stops holding.
    pub fn ready(&self) -> bool {
        self.daemon == Daemon::On(100) && self.network == Network::Enabled
    }
}

impl Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.daemon, self.network)
    }
}

/// Decide whether a proposed daemon transition may be applied.
///
/// The daemon never moves by more than one lifecycle step per
/// notification; disallowed proposals are dropped without notifying.
fn transition_allowed(current: Daemon, proposed: Daemon) -> bool {
    use Daemon::*;
    if current == proposed {
        return false;
    }
    match (current, proposed) {
        // Bootstrap can only be reported by a running daemon.
        (On(_), Starting) => false,
        (Off, On(_)) | (Off, Stopping) => false,
        (Stopping, On(_)) => false,
        _ => true,
    }
}

/// Publishes [`DaemonStatus`] snapshots: a guarded update path plus a
/// watch channel for streams.
#[derive(Educe)]
#[educe(Debug)]
pub(crate) struct StatusPublisher {
    /// The authoritative current state.
    #[educe(Debug(ignore))]
    state: Mutex<DaemonStatus>,
    /// The watch sender feeding [`StatusEvents`] streams.
    #[educe(Debug(ignore))]
    tx: Mutex<postage::watch::Sender<DaemonStatus>>,
}

impl StatusPublisher {
    /// A publisher starting at `Off`/`Disabled`, plus one receiver.
    pub(crate) fn new() -> (Self, postage::watch::Receiver<DaemonStatus>) {
        let (tx, rx) = postage::watch::channel();
        (
            StatusPublisher {
                state: Mutex::new(DaemonStatus::default()),
                tx: Mutex::new(tx),
            },
            rx,
        )
    }

    /// The current snapshot.
    pub(crate) fn current(&self) -> DaemonStatus {
        *self.state.lock().expect("poisoned lock")
    }

    /// Propose a daemon transition. Returns the new snapshot if it was
    /// applied.
    ///
    /// The watch channel is written while the state lock is held, so two
    /// racing updates notify in the order their diffs committed; only the
    /// observers run outside the lock.
    pub(crate) fn update_daemon(&self, proposed: Daemon) -> Option<DaemonStatus> {
        let mut st = self.state.lock().expect("poisoned lock");
        if !transition_allowed(st.daemon, proposed) {
            trace!("dropping daemon transition {} -> {}", st.daemon, proposed);
            return None;
        }
        st.daemon = proposed;
        if proposed == Daemon::Off {
            // No daemon, no network.
            st.network = Network::Disabled;
        }
        let next = *st;
        self.notify(next);
        Some(next)
    }

    /// Propose a network transition.
    pub(crate) fn update_network(&self, proposed: Network) -> Option<DaemonStatus> {
        let mut st = self.state.lock().expect("poisoned lock");
        if st.network == proposed {
            return None;
        }
        st.network = proposed;
        let next = *st;
        self.notify(next);
        Some(next)
    }

    /// Push a snapshot into the watch channel. Callers hold the state
    /// lock.
    fn notify(&self, snapshot: DaemonStatus) {
        let mut tx = self.tx.lock().expect("poisoned lock");
        *tx.borrow_mut() = snapshot;
    }
}

/// A [`Stream`] of [`DaemonStatus`] snapshots.
///
/// Not every intermediate snapshot is guaranteed to be observed: a slow
/// reader sees the most recent one.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct StatusEvents {
    /// The receiver implementing the stream.
    #[educe(Debug(ignore))]
    pub(crate) inner: postage::watch::Receiver<DaemonStatus>,
}

impl Stream for StatusEvents {
    type Item = DaemonStatus;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

//! Start/Stop/Restart jobs and their state machines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::err::Error;

/// What a job asks the runtime to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Action {
    /// Bring the daemon up (no-op when already Started).
    Start,
    /// Tear the daemon down (no-op when already Off).
    Stop,
    /// Stop, then Start with a freshly generated configuration.
    Restart,
}

impl Action {
    /// True for the one action that can neither be cancelled nor
    /// interrupted once executing.
    pub(crate) fn is_stop(self) -> bool {
        self == Action::Stop
    }

    /// Jobs in the same group attach to each other rather than queueing
    /// twice: Stop with Stop, Start/Restart with Start/Restart.
    pub(crate) fn same_group(self, other: Action) -> bool {
        self.is_stop() == other.is_stop()
    }
}

/// Where a job is in its life.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum JobState {
    /// On the stack, not yet picked up.
    Enqueued,
    /// The processor is working on it.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Errored,
    /// Cancelled before or while executing.
    Cancelled,
    /// A Start/Restart cut short by a Stop.
    Interrupted,
}

impl JobState {
    /// True once the job can no longer change state.
    fn is_terminal(self) -> bool {
        !matches!(self, JobState::Enqueued | JobState::Executing)
    }
}

/// One enqueued action.
pub(crate) struct ActionJob {
    /// Queue-unique id.
    id: u64,
    /// What to do.
    action: Action,
    /// Current state.
    state: Mutex<JobState>,
    /// Latched by `cancel`; observed at the next checkpoint.
    cancel: AtomicBool,
    /// Latched when a Stop overtakes this executing Start/Restart.
    interrupt: AtomicBool,
    /// The final outcome, once there is one.
    result: Mutex<Option<Result<(), Error>>>,
    /// Waiters to complete with the outcome.
    waiters: Mutex<Vec<oneshot::Sender<Result<(), Error>>>>,
    /// Jobs that attached to this one; they complete after it, with the
    /// same outcome.
    children: Mutex<Vec<Arc<ActionJob>>>,
}

impl std::fmt::Debug for ActionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActionJob#{}({:?}, {:?})", self.id, self.action, self.state())
    }
}

impl ActionJob {
    /// Build a fresh `Enqueued` job.
    pub(crate) fn new(id: u64, action: Action) -> Arc<Self> {
        Arc::new(ActionJob {
            id,
            action,
            state: Mutex::new(JobState::Enqueued),
            cancel: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            result: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    /// The queue-unique id.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// What this job does.
    pub(crate) fn action(&self) -> Action {
        self.action
    }

    /// The current state.
    pub(crate) fn state(&self) -> JobState {
        *self.state.lock().expect("poisoned lock")
    }

    /// Try `Enqueued → Executing`; false if the job already finished
    /// (e.g. was cancelled on the stack).
    pub(crate) fn try_execute(&self) -> bool {
        let mut st = self.state.lock().expect("poisoned lock");
        if *st == JobState::Enqueued {
            *st = JobState::Executing;
            true
        } else {
            false
        }
    }

    /// Latch a cancellation request.
    ///
    /// Start and Restart honor it at their next checkpoint; an executing
    /// Stop ignores it.
    pub(crate) fn request_cancel(&self) {
        if self.action.is_stop() && self.state() == JobState::Executing {
            trace!("ignoring cancel of executing stop job #{}", self.id);
            return;
        }
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Latch the Stop-overrides-Start interruption marker.
    pub(crate) fn latch_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// True if a cancellation has been latched.
    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// The cooperative checkpoint: called between every I/O step of an
    /// executing job.
    pub(crate) fn check_cancellation_or_interrupt(&self) -> Result<(), Error> {
        if self.interrupt.load(Ordering::SeqCst) && !self.action.is_stop() {
            return Err(Error::Interrupted);
        }
        if self.cancel.load(Ordering::SeqCst) && !self.action.is_stop() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Attach another job to complete alongside this one.
    ///
    /// Returns false if this job already finished; the caller must then
    /// handle the would-be child itself.
    pub(crate) fn attach_child(&self, child: Arc<ActionJob>) -> bool {
        // Held across the push so completion cannot slip in between the
        // terminal check and the attach.
        let st = self.state.lock().expect("poisoned lock");
        if st.is_terminal() {
            return false;
        }
        trace!("job #{} attaches to #{}", child.id, self.id);
        self.children.lock().expect("poisoned lock").push(child);
        true
    }

    /// Finish the job (and then its children, in attach order) with one
    /// shared outcome. Idempotent.
    pub(crate) fn complete(&self, outcome: &Result<(), Error>) {
        let (waiters, children) = {
            let mut st = self.state.lock().expect("poisoned lock");
            if st.is_terminal() {
                return;
            }
            *st = match outcome {
                Ok(()) => JobState::Completed,
                Err(Error::Cancelled) => JobState::Cancelled,
                Err(Error::Interrupted) => JobState::Interrupted,
                Err(_) => JobState::Errored,
            };
            *self.result.lock().expect("poisoned lock") = Some(outcome.clone());
            (
                std::mem::take(&mut *self.waiters.lock().expect("poisoned lock")),
                std::mem::take(&mut *self.children.lock().expect("poisoned lock")),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        // Children complete after their parent, with the same outcome.
        for child in children {
            child.complete(outcome);
        }
    }

    /// Register for the outcome; fires immediately if already finished.
    fn subscribe(&self) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        let st = self.state.lock().expect("poisoned lock");
        if st.is_terminal() {
            // The result is always set before the state goes terminal.
            if let Some(outcome) = self.result.lock().expect("poisoned lock").clone() {
                let _ = tx.send(outcome);
            }
        } else {
            self.waiters.lock().expect("poisoned lock").push(tx);
        }
        rx
    }
}

/// The caller's handle on an enqueued action.
#[derive(Clone, Debug)]
pub struct ActionHandle {
    /// The underlying job.
    pub(crate) job: Arc<ActionJob>,
}

impl ActionHandle {
    /// The queue-unique id of the job.
    pub fn id(&self) -> u64 {
        self.job.id()
    }

    /// What the job does.
    pub fn action(&self) -> Action {
        self.job.action()
    }

    /// Where the job currently is.
    pub fn state(&self) -> JobState {
        self.job.state()
    }

    /// Ask for cancellation.
    ///
    /// Start/Restart observe it at their next checkpoint; a Stop that is
    /// already executing cannot be cancelled.
    pub fn cancel(&self) {
        self.job.request_cancel();
    }

    /// Wait for the job's outcome.
    pub async fn wait(&self) -> Result<(), Error> {
        match self.job.subscribe().await {
            Ok(outcome) => outcome,
            // The runtime dropped the job without completing it; treat
            // as cancellation.
            Err(_) => Err(Error::Cancelled),
        }
    }
}

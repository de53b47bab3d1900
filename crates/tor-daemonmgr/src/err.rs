//! Runtime errors and their kind taxonomy.

use tor_ctrlconn::ConnError;
use tor_procmgr::ProcError;

/// Classification of a runtime error.
///
/// Callers that need to react programmatically should match on the kind
/// rather than on error details; the details exist for humans.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid setting combination or unresolvable path.
    Config,
    /// The external resource installer failed.
    ResourceInstall,
    /// The daemon could not be spawned, exited early, stayed silent, or
    /// logged a fatal startup line.
    ProcessStart,
    /// The control endpoint could not be discovered in time.
    CtrlDiscovery,
    /// Tor refused our authentication.
    Auth,
    /// A malformed or unexpected reply.
    Protocol,
    /// The control connection died under us.
    ConnectionLost,
    /// An executing Start or Restart was interrupted by a Stop.
    Interrupted,
    /// The job was cancelled by its caller.
    Cancelled,
    /// An operation was attempted in a state that forbids it.
    IllegalState,
    /// A value was rejected outright.
    IllegalArgument,
    /// Plain I/O trouble.
    Io,
}

/// Errors that can report an [`ErrorKind`].
pub trait HasKind {
    /// Classify this error.
    fn kind(&self) -> ErrorKind;
}

/// An error from the runtime.
///
/// `Clone` so that one outcome can fan out to every job attached to the
/// one that failed.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration generation or process startup failed.
    #[error("unable to start tor")]
    Proc(#[from] ProcError),

    /// The control connection failed.
    #[error("control connection error")]
    Conn(#[from] ConnError),

    /// An executing Start/Restart was interrupted by a Stop.
    #[error("interrupted by a queued stop")]
    Interrupted,

    /// The job was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The runtime was in the wrong state for the request.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A second runtime was requested for an environment that already
    /// has a live one.
    #[error("a runtime already exists for environment {fid}")]
    AlreadyExists {
        /// The contested environment identity.
        fid: String,
    },

    /// The runtime is not in the Started state.
    #[error("tor is not started")]
    NotStarted,

    /// The runtime has been destroyed.
    #[error("runtime destroyed")]
    Destroyed,
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Proc(e) => proc_kind(e),
            Error::Conn(e) => conn_kind(e),
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::IllegalState(_)
            | Error::AlreadyExists { .. }
            | Error::NotStarted
            | Error::Destroyed => ErrorKind::IllegalState,
        }
    }
}

/// Classify a supervisor error.
fn proc_kind(e: &ProcError) -> ErrorKind {
    match e {
        ProcError::Config(_) => ErrorKind::Config,
        ProcError::Install(_) => ErrorKind::ResourceInstall,
        ProcError::Spawn(_)
        | ProcError::ExitedEarly { .. }
        | ProcError::NoOutput
        | ProcError::StartupLog { .. } => ErrorKind::ProcessStart,
        ProcError::CtrlFileTimeout
        | ProcError::CtrlFileUnparseable { .. }
        | ProcError::CookieTimeout => ErrorKind::CtrlDiscovery,
        ProcError::Io(_) => ErrorKind::Io,
        _ => ErrorKind::Io,
    }
}

/// Classify a connection error.
fn conn_kind(e: &ConnError) -> ErrorKind {
    match e {
        ConnError::AuthRefused { .. } => ErrorKind::Auth,
        ConnError::Proto(_) | ConnError::CommandRejected { .. } => ErrorKind::Protocol,
        ConnError::ConnectionLost(_) | ConnError::Closed => ErrorKind::ConnectionLost,
        ConnError::AlreadyReading | ConnError::NotAuthenticated { .. } => ErrorKind::IllegalState,
        ConnError::Connect(_) => ErrorKind::Io,
        _ => ErrorKind::Io,
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

    #[test]
    fn kinds_follow_causes() {
        assert_eq!(Error::Interrupted.kind(), ErrorKind::Interrupted);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::NotStarted.kind(), ErrorKind::IllegalState);
        assert_eq!(
            Error::from(ProcError::NoOutput).kind(),
            ErrorKind::ProcessStart
        );
        assert_eq!(
            Error::from(ProcError::CtrlFileTimeout).kind(),
            ErrorKind::CtrlDiscovery
        );
        assert_eq!(
            Error::from(ConnError::AuthRefused {
                status: 515,
                msg: "no".into()
            })
            .kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            Error::from(ConnError::ConnectionLost(None)).kind(),
            ErrorKind::ConnectionLost
        );
    }
}

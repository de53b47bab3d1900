//! Errors from configuration generation and process supervision.

use std::io;
use std::sync::Arc;

use crate::install::InstallError;
use tor_torrc::ConfigError;

/// An error while generating a configuration or starting the daemon.
///
/// Errors are `Clone` so that one failed start can be reported to every
/// job that attached to it.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcError {
    /// The configuration could not be built.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    /// The resource installer failed.
    #[error("tor resources unavailable")]
    Install(#[from] InstallError),

    /// The daemon binary could not be spawned.
    #[error("unable to spawn tor")]
    Spawn(#[source] Arc<io::Error>),

    /// The daemon exited during the startup window.
    #[error("tor exited during startup (exit code {code:?})")]
    ExitedEarly {
        /// The exit code, when the platform reports one.
        code: Option<i32>,
    },

    /// The daemon produced no stdout within the startup budget.
    #[error("tor produced no output")]
    NoOutput,

    /// The daemon's stdout reported a startup failure.
    #[error("tor failed during startup:\n{buffer}")]
    StartupLog {
        /// The accumulated head of the daemon's stdout.
        buffer: String,
    },

    /// The control-port file did not appear, or never became parseable,
    /// within its time budget.
    #[error("control port file was not written in time")]
    CtrlFileTimeout,

    /// The control-port file existed but held no usable endpoint.
    #[error("control port file unparseable: {content:?}")]
    CtrlFileUnparseable {
        /// What the file held.
        content: String,
    },

    /// The cookie file did not appear within its time budget.
    #[error("cookie auth file was not written in time")]
    CookieTimeout,

    /// Filesystem or probe I/O failed.
    #[error("i/o error during startup")]
    Io(#[source] Arc<io::Error>),
}

impl ProcError {
    /// Wrap a filesystem or probe error.
    pub(crate) fn io(e: io::Error) -> Self {
        ProcError::Io(Arc::new(e))
    }
}

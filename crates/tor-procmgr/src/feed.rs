//! Watching the daemon's standard streams during startup.
//!
//! Tor reports configuration problems on stdout before it gets anywhere
//! near the control port, so the supervisor tails stdout from the moment
//! of spawn: the first lines are kept for error reports, `[err]` lines
//! latch a startup failure, and silence past a budget latches one too.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::trace;

use crate::err::ProcError;
use crate::ProcessLogSink;

/// How many stdout lines are kept for error reports.
const MAX_HEAD_LINES: usize = 30;

/// How long the daemon may stay silent before startup is declared dead.
const NO_OUTPUT_TIMEOUT: Duration = Duration::from_millis(1500);

/// The marker of a fatal log line.
const ERR_MARKER: &str = " [err] ";

/// Tor's complaint when a second daemon shares a data directory.
const DUPLICATE_DAEMON: &str =
    "It looks like another Tor process is running with the same data directory";

/// Which standard stream a daemon log line came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProcessStream {
    /// The daemon's stdout.
    Stdout,
    /// The daemon's stderr.
    Stderr,
}

/// Mutable feed state.
#[derive(Default)]
struct FeedState {
    /// The first [`MAX_HEAD_LINES`] lines.
    head: Vec<String>,
    /// Total lines observed.
    lines_seen: usize,
    /// A latched startup failure, if one was detected.
    error: Option<ProcError>,
    /// True once any line arrived.
    got_output: bool,
}

/// A tail of the daemon's stdout with startup-failure latching.
#[derive(Clone)]
pub struct StdoutFeed {
    /// Shared state between the reader task and the supervisor's polls.
    state: Arc<Mutex<FeedState>>,
}

impl StdoutFeed {
    /// Spawn the reader task over a child's stdout.
    ///
    /// Every line also fans out to `sink`.
    pub(crate) fn spawn(stdout: ChildStdout, sink: ProcessLogSink) -> Self {
        let state = Arc::new(Mutex::new(FeedState::default()));
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut first = true;
            loop {
                let next = if first {
                    match tokio::time::timeout(NO_OUTPUT_TIMEOUT, lines.next_line()).await {
                        Ok(r) => r,
                        Err(_elapsed) => {
                            shared
                                .lock()
                                .expect("poisoned lock")
                                .error
                                .get_or_insert(ProcError::NoOutput);
                            // Keep draining; the process may still say
                            // something worth forwarding.
                            lines.next_line().await
                        }
                    }
                } else {
                    lines.next_line().await
                };
                first = false;
                let line = match next {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                trace!("tor stdout: {}", line);
                {
                    let mut st = shared.lock().expect("poisoned lock");
                    st.got_output = true;
                    st.lines_seen += 1;
                    if st.head.len() < MAX_HEAD_LINES {
                        st.head.push(line.clone());
                    }
                    if st.error.is_none()
                        && (line.contains(ERR_MARKER) || line.contains(DUPLICATE_DAEMON))
                    {
                        st.error = Some(ProcError::StartupLog {
                            buffer: st.head.join("\n"),
                        });
                    }
                }
                sink(ProcessStream::Stdout, &line);
            }
        });
        StdoutFeed { state }
    }

    /// The latched startup failure, if any.
    pub fn startup_error(&self) -> Option<ProcError> {
        self.state.lock().expect("poisoned lock").error.clone()
    }

    /// How many lines have arrived so far.
    pub fn lines_seen(&self) -> usize {
        self.state.lock().expect("poisoned lock").lines_seen
    }

    /// The retained head of the output.
    pub fn head(&self) -> String {
        self.state.lock().expect("poisoned lock").head.join("\n")
    }
}

/// Forward a child's stderr to the log sink, line by line.
pub(crate) fn drain_stderr(stderr: ChildStderr, sink: ProcessLogSink) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            trace!("tor stderr: {}", line);
            sink(ProcessStream::Stderr, &line);
        }
    });
}

#[cfg(all(test, unix))]
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
    use std::process::Stdio;

    async fn feed_for(script: &str) -> (StdoutFeed, Arc<Mutex<Vec<String>>>) {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProcessLogSink = Arc::new(move |_stream, line: &str| {
            sink_seen.lock().unwrap().push(line.to_owned());
        });
        let feed = StdoutFeed::spawn(child.stdout.take().unwrap(), sink);
        // Let the child finish and the feed drain.
        let _ = child.wait().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        (feed, seen)
    }

    #[tokio::test]
    async fn err_marker_latches_with_buffer() {
        let (feed, seen) = feed_for(
            "printf 'Jan 01 00:00:00.000 [notice] Starting\\n\
             Jan 01 00:00:00.000 [err] Reading config failed\\n'",
        )
        .await;
        let err = feed.startup_error().unwrap();
        match err {
            ProcError::StartupLog { buffer } => {
                assert!(buffer.contains("[notice] Starting"));
                assert!(buffer.contains("[err] Reading config failed"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_daemon_latches() {
        let (feed, _) = feed_for(
            "echo 'It looks like another Tor process is running with the same data directory'",
        )
        .await;
        assert!(matches!(
            feed.startup_error(),
            Some(ProcError::StartupLog { .. })
        ));
    }

    #[tokio::test]
    async fn clean_output_latches_nothing() {
        let (feed, _) = feed_for("printf 'a\\nb\\nc\\n'").await;
        assert!(feed.startup_error().is_none());
        assert_eq!(feed.lines_seen(), 3);
    }

    #[tokio::test]
    async fn silence_latches_no_output() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 3")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let sink: ProcessLogSink = Arc::new(|_, _| {});
        let feed = StdoutFeed::spawn(child.stdout.take().unwrap(), sink);
        tokio::time::sleep(NO_OUTPUT_TIMEOUT + Duration::from_millis(200)).await;
        assert!(matches!(feed.startup_error(), Some(ProcError::NoOutput)));
        let _ = child.kill().await;
    }
}

//! Execution targets for scripts
//!
//! A [`Transport`] runs one script and reports what it printed. The local host
//! and an established SSH session are the two implementations; callers only
//! see the trait.

pub mod local;
pub mod ssh;

use crate::context::CallContext;
use crate::error::Result;
use crate::logging::OUTPUT_TARGET;
use crate::models::{ExecutionResult, Logging};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

pub use local::LocalTransport;
pub use ssh::SshTransport;

/// One script invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub script: String,
    /// User-declared environment; applied last so it wins
    pub environment: BTreeMap<String, String>,
    /// Previous-run output variables; best effort on remote hosts
    pub previous_output: Vec<(String, String)>,
    pub dir: Option<String>,
    pub stdin: Option<String>,
    /// Argv prefix; `None` selects the platform default (local) or raw exec (remote)
    pub interpreter: Option<Vec<String>>,
    pub logging: Logging,
}

/// A place scripts can run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run the script to completion.
    ///
    /// A non-zero exit status is reported in the result, not as an error.
    /// Cancellation and deadline expiry return errors carrying the partial
    /// output captured so far.
    async fn run(&self, request: &RunRequest, ctx: &CallContext) -> Result<ExecutionResult>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;

    /// Release the underlying connection
    async fn close(&self);
}

/// Accumulates one output stream and logs complete lines as they arrive.
#[derive(Debug)]
pub(crate) struct StreamCapture {
    stream: &'static str,
    log: bool,
    buf: Vec<u8>,
    logged: usize,
}

impl StreamCapture {
    pub(crate) fn stdout(logging: Logging) -> Self {
        Self::new("stdout", logging.logs_stdout())
    }

    pub(crate) fn stderr(logging: Logging) -> Self {
        Self::new("stderr", logging.logs_stderr())
    }

    fn new(stream: &'static str, log: bool) -> Self {
        Self {
            stream,
            log,
            buf: Vec::new(),
            logged: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if !self.log {
            return;
        }
        while let Some(pos) = self.buf[self.logged..].iter().position(|b| *b == b'\n') {
            let end = self.logged + pos;
            self.emit(self.logged, end);
            self.logged = end + 1;
        }
    }

    fn emit(&self, start: usize, end: usize) {
        let line = String::from_utf8_lossy(&self.buf[start..end]);
        info!(target: OUTPUT_TARGET, stream = self.stream, "{}", line.trim_end_matches('\r'));
    }

    pub(crate) fn finish(self) -> String {
        if self.log && self.logged < self.buf.len() {
            self.emit(self.logged, self.buf.len());
        }
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_keeps_bytes_verbatim() {
        let mut capture = StreamCapture::stdout(Logging::StdoutAndStderr);
        capture.push(b"hel");
        capture.push(b"lo\nwor");
        capture.push(b"ld");
        assert_eq!(capture.logged, 6);
        assert_eq!(capture.finish(), "hello\nworld");
    }

    #[test]
    fn test_capture_without_logging_still_captures() {
        let mut capture = StreamCapture::stderr(Logging::Stdout);
        capture.push(b"a\nb\n");
        assert_eq!(capture.logged, 0);
        assert_eq!(capture.finish(), "a\nb\n");
    }

    #[test]
    fn test_run_request_default_has_no_interpreter() {
        let request = RunRequest::default();
        assert!(request.interpreter.is_none());
        assert_eq!(request.logging, Logging::StdoutAndStderr);
    }
}

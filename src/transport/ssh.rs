//! Remote execution over an established SSH session
//!
//! Environment variables are sent as `env` channel requests. Servers commonly
//! restrict which names they accept (`AcceptEnv`), so a rejected
//! previous-output variable is only logged, while a rejected user variable
//! fails the call.
//!
//! The command line is the raw script, or the shell-quoted interpreter argv
//! followed by the quoted script. With a working directory the command is
//! prefixed by a `cd`, after checking over SFTP that the directory exists
//! (when the server offers SFTP).

use super::{RunRequest, StreamCapture, Transport};
use crate::connector::SshSession;
use crate::context::CallContext;
use crate::error::{CommandError, Result};
use crate::models::ExecutionResult;
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, Session};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `LIBSSH2_FX_NO_SUCH_FILE`
pub(crate) const SFTP_NO_SUCH_FILE: i32 = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs scripts on a remote host
pub struct SshTransport {
    host: String,
    session: Arc<Mutex<Option<SshSession>>>,
}

impl SshTransport {
    pub fn new(session: SshSession) -> Self {
        Self {
            host: session.host.clone(),
            session: Arc::new(Mutex::new(Some(session))),
        }
    }
}

/// Build the remote command line for `request`
pub fn remote_command(request: &RunRequest) -> String {
    let command = match &request.interpreter {
        Some(argv) if !argv.is_empty() => shell_words::join(
            argv.iter()
                .map(String::as_str)
                .chain(std::iter::once(request.script.as_str())),
        ),
        _ => request.script.clone(),
    };

    match &request.dir {
        Some(dir) => format!("cd {} || exit 1\n{}", shell_words::quote(dir), command),
        None => command,
    }
}

fn ssh_error(host: &str, context: &str, e: impl std::fmt::Display) -> CommandError {
    CommandError::Ssh {
        host: host.to_string(),
        message: format!("{}: {}", context, e),
    }
}

/// Fail with `MissingDirectory` when SFTP reports that `dir` does not exist.
/// Any other SFTP problem skips the check; the `cd` still guards the script.
fn check_remote_dir(session: &Session, dir: &str) -> Result<()> {
    let sftp = match session.sftp() {
        Ok(sftp) => sftp,
        Err(e) => {
            debug!("SFTP unavailable, skipping directory check: {}", e);
            return Ok(());
        }
    };
    match sftp.stat(Path::new(dir)) {
        Ok(stat) if stat.is_dir() => Ok(()),
        Ok(_) => Err(CommandError::MissingDirectory {
            path: dir.to_string(),
        }),
        Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => {
            Err(CommandError::MissingDirectory {
                path: dir.to_string(),
            })
        }
        Err(e) => {
            debug!("Unable to stat {} over SFTP: {}", dir, e);
            Ok(())
        }
    }
}

/// Repeat a non-blocking libssh2 call until it stops returning `EAGAIN`
fn until_ready<T>(mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>) -> io::Result<T> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let err = io::Error::from(e);
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Read whatever is available; `Ok(true)` when data was consumed
fn drain<R: Read>(reader: &mut R, capture: &mut StreamCapture, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            capture.push(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

fn exec_blocking(
    session: &Session,
    host: &str,
    request: &RunRequest,
    stop: &AtomicBool,
    deadline: Option<Instant>,
) -> std::result::Result<ExecutionResult, (CommandError, Option<Interrupt>)> {
    let fail = |e: CommandError| (e, None);
    session.set_blocking(true);

    if let Some(dir) = &request.dir {
        check_remote_dir(session, dir).map_err(fail)?;
    }

    let mut channel: Channel = session
        .channel_session()
        .map_err(|e| fail(ssh_error(host, "open channel", e)))?;

    for (key, value) in &request.previous_output {
        if let Err(e) = channel.setenv(key, value) {
            warn!(
                "Unable to set '{}' on {}; the server may not accept it: {}",
                key, host, e
            );
        }
    }
    for (key, value) in &request.environment {
        channel
            .setenv(key, value)
            .map_err(|e| fail(ssh_error(host, &format!("unable to set '{}'", key), e)))?;
    }

    let command = remote_command(request);
    debug!("Remote command on {}: {}", host, command);
    channel
        .exec(&command)
        .map_err(|e| fail(ssh_error(host, "exec", e)))?;

    if let Some(input) = &request.stdin {
        if let Err(e) = channel.write_all(input.as_bytes()) {
            debug!("Remote stdin closed early: {}", e);
        }
    }
    channel
        .send_eof()
        .map_err(|e| fail(ssh_error(host, "close stdin", e)))?;

    session.set_blocking(false);
    let mut stdout = StreamCapture::stdout(request.logging);
    let mut stderr = StreamCapture::stderr(request.logging);
    let mut stderr_stream = channel.stderr();
    let mut buf = [0u8; 16 * 1024];

    let interrupt = loop {
        let read_out = drain(&mut channel, &mut stdout, &mut buf);
        let read_err = drain(&mut stderr_stream, &mut stderr, &mut buf);
        let progressed = match (read_out, read_err) {
            (Ok(a), Ok(b)) => a || b,
            (Err(e), _) | (_, Err(e)) => {
                session.set_blocking(true);
                return Err(fail(ssh_error(host, "read output", e)));
            }
        };

        if !progressed && channel.eof() {
            break None;
        }
        if stop.load(Ordering::SeqCst) {
            break Some(Interrupt::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break Some(Interrupt::TimedOut);
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    };

    if let Some(interrupt) = interrupt {
        let _ = channel.close();
        session.set_blocking(true);
        let stdout = stdout.finish();
        let stderr = stderr.finish();
        let err = match interrupt {
            Interrupt::Cancelled => CommandError::Cancelled { stdout, stderr },
            Interrupt::TimedOut => CommandError::Timeout {
                after: Duration::ZERO,
                stdout,
                stderr,
            },
        };
        return Err((err, Some(interrupt)));
    }

    let closed = until_ready(|| channel.close()).and_then(|_| until_ready(|| channel.wait_close()));
    session.set_blocking(true);
    closed.map_err(|e| fail(ssh_error(host, "close channel", e)))?;

    let exit_code = channel
        .exit_status()
        .map_err(|e| fail(ssh_error(host, "exit status", e)))?;

    Ok(ExecutionResult {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        exit_code,
    })
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, request: &RunRequest, ctx: &CallContext) -> Result<ExecutionResult> {
        info!("Executing remote command on {}", self.host);
        let start = Instant::now();

        let stop = Arc::new(AtomicBool::new(false));
        let deadline = ctx.remaining().map(|left| Instant::now() + left);
        let job = tokio::task::spawn_blocking({
            let session = self.session.clone();
            let host = self.host.clone();
            let request = request.clone();
            let stop = stop.clone();
            move || {
                let guard = session.lock().unwrap_or_else(|e| e.into_inner());
                let Some(ssh) = guard.as_ref() else {
                    return Err((ssh_error(&host, "run", "session closed"), None));
                };
                exec_blocking(&ssh.session, &host, &request, &stop, deadline)
            }
        });
        tokio::pin!(job);

        let joined = tokio::select! {
            joined = &mut job => joined,
            _ = ctx.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                job.await
            }
        };

        let outcome = joined.map_err(|e| ssh_error(&self.host, "execution task", e))?;
        match outcome {
            Ok(result) => {
                info!(
                    "Remote command on {} completed with exit code {} in {:?}",
                    self.host,
                    result.exit_code,
                    start.elapsed()
                );
                Ok(result)
            }
            Err((CommandError::Timeout { stdout, stderr, .. }, Some(Interrupt::TimedOut))) => {
                Err(CommandError::Timeout {
                    after: ctx.timeout().unwrap_or_else(|| start.elapsed()),
                    stdout,
                    stderr,
                })
            }
            Err((err, _)) => Err(err),
        }
    }

    fn describe(&self) -> String {
        format!("ssh://{}", self.host)
    }

    async fn close(&self) {
        let session = self.session.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = session.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(mut ssh) = guard.take() {
                ssh.disconnect();
            }
        })
        .await;
        if let Err(e) = closed {
            warn!("Closing SSH session to {} failed: {}", self.host, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(script: &str) -> RunRequest {
        RunRequest {
            script: script.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_script_is_sent_verbatim() {
        assert_eq!(remote_command(&request("echo $HOME; ls")), "echo $HOME; ls");
    }

    #[test]
    fn test_interpreter_is_quoted() {
        let req = RunRequest {
            interpreter: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
            ..request("echo 'hi there'")
        };
        assert_eq!(remote_command(&req), "/bin/bash -c 'echo '\\''hi there'\\'''");
    }

    #[test]
    fn test_dir_prefix() {
        let req = RunRequest {
            dir: Some("/srv/my app".to_string()),
            ..request("make")
        };
        assert_eq!(remote_command(&req), "cd '/srv/my app' || exit 1\nmake");
    }

    #[test]
    fn test_empty_interpreter_falls_back_to_raw() {
        let req = RunRequest {
            interpreter: Some(vec![]),
            ..request("uptime")
        };
        assert_eq!(remote_command(&req), "uptime");
    }
}

//! Local process execution
//!
//! Scripts run as `interpreter[0] interpreter[1..] script` in their own process
//! group, so cancellation and timeouts can kill the script together with
//! anything it spawned.

use super::{RunRequest, StreamCapture, Transport};
use crate::context::CallContext;
use crate::error::{CommandError, Result};
use crate::models::ExecutionResult;
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default interpreter for the current platform
pub fn default_interpreter() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string()]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string()]
    }
}

/// Runs scripts on the local host
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_command(request: &RunRequest) -> Result<(String, Command)> {
        let interpreter = request
            .interpreter
            .clone()
            .unwrap_or_else(default_interpreter);
        let Some((program, args)) = interpreter.split_first() else {
            return Err(CommandError::Validation(
                "interpreter must not be empty".to_string(),
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(args).arg(&request.script);

        if let Some(dir) = &request.dir {
            if !Path::new(dir).is_dir() {
                return Err(CommandError::MissingDirectory { path: dir.clone() });
            }
            cmd.current_dir(dir);
        }

        for (key, value) in &request.previous_output {
            cmd.env(key, value);
        }
        for (key, value) in &request.environment {
            cmd.env(key, value);
        }

        cmd.stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        Ok((program.clone(), cmd))
    }
}

fn spawn_reader<R>(mut reader: R, mut capture: StreamCapture) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => capture.push(&buf[..n]),
                Err(e) => {
                    warn!("Error reading process output: {}", e);
                    break;
                }
            }
        }
        capture.finish()
    })
}

/// Kill the child's whole process group, falling back to the child alone
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg only sends a signal; the group id is our own child's pid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return;
        }
        debug!("killpg({}) failed: {}", pid, std::io::Error::last_os_error());
    }
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill child: {}", e);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn run(&self, request: &RunRequest, ctx: &CallContext) -> Result<ExecutionResult> {
        let (program, mut cmd) = Self::build_command(request)?;

        info!("Executing local command in {:?}", request.dir.as_deref().unwrap_or("."));
        debug!("Script: {}", request.script);

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|source| CommandError::Spawn { program, source })?;

        let stdin_task = match (child.stdin.take(), request.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("stdin closed early: {}", e);
                }
                // Dropping the pipe closes the child's stdin
            })),
            _ => None,
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, StreamCapture::stdout(request.logging)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, StreamCapture::stderr(request.logging)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = ctx.cancelled() => Outcome::Cancelled,
            _ = ctx.deadline_elapsed() => Outcome::TimedOut,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            kill_tree(&mut child);
            let _ = child.wait().await;
        }

        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let (stdout, stderr) = futures::future::join(
            async {
                match stdout_task {
                    Some(t) => t.await.unwrap_or_default(),
                    None => String::new(),
                }
            },
            async {
                match stderr_task {
                    Some(t) => t.await.unwrap_or_default(),
                    None => String::new(),
                }
            },
        )
        .await;

        let duration = start.elapsed();
        match outcome {
            Outcome::Exited(Ok(status)) => {
                let exit_code = exit_code(status);
                info!(
                    "Command completed with exit code {} in {:?}",
                    exit_code, duration
                );
                Ok(ExecutionResult {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Outcome::Exited(Err(e)) => {
                error!("Waiting for command failed: {}", e);
                Err(CommandError::Io(e))
            }
            Outcome::Cancelled => {
                warn!("Command cancelled after {:?}", duration);
                Err(CommandError::Cancelled { stdout, stderr })
            }
            Outcome::TimedOut => {
                let after = ctx.timeout().unwrap_or(duration);
                error!("Command timed out after {:?}", after);
                Err(CommandError::Timeout {
                    after,
                    stdout,
                    stderr,
                })
            }
        }
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn close(&self) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::Logging;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(script: &str) -> RunRequest {
        RunRequest {
            script: script.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let result = LocalTransport::new()
            .run(&request("echo hello"), &CallContext::background())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let result = LocalTransport::new()
            .run(&request("echo out; echo err >&2; exit 3"), &CallContext::background())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_environment_user_wins_over_previous_output() {
        let mut environment = BTreeMap::new();
        environment.insert("PULUMI_COMMAND_STDOUT".to_string(), "user".to_string());
        environment.insert("GREETING".to_string(), "hi".to_string());
        let req = RunRequest {
            environment,
            previous_output: vec![("PULUMI_COMMAND_STDOUT".to_string(), "old".to_string())],
            ..request("printf '%s %s' \"$GREETING\" \"$PULUMI_COMMAND_STDOUT\"")
        };
        let result = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi user");
    }

    #[tokio::test]
    async fn test_stdin_is_piped_and_closed() {
        let req = RunRequest {
            stdin: Some("line1\nline2\n".to_string()),
            ..request("wc -l | tr -d ' '")
        };
        let result = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "2");
    }

    #[tokio::test]
    async fn test_dir_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let req = RunRequest {
            dir: Some(dir.path().display().to_string()),
            ..request("pwd")
        };
        let result = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap();
        let reported = std::fs::canonicalize(result.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());

        let req = RunRequest {
            dir: Some("/definitely/not/here".to_string()),
            ..request("pwd")
        };
        let err = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::MissingDirectory { .. }));
    }

    #[tokio::test]
    async fn test_custom_interpreter() {
        let req = RunRequest {
            interpreter: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            logging: Logging::None,
            ..request("echo $0")
        };
        let result = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap();
        assert_eq!(result.stdout, "/bin/sh\n");

        let req = RunRequest {
            interpreter: Some(vec![]),
            ..request("true")
        };
        let err = LocalTransport::new()
            .run(&req, &CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group_and_keeps_output() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(300));
        let start = std::time::Instant::now();
        let err = LocalTransport::new()
            .run(&request("echo started; sleep 30 & sleep 30"), &ctx)
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            CommandError::Timeout { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_output() {
        let (ctx, handle) = CallContext::new();
        let task = tokio::spawn(async move {
            LocalTransport::new()
                .run(&request("echo partial; sleep 30"), &ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
        let err = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        match err {
            CommandError::Cancelled { stdout, .. } => assert_eq!(stdout, "partial\n"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}

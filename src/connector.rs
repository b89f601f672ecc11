//! SSH connection establishment with retry, bastion hops and host-key checks
//!
//! # Dialing
//!
//! Every dial attempt (TCP connect, handshake, host-key check, authentication)
//! runs on a blocking thread, bounded by the endpoint's `perDialTimeout`.
//! Failed attempts are retried with exponential backoff until `dialErrorLimit`
//! attempts have failed, or forever when the limit is -1. Host-key mismatches
//! and unreadable private keys fail immediately.
//!
//! # Bastion hops
//!
//! With a proxy configured the proxy is dialed first, using its own limits.
//! Each target attempt then opens a `direct-tcpip` channel through the proxy
//! and runs the target's SSH session over it. libssh2 sessions need a real
//! file descriptor, so the channel is bridged to one end of a Unix socket pair
//! by a pump thread ([`ProxyTunnel`]).
//!
//! # Authentication
//!
//! A private key (optionally decrypted with `privateKeyPassword`) is tried
//! first, then the password (also answering keyboard-interactive prompts).
//! Only when neither is configured is the SSH agent used, at
//! `agentSocketPath` or `$SSH_AUTH_SOCK`.

use crate::context::CallContext;
use crate::error::{CommandError, Result};
use crate::metrics::ProviderMetrics;
use crate::models::{ConnectionSpec, Endpoint};
use crate::retry::{DialLimit, RetryConfig, RetryState};
use crate::transport::{SshTransport, Transport};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ssh2::{ErrorCode, KeyboardInteractivePrompt, Prompt, Session};
use std::future::Future;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// libssh2 error raised when key material cannot be parsed
const LIBSSH2_ERROR_FILE: i32 = -16;

/// Serializes temporary `SSH_AUTH_SOCK` overrides for agent connections
static AGENT_ENV_LOCK: Mutex<()> = Mutex::new(());

/// Outcome of a single failed dial attempt
#[derive(Debug)]
pub enum DialError {
    /// Worth another attempt
    Retryable(String),
    /// Retrying cannot help
    Fatal(CommandError),
}

/// Opens transports for remote commands
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(
        &self,
        connection: &ConnectionSpec,
        ctx: &CallContext,
    ) -> Result<Box<dyn Transport>>;
}

/// Run `attempt` until it succeeds, fails fatally, or `limit` attempts have failed.
///
/// `label` names the step in retry logs ("Dial", "Dial proxy", ...) and
/// `target` names the endpoint in the final [`CommandError::Connection`].
pub async fn dial_with_retry<T, F, Fut>(
    label: &str,
    target: &str,
    limit: DialLimit,
    config: &RetryConfig,
    ctx: &CallContext,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DialError>>,
{
    let mut state = RetryState::new();
    loop {
        if ctx.is_cancelled() {
            return Err(cancelled());
        }

        let outcome = tokio::select! {
            outcome = attempt() => outcome,
            _ = ctx.cancelled() => return Err(cancelled()),
            _ = ctx.deadline_elapsed() => return Err(deadline(ctx)),
        };

        let cause = match outcome {
            Ok(value) => return Ok(value),
            Err(DialError::Fatal(e)) => return Err(e),
            Err(DialError::Retryable(cause)) => cause,
        };

        state.record_failure();
        if !state.should_retry(limit) {
            return Err(CommandError::Connection {
                target: target.to_string(),
                attempts: state.failures,
                cause,
            });
        }

        info!("{} {}/{} failed: retrying", label, state.failures, limit);
        debug!("{} to {} failed: {}", label, target, cause);

        let delay = state.calculate_delay(config);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => return Err(cancelled()),
            _ = ctx.deadline_elapsed() => return Err(deadline(ctx)),
        }
    }
}

fn cancelled() -> CommandError {
    CommandError::Cancelled {
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn deadline(ctx: &CallContext) -> CommandError {
    CommandError::Timeout {
        after: ctx.timeout().unwrap_or_default(),
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Run a blocking dial step off the async runtime
async fn blocking<T, F>(f: F) -> std::result::Result<T, DialError>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, DialError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(DialError::Retryable(format!("dial task failed: {}", e))))
}

/// An authenticated SSH session, possibly tunnelled through a bastion.
///
/// Fields drop in declaration order: the target session first, then the
/// tunnel pump, then the proxy session.
pub struct SshSession {
    pub(crate) session: Session,
    pub(crate) host: String,
    #[cfg(unix)]
    tunnel: Option<ProxyTunnel>,
    proxy: Option<Session>,
}

impl SshSession {
    /// Disconnect the target and proxy sessions
    pub fn disconnect(&mut self) {
        self.session.set_blocking(true);
        if let Err(e) = self
            .session
            .disconnect(None, "command finished", None)
        {
            debug!("Disconnect from {} failed: {}", self.host, e);
        }
        #[cfg(unix)]
        drop(self.tunnel.take());
        if let Some(proxy) = self.proxy.take() {
            let _ = proxy.disconnect(None, "command finished", None);
        }
    }
}

/// Dials SSH connections for remote commands
#[derive(Clone, Default)]
pub struct SshConnector {
    retry: RetryConfig,
    metrics: Option<ProviderMetrics>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: ProviderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, role: &str, ok: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_dial_attempt(role, if ok { "success" } else { "failure" });
        }
    }

    /// Establish an authenticated session for `connection`
    pub async fn connect(&self, connection: &ConnectionSpec, ctx: &CallContext) -> Result<SshSession> {
        validate_endpoint(&connection.target)?;
        let target = connection.target.clone();

        let Some(proxy) = &connection.proxy else {
            let session = dial_with_retry(
                "Dial",
                &target.address(),
                DialLimit::from_setting(target.dial_error_limit),
                &self.retry,
                ctx,
                || {
                    let endpoint = target.clone();
                    async move {
                        let result = blocking(move || dial_direct(&endpoint)).await;
                        self.record("target", result.is_ok());
                        result
                    }
                },
            )
            .await?;

            info!("SSH session established to {}", target.address());
            return Ok(SshSession {
                session,
                host: target.address(),
                #[cfg(unix)]
                tunnel: None,
                proxy: None,
            });
        };

        validate_endpoint(proxy)?;
        self.connect_via_proxy(proxy.clone(), target, ctx).await
    }

    #[cfg(unix)]
    async fn connect_via_proxy(
        &self,
        proxy: Endpoint,
        target: Endpoint,
        ctx: &CallContext,
    ) -> Result<SshSession> {
        let proxy_session = dial_with_retry(
            "Dial proxy",
            &format!("proxy {}", proxy.address()),
            DialLimit::from_setting(proxy.dial_error_limit),
            &self.retry,
            ctx,
            || {
                let endpoint = proxy.clone();
                async move {
                    let result = blocking(move || dial_direct(&endpoint)).await;
                    self.record("proxy", result.is_ok());
                    result
                }
            },
        )
        .await?;
        info!("SSH session established to proxy {}", proxy.address());

        let (session, tunnel) = dial_with_retry(
            "Dial from proxy",
            &target.address(),
            DialLimit::from_setting(target.dial_error_limit),
            &self.retry,
            ctx,
            || {
                let endpoint = target.clone();
                let proxy_session = proxy_session.clone();
                async move {
                    let result =
                        blocking(move || dial_through(&proxy_session, &endpoint)).await;
                    self.record("target", result.is_ok());
                    result
                }
            },
        )
        .await?;

        info!(
            "SSH session established to {} via {}",
            target.address(),
            proxy.address()
        );
        Ok(SshSession {
            session,
            host: target.address(),
            tunnel: Some(tunnel),
            proxy: Some(proxy_session),
        })
    }

    #[cfg(not(unix))]
    async fn connect_via_proxy(
        &self,
        _proxy: Endpoint,
        _target: Endpoint,
        _ctx: &CallContext,
    ) -> Result<SshSession> {
        Err(CommandError::Validation(
            "proxy connections are only supported on unix hosts".to_string(),
        ))
    }
}

#[async_trait]
impl Dial for SshConnector {
    async fn dial(
        &self,
        connection: &ConnectionSpec,
        ctx: &CallContext,
    ) -> Result<Box<dyn Transport>> {
        let session = self.connect(connection, ctx).await?;
        Ok(Box::new(SshTransport::new(session)))
    }
}

fn validate_endpoint(endpoint: &Endpoint) -> Result<()> {
    if endpoint.host.trim().is_empty() {
        return Err(CommandError::Validation(
            "connection host cannot be empty".to_string(),
        ));
    }
    if endpoint.user.is_empty() {
        return Err(CommandError::Validation(
            "connection user cannot be empty".to_string(),
        ));
    }
    if endpoint.dial_error_limit < -1 {
        return Err(CommandError::Validation(format!(
            "dialErrorLimit must be -1 or greater, got {}",
            endpoint.dial_error_limit
        )));
    }
    Ok(())
}

fn dial_timeout(endpoint: &Endpoint) -> Option<Duration> {
    match endpoint.per_dial_timeout {
        0 => None,
        secs => Some(Duration::from_secs(u64::from(secs))),
    }
}

fn dial_direct(endpoint: &Endpoint) -> std::result::Result<Session, DialError> {
    let timeout = dial_timeout(endpoint);
    let tcp = tcp_connect(endpoint, timeout)
        .map_err(|e| DialError::Retryable(format!("tcp connect: {}", e)))?;
    establish(tcp, endpoint, timeout)
}

fn tcp_connect(endpoint: &Endpoint, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", endpoint.host),
        )
    }))
}

#[cfg(unix)]
fn dial_through(
    proxy: &Session,
    endpoint: &Endpoint,
) -> std::result::Result<(Session, ProxyTunnel), DialError> {
    proxy.set_blocking(true);
    let channel = proxy
        .channel_direct_tcpip(&endpoint.host, endpoint.port, None)
        .map_err(|e| DialError::Retryable(format!("open tunnel: {}", e)))?;
    let (stream, tunnel) = ProxyTunnel::start(proxy.clone(), channel)
        .map_err(|e| DialError::Retryable(format!("start tunnel: {}", e)))?;
    let session = establish(stream, endpoint, dial_timeout(endpoint))?;
    Ok((session, tunnel))
}

/// Handshake, verify the host key and authenticate over an open stream
#[cfg(unix)]
fn establish<S>(
    stream: S,
    endpoint: &Endpoint,
    timeout: Option<Duration>,
) -> std::result::Result<Session, DialError>
where
    S: 'static + std::os::unix::io::AsRawFd,
{
    let mut session = new_session(endpoint, timeout)?;
    session.set_tcp_stream(stream);
    finish_establish(session, endpoint)
}

#[cfg(windows)]
fn establish<S>(
    stream: S,
    endpoint: &Endpoint,
    timeout: Option<Duration>,
) -> std::result::Result<Session, DialError>
where
    S: 'static + std::os::windows::io::AsRawSocket,
{
    let mut session = new_session(endpoint, timeout)?;
    session.set_tcp_stream(stream);
    finish_establish(session, endpoint)
}

fn new_session(
    endpoint: &Endpoint,
    timeout: Option<Duration>,
) -> std::result::Result<Session, DialError> {
    let session = Session::new().map_err(|e| {
        DialError::Retryable(format!("create session for {}: {}", endpoint.address(), e))
    })?;
    if let Some(timeout) = timeout {
        session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    }
    Ok(session)
}

fn finish_establish(
    mut session: Session,
    endpoint: &Endpoint,
) -> std::result::Result<Session, DialError> {
    session
        .handshake()
        .map_err(|e| DialError::Retryable(format!("handshake: {}", e)))?;
    verify_host_key(&session, endpoint)?;
    authenticate(&session, endpoint)?;
    // Per-dial timeout only bounds the dial itself
    session.set_timeout(0);
    Ok(session)
}

/// Decode a configured host key: an `authorized_keys`/`known_hosts` style
/// line (`<type> <base64> [comment]`) or the bare base64 blob.
pub fn parse_host_key(value: &str) -> std::result::Result<Vec<u8>, String> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    let encoded = match tokens.as_slice() {
        [] => return Err("host key is empty".to_string()),
        [blob] => *blob,
        _ => tokens
            .windows(2)
            .find(|pair| is_key_type(pair[0]))
            .map(|pair| pair[1])
            .ok_or_else(|| "host key has no recognizable key type".to_string())?,
    };
    STANDARD
        .decode(encoded)
        .map_err(|e| format!("host key is not valid base64: {}", e))
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-")
        || token.starts_with("ecdsa-")
        || token.starts_with("sk-ssh-")
        || token.starts_with("sk-ecdsa-")
}

fn verify_host_key(session: &Session, endpoint: &Endpoint) -> std::result::Result<(), DialError> {
    let Some(configured) = &endpoint.host_key else {
        return Ok(());
    };
    let expected = parse_host_key(configured)
        .map_err(|e| DialError::Fatal(CommandError::Validation(e)))?;
    let Some((actual, _)) = session.host_key() else {
        return Err(DialError::Retryable(
            "server did not present a host key".to_string(),
        ));
    };

    if actual != expected.as_slice() {
        warn!("Host key mismatch for {}", endpoint.address());
        return Err(DialError::Fatal(CommandError::HostKeyMismatch {
            host: endpoint.address(),
            expected: STANDARD.encode(&expected),
            actual: STANDARD.encode(actual),
        }));
    }
    debug!("Host key verified for {}", endpoint.address());
    Ok(())
}

/// Answers every keyboard-interactive prompt with the configured password
struct PasswordPrompt<'a>(&'a str);

impl KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.to_string()).collect()
    }
}

fn authenticate(session: &Session, endpoint: &Endpoint) -> std::result::Result<(), DialError> {
    let user = endpoint.user.as_str();
    let mut failures: Vec<String> = Vec::new();

    if let Some(key) = &endpoint.private_key {
        match pubkey_auth(session, user, key, endpoint.private_key_password.as_deref()) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push("publickey: not accepted".to_string()),
            Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_FILE) => {
                return Err(DialError::Fatal(CommandError::Authentication {
                    host: endpoint.address(),
                    user: user.to_string(),
                    message: format!("unable to read private key: {}", e),
                }));
            }
            Err(e) => failures.push(format!("publickey: {}", e)),
        }
    }

    if let Some(password) = &endpoint.password {
        match session.userauth_password(user, password) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push("password: not accepted".to_string()),
            Err(e) => failures.push(format!("password: {}", e)),
        }
        let mut prompt = PasswordPrompt(password);
        match session.userauth_keyboard_interactive(user, &mut prompt) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push("keyboard-interactive: not accepted".to_string()),
            Err(e) => failures.push(format!("keyboard-interactive: {}", e)),
        }
    }

    if endpoint.private_key.is_none() && endpoint.password.is_none() {
        let socket = endpoint
            .agent_socket_path
            .clone()
            .or_else(|| std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty()));
        match socket {
            Some(socket) => match agent_auth(session, user, &socket) {
                Ok(()) => return Ok(()),
                Err(e) => failures.push(format!("agent: {}", e)),
            },
            None => failures.push("no private key, password or agent socket configured".to_string()),
        }
    }

    Err(DialError::Retryable(format!(
        "authentication failed for {}@{}: {}",
        user,
        endpoint.address(),
        failures.join("; ")
    )))
}

#[cfg(unix)]
fn pubkey_auth(
    session: &Session,
    user: &str,
    key: &str,
    passphrase: Option<&str>,
) -> std::result::Result<(), ssh2::Error> {
    session.userauth_pubkey_memory(user, None, key, passphrase)
}

#[cfg(not(unix))]
fn pubkey_auth(
    _session: &Session,
    _user: &str,
    _key: &str,
    _passphrase: Option<&str>,
) -> std::result::Result<(), ssh2::Error> {
    Err(ssh2::Error::new(
        ErrorCode::Session(LIBSSH2_ERROR_FILE),
        "in-memory private keys are not supported on this platform",
    ))
}

/// Authenticate with the first agent identity the server accepts.
///
/// libssh2 locates the agent through `SSH_AUTH_SOCK` when connecting. When
/// `socket` is already the inherited value the agent is used as is and the
/// environment is left alone. Otherwise the variable is pointed at `socket`
/// for the duration of the connect call, serialized behind
/// [`AGENT_ENV_LOCK`] and restored immediately.
///
/// The override mutates the process-wide environment. The lock only orders
/// agent dials against each other: a child process spawned concurrently on
/// another thread (a local command running in parallel) may inherit the
/// overridden value. Callers that mix `agentSocketPath` overrides with
/// concurrent local commands should export the socket as `SSH_AUTH_SOCK`
/// instead.
fn agent_auth(session: &Session, user: &str, socket: &str) -> std::result::Result<(), String> {
    let mut agent = session.agent().map_err(|e| e.to_string())?;
    if needs_agent_override(socket, std::env::var_os("SSH_AUTH_SOCK").as_deref()) {
        let _guard = AGENT_ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::env::var_os("SSH_AUTH_SOCK");
        std::env::set_var("SSH_AUTH_SOCK", socket);
        let connected = agent.connect();
        match previous {
            Some(value) => std::env::set_var("SSH_AUTH_SOCK", value),
            None => std::env::remove_var("SSH_AUTH_SOCK"),
        }
        connected.map_err(|e| format!("connect to {}: {}", socket, e))?;
    } else {
        agent
            .connect()
            .map_err(|e| format!("connect to {}: {}", socket, e))?;
    }

    agent.list_identities().map_err(|e| e.to_string())?;
    let identities = agent.identities().map_err(|e| e.to_string())?;
    for identity in &identities {
        if agent.userauth(user, identity).is_ok() && session.authenticated() {
            let _ = agent.disconnect();
            return Ok(());
        }
    }
    let _ = agent.disconnect();
    Err(format!("none of {} agent identities accepted", identities.len()))
}

/// Whether connecting to `socket` requires repointing `SSH_AUTH_SOCK`
fn needs_agent_override(socket: &str, inherited: Option<&std::ffi::OsStr>) -> bool {
    inherited != Some(std::ffi::OsStr::new(socket))
}

#[cfg(unix)]
pub use tunnel::ProxyTunnel;

#[cfg(unix)]
mod tunnel {
    use ssh2::{Channel, Session};
    use std::io::{self, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tracing::debug;

    const IDLE_SLEEP: Duration = Duration::from_millis(2);

    /// Bridges a proxy `direct-tcpip` channel to a local socket pair.
    ///
    /// The proxy session is switched to non-blocking mode while the pump runs
    /// and restored when the tunnel is dropped.
    pub struct ProxyTunnel {
        proxy: Session,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl ProxyTunnel {
        /// Start pumping; returns the socket end to hand to the target session
        pub fn start(proxy: Session, channel: Channel) -> io::Result<(UnixStream, Self)> {
            let (local, remote) = UnixStream::pair()?;
            remote.set_nonblocking(true)?;
            proxy.set_blocking(false);

            let stop = Arc::new(AtomicBool::new(false));
            let handle = std::thread::Builder::new()
                .name("ssh-proxy-tunnel".to_string())
                .spawn({
                    let stop = stop.clone();
                    move || pump(channel, remote, &stop)
                })?;

            Ok((
                local,
                Self {
                    proxy,
                    stop,
                    handle: Some(handle),
                },
            ))
        }
    }

    impl Drop for ProxyTunnel {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.proxy.set_blocking(true);
        }
    }

    fn pump(mut channel: Channel, mut socket: UnixStream, stop: &AtomicBool) {
        let mut buf = [0u8; 16 * 1024];
        while !stop.load(Ordering::SeqCst) {
            let mut progressed = false;

            match channel.read(&mut buf) {
                Ok(0) if channel.eof() => break,
                Ok(0) => {}
                Ok(n) => {
                    if write_fully(&mut socket, &buf[..n], stop).is_err() {
                        break;
                    }
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Tunnel read from proxy failed: {}", e);
                    break;
                }
            }

            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if write_fully(&mut channel, &buf[..n], stop).is_err() {
                        break;
                    }
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Tunnel read from session failed: {}", e);
                    break;
                }
            }

            if !progressed {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        let _ = channel.close();
    }

    /// Write all of `data` to a non-blocking writer
    fn write_fully<W: Write>(writer: &mut W, mut data: &[u8], stop: &AtomicBool) -> io::Result<()> {
        while !data.is_empty() {
            if stop.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "tunnel stopped"));
            }
            match writer.write(data) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed")),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(IDLE_SLEEP),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct Chunky {
            accepted: Vec<u8>,
            calls: usize,
        }

        impl Write for Chunky {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.calls += 1;
                if self.calls % 2 == 1 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                let n = data.len().min(3);
                self.accepted.extend_from_slice(&data[..n]);
                Ok(n)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        #[test]
        fn test_write_fully_retries_would_block() {
            let mut writer = Chunky {
                accepted: Vec::new(),
                calls: 0,
            };
            let stop = AtomicBool::new(false);
            write_fully(&mut writer, b"hello tunnel", &stop).unwrap();
            assert_eq!(writer.accepted, b"hello tunnel");
        }

        #[test]
        fn test_write_fully_honours_stop() {
            let mut writer = Chunky {
                accepted: Vec::new(),
                calls: 0,
            };
            let stop = AtomicBool::new(true);
            let err = write_fully(&mut writer, b"data", &stop).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_bounded_retry_makes_exactly_limit_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = dial_with_retry(
            "Dial",
            "10.0.0.1:22",
            DialLimit::from_setting(3),
            &fast_retry(),
            &CallContext::background(),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DialError::Retryable("connection refused".to_string())) }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(CommandError::Connection {
                target,
                attempts,
                cause,
            }) => {
                assert_eq!(target, "10.0.0.1:22");
                assert_eq!(attempts, 3);
                assert_eq!(cause, "connection refused");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlimited_retry_runs_until_cancelled() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (ctx, handle) = CallContext::new();

        let counter = attempts.clone();
        let result: Result<()> = dial_with_retry(
            "Dial",
            "10.0.0.1:22",
            DialLimit::from_setting(-1),
            &fast_retry(),
            &ctx,
            || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 25 {
                    handle.cancel();
                }
                async { Err(DialError::Retryable("unreachable".to_string())) }
            },
        )
        .await;

        assert!(attempts.load(Ordering::SeqCst) >= 25);
        assert!(matches!(result, Err(CommandError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = dial_with_retry(
            "Dial",
            "10.0.0.1:22",
            DialLimit::from_setting(10),
            &fast_retry(),
            &CallContext::background(),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DialError::Fatal(CommandError::HostKeyMismatch {
                        host: "10.0.0.1:22".to_string(),
                        expected: "a".to_string(),
                        actual: "b".to_string(),
                    }))
                }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CommandError::HostKeyMismatch { .. })));
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let attempts = AtomicU32::new(0);
        let result = dial_with_retry(
            "Dial",
            "10.0.0.1:22",
            DialLimit::from_setting(5),
            &fast_retry(),
            &CallContext::background(),
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(DialError::Retryable("not yet".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_connector_gives_up_on_refused_port() {
        // Reserve a port, then free it so connects are refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut endpoint = Endpoint::new("127.0.0.1");
        endpoint.port = port;
        endpoint.dial_error_limit = 2;
        endpoint.per_dial_timeout = 1;
        endpoint.password = Some("secret".to_string());

        let metrics = ProviderMetrics::new().unwrap();
        let connector = SshConnector::new()
            .with_retry(fast_retry())
            .with_metrics(metrics.clone());
        let err = connector
            .connect(&ConnectionSpec::new(endpoint), &CallContext::background())
            .await
            .err()
            .unwrap();

        match err {
            CommandError::Connection { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert!(metrics
            .gather()
            .unwrap()
            .contains("command_dial_attempts_total{outcome=\"failure\",role=\"target\"} 2"));
    }

    #[tokio::test]
    async fn test_connector_rejects_invalid_endpoint() {
        let mut endpoint = Endpoint::new("");
        let err = SshConnector::new()
            .connect(&ConnectionSpec::new(endpoint.clone()), &CallContext::background())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CommandError::Validation(_)));

        endpoint.host = "example.com".to_string();
        endpoint.dial_error_limit = -2;
        let err = SshConnector::new()
            .connect(&ConnectionSpec::new(endpoint), &CallContext::background())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[test]
    fn test_parse_host_key_formats() {
        let blob = STANDARD.encode(b"not really a key");
        assert_eq!(parse_host_key(&blob).unwrap(), b"not really a key");
        assert_eq!(
            parse_host_key(&format!("ssh-ed25519 {} root@host", blob)).unwrap(),
            b"not really a key"
        );
        assert_eq!(
            parse_host_key(&format!("host.example.com ecdsa-sha2-nistp256 {}", blob)).unwrap(),
            b"not really a key"
        );
        assert!(parse_host_key("").is_err());
        assert!(parse_host_key("ssh-rsa !!!notbase64").is_err());
        assert!(parse_host_key("two tokens").is_err());
    }

    #[test]
    fn test_password_prompt_answers_every_prompt() {
        let mut prompt = PasswordPrompt("hunter2");
        let prompts = [
            Prompt {
                text: "Password: ".into(),
                echo: false,
            },
            Prompt {
                text: "OTP: ".into(),
                echo: true,
            },
        ];
        assert_eq!(
            prompt.prompt("root", "", &prompts),
            vec!["hunter2".to_string(), "hunter2".to_string()]
        );
    }

    #[test]
    fn test_agent_override_only_for_foreign_socket() {
        use std::ffi::OsStr;

        let socket = "/run/user/1000/agent.sock";
        assert!(!needs_agent_override(socket, Some(OsStr::new(socket))));
        assert!(needs_agent_override(socket, Some(OsStr::new("/tmp/other.sock"))));
        assert!(needs_agent_override(socket, None));
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! SSH transport for scripted disruptions.

use crate::credentials::{Auth, CredentialSet};
use crate::error::{ChaosError, Result};
use ssh2::{Channel, Session};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// Sleep between polls of a non-blocking channel.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    /// Decode raw channel output; invalid UTF-8 is replaced, not rejected.
    pub fn from_raw(exit_status: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_status,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The command never reached the remote shell.
    NotStarted(String),
    /// The command was sent but did not complete in time.
    TimedOut,
    /// The command was sent, then the channel broke; its effect is unknown.
    Interrupted(String),
}

impl ExecError {
    /// Classify an I/O failure seen after the command was sent.
    pub fn after_start(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ExecError::TimedOut,
            _ => ExecError::Interrupted(err.to_string()),
        }
    }
}

/// An authenticated remote session
pub trait RemoteSession: Send {
    fn exec(
        &mut self,
        command: &str,
        stdin: &[u8],
        timeout: Duration,
    ) -> std::result::Result<ScriptOutput, ExecError>;

    fn close(&mut self);
}

/// Opens remote sessions
pub trait SshConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &CredentialSet,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// Closes the wrapped session on every exit path, including unwinding.
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn RemoteSession>) -> Self {
        Self { session }
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// libssh2-backed connector
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl SshConnector for Ssh2Connector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &CredentialSet,
    ) -> Result<Box<dyn RemoteSession>> {
        let failure = |reason: String| ChaosError::ConnectFailure {
            endpoint: endpoint.to_string(),
            reason,
        };

        let stream =
            connect_tcp(endpoint, self.connect_timeout).map_err(|e| failure(e.to_string()))?;

        let mut session = Session::new().map_err(|e| failure(e.to_string()))?;
        session.set_tcp_stream(stream);
        session.set_timeout(millis(self.connect_timeout));
        session.handshake().map_err(|e| failure(format!("handshake: {}", e)))?;

        let user = credentials.username();
        match credentials.auth() {
            Auth::NoAuth => {
                return Err(ChaosError::CredentialsDisabled(endpoint.to_string()));
            }
            Auth::Password(password) => session
                .userauth_password(user, password)
                .map_err(|e| failure(format!("password auth as {}: {}", user, e)))?,
            Auth::PrivateKey { key, passphrase } => {
                let key = std::str::from_utf8(key)
                    .map_err(|_| failure("private key is not valid UTF-8 PEM".to_string()))?;
                session
                    .userauth_pubkey_memory(user, None, key, passphrase.as_deref())
                    .map_err(|e| failure(format!("key auth as {}: {}", user, e)))?
            }
        }
        if !session.authenticated() {
            return Err(failure(format!("authentication as {} rejected", user)));
        }

        debug!(endpoint = %endpoint, user, "ssh session established");
        Ok(Box::new(Ssh2Session {
            session,
            endpoint: endpoint.to_string(),
        }))
    }
}

fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

struct Ssh2Session {
    session: Session,
    endpoint: String,
}

impl RemoteSession for Ssh2Session {
    /// Runs `command` under one deadline covering the whole exchange. Once
    /// the command is sent the session is switched to non-blocking mode so
    /// no single libssh2 call can outlive the deadline.
    fn exec(
        &mut self,
        command: &str,
        stdin: &[u8],
        timeout: Duration,
    ) -> std::result::Result<ScriptOutput, ExecError> {
        let deadline = Instant::now() + timeout;
        let not_started = |e: ssh2::Error| ExecError::NotStarted(e.to_string());
        self.session.set_timeout(millis(timeout));
        let mut channel = self.session.channel_session().map_err(not_started)?;
        channel.exec(command).map_err(not_started)?;

        // From here on the command is running remotely.
        self.session.set_blocking(false);
        let result = finish(channel, stdin, deadline);
        self.session.set_blocking(true);
        result.map_err(ExecError::after_start)
    }

    fn close(&mut self) {
        if let Err(err) = self.session.disconnect(None, "chaos-warden done", None) {
            warn!(endpoint = %self.endpoint, error = %err, "ssh disconnect failed");
        }
    }
}

/// Feed stdin, collect both output streams and the exit status of a
/// started command on a non-blocking channel.
fn finish(mut channel: Channel, stdin: &[u8], deadline: Instant) -> io::Result<ScriptOutput> {
    let mut written = 0;
    while written < stdin.len() {
        let n = poll(deadline, || channel.write(&stdin[written..]))?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    poll(deadline, || channel.send_eof().map_err(io::Error::from))?;

    let (stdout, stderr) = drain(&mut channel.stream(0), &mut channel.stderr(), deadline)?;

    poll(deadline, || channel.wait_close().map_err(io::Error::from))?;
    let exit_status = channel.exit_status().map_err(io::Error::from)?;
    Ok(ScriptOutput::from_raw(exit_status, &stdout, &stderr))
}

fn deadline_passed() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "script deadline passed")
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Retry a non-blocking call until it stops returning `WouldBlock`.
fn poll<T>(deadline: Instant, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if would_block(&err) => {
                if Instant::now() >= deadline {
                    return Err(deadline_passed());
                }
                thread::sleep(POLL_INTERVAL);
            }
            other => return other,
        }
    }
}

/// Read two non-blocking streams to end of file, alternating between them so
/// a full stderr window cannot stall stdout. Gives up at `deadline` even if
/// output is still arriving.
fn drain<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    deadline: Instant,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 8192];
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        if Instant::now() >= deadline {
            return Err(deadline_passed());
        }
        let mut progressed = false;
        if !out_done {
            match read_some(stdout, &mut buf, &mut out)? {
                Some(0) => out_done = true,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if !err_done {
            match read_some(stderr, &mut buf, &mut err)? {
                Some(0) => err_done = true,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if !progressed && !(out_done && err_done) {
            thread::sleep(POLL_INTERVAL);
        }
    }
    Ok((out, err))
}

/// `None` when the stream has nothing ready yet.
fn read_some(
    source: &mut impl Read,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> io::Result<Option<usize>> {
    match source.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(Some(n))
        }
        Err(err) if would_block(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Replays a fixed sequence of reads, then reports end of file.
    struct Replay(VecDeque<io::Result<&'static [u8]>>);

    impl Replay {
        fn new(steps: Vec<io::Result<&'static [u8]>>) -> Self {
            Self(steps.into())
        }
    }

    impl Read for Replay {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
            }
        }
    }

    fn chunk(bytes: &'static [u8]) -> io::Result<&'static [u8]> {
        Ok(bytes)
    }

    fn pending() -> io::Result<&'static [u8]> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    /// Never finishes: a little output, forever.
    struct Chatty;

    impl Read for Chatty {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            buf[0] = b'.';
            Ok(1)
        }
    }

    /// Never has anything ready.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn drain_collects_both_streams_around_stalls() {
        let mut stdout = Replay::new(vec![pending(), chunk(b"hal"), pending(), chunk(b"ted")]);
        let mut stderr = Replay::new(vec![chunk(b"warn"), pending(), pending(), pending()]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let (out, err) = drain(&mut stdout, &mut stderr, deadline).expect("drains");
        assert_eq!(out, b"halted");
        assert_eq!(err, b"warn");
    }

    #[test]
    fn drain_stops_at_deadline_while_output_keeps_coming() {
        let start = Instant::now();
        let err = drain(&mut Chatty, &mut Silent, start + Duration::from_millis(150))
            .expect_err("never reaches end of file");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn drain_stops_at_deadline_when_nothing_arrives() {
        let start = Instant::now();
        let err = drain(&mut Silent, &mut Silent, start + Duration::from_millis(100))
            .expect_err("silent streams");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(ExecError::after_start(err), ExecError::TimedOut);
    }

    #[test]
    fn broken_stream_after_start_is_interrupted() {
        let reset: io::Result<&'static [u8]> = Err(io::ErrorKind::ConnectionReset.into());
        let mut stdout = Replay::new(vec![chunk(b"partial"), reset]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = drain(&mut stdout, &mut Silent, deadline).expect_err("reset");
        assert!(matches!(ExecError::after_start(err), ExecError::Interrupted(_)));
    }

    #[test]
    fn poll_retries_until_ready_or_deadline() {
        let mut attempts = 0;
        let value = poll(Instant::now() + Duration::from_secs(5), || {
            attempts += 1;
            if attempts < 3 {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(attempts)
            }
        })
        .expect("ready on third try");
        assert_eq!(value, 3);

        let err = poll(Instant::now() + Duration::from_millis(50), || {
            Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
        })
        .expect_err("never ready");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn binary_output_is_decoded_lossily() {
        let output = ScriptOutput::from_raw(0, b"ok \xff\xfe", b"");
        assert!(output.stdout.starts_with("ok "));
        assert!(output.stdout.contains('\u{fffd}'));
    }

    struct Flagged(Arc<AtomicBool>);

    impl RemoteSession for Flagged {
        fn exec(
            &mut self,
            _command: &str,
            _stdin: &[u8],
            _timeout: Duration,
        ) -> std::result::Result<ScriptOutput, ExecError> {
            panic!("script blew up");
        }

        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_closes_session_on_panic() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut guard = SessionGuard::new(Box::new(Flagged(flag)));
            let _ = guard.session().exec("true", b"", Duration::from_secs(1));
        }));
        assert!(result.is_err());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn refused_connection_is_connect_failure() {
        // grab a free port, then close it
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port");
        let connector = Ssh2Connector::new(Duration::from_secs(1));
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
        };
        let creds = CredentialSet::with_password("root", "pw");
        let err = connector.connect(&endpoint, &creds).err().expect("must fail");
        assert!(matches!(err, ChaosError::ConnectFailure { .. }));
    }

    #[test]
    fn silent_server_hits_connect_timeout() {
        // accepts tcp but never speaks ssh, so the handshake must time out
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let connector = Ssh2Connector::new(Duration::from_millis(300));
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
        };
        let creds = CredentialSet::with_password("root", "pw");
        let start = Instant::now();
        let err = connector.connect(&endpoint, &creds).err().expect("must fail");
        assert!(matches!(err, ChaosError::ConnectFailure { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}

//! Remote command execution over SSH
//!
//! Every call opens one session, runs one command and disconnects. The
//! credential is taken by value so it cannot outlive the session it was
//! fetched for.

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::secrets::RemoteCredential;
use crate::Error;

/// Host, port and login user of a remote session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Hostname or IP address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
}

impl RemoteTarget {
    /// Create a target
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }
}

/// Captured result of one remote command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    /// Remote exit status
    pub exit_status: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit status and stderr
    pub fn failed(exit_status: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Output from raw channel bytes
    ///
    /// Invalid UTF-8 is replaced rather than rejected; kubectl and kubeadm
    /// may echo arbitrary pod or file content.
    pub fn from_bytes(exit_status: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_status,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Whether the command exited 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Convert a nonzero exit into a [`Error::RemoteCommand`]
    ///
    /// `command` is the short name used in the error, never the full line.
    pub fn into_result(self, host: &str, command: &str) -> Result<CommandOutput, Error> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(Error::RemoteCommand {
                host: host.to_string(),
                command: command.to_string(),
                exit_status: self.exit_status,
                stderr,
            })
        }
    }
}

/// Trait for running one command on a remote host (allows mocking in tests)
///
/// A nonzero exit is returned as `Ok` with the status in [`CommandOutput`];
/// `Err` means no command ran to completion (connect, auth or I/O failure).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Open a session to `target`, run `command`, close the session
    async fn run(
        &self,
        target: &RemoteTarget,
        credential: RemoteCredential,
        command: &str,
    ) -> Result<CommandOutput, Error>;
}

/// SSH executor backed by libssh2
#[derive(Clone, Debug)]
pub struct SshExecutor {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor
    ///
    /// `io_timeout` bounds how long a command may stay silent, so it must
    /// exceed the longest command the controller runs.
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &RemoteTarget,
        credential: RemoteCredential,
        command: &str,
    ) -> Result<CommandOutput, Error> {
        let target = target.clone();
        let command = command.to_string();
        let executor = self.clone();
        let host = target.host.clone();

        tokio::task::spawn_blocking(move || executor.run_blocking(&target, credential, &command))
            .await
            .map_err(|e| Error::session(host, format!("ssh task failed: {e}")))?
    }
}

impl SshExecutor {
    fn run_blocking(
        &self,
        target: &RemoteTarget,
        credential: RemoteCredential,
        command: &str,
    ) -> Result<CommandOutput, Error> {
        let host = target.host.as_str();
        let session_err = |what: &str, e: &dyn std::fmt::Display| {
            Error::session(host, format!("{what}: {e}"))
        };

        let addr = resolve_addr(&target.host, target.port)?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| session_err("connect", &e))?;

        let mut session = ssh2::Session::new().map_err(|e| session_err("session", &e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.io_timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| session_err("handshake", &e))?;

        // Hosts are freshly launched fleet instances with no pinned key, so
        // the fingerprint is only recorded.
        if let Some(hash) = session.host_key_hash(ssh2::HashType::Sha256) {
            debug!(
                host = %host,
                fingerprint = %format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)),
                "SSH host key"
            );
        }

        {
            let pem = credential.pem()?;
            session
                .userauth_pubkey_memory(&target.user, None, &pem, None)
                .map_err(|e| session_err("authentication", &e))?;
        }
        drop(credential);

        if !session.authenticated() {
            return Err(Error::session(host, "authentication rejected"));
        }

        let result =
            exec(&session, command, self.io_timeout).map_err(|e| session_err("exec", &e));

        if let Err(e) = session.disconnect(None, "done", None) {
            warn!(host = %host, error = %e, "SSH disconnect failed");
        }

        result
    }
}

fn exec(
    session: &ssh2::Session,
    command: &str,
    idle_timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    // Both streams share one flow-control window, so neither may be read
    // to EOF on its own.
    session.set_blocking(false);
    let streams = read_streams(&channel, idle_timeout);
    session.set_blocking(true);
    let (stdout, stderr) = streams?;

    channel.wait_close()?;
    let exit_status = channel.exit_status()?;

    Ok(CommandOutput::from_bytes(exit_status, &stdout, &stderr))
}

const IDLE_POLL: Duration = Duration::from_millis(20);

fn read_streams(
    channel: &ssh2::Channel,
    idle_timeout: Duration,
) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let mut last_data = Instant::now();

    loop {
        let out = read_available(&mut channel.stream(0), &mut stdout, &mut buf)?;
        let err = read_available(&mut channel.stderr(), &mut stderr, &mut buf)?;

        if channel.eof() {
            read_available(&mut channel.stream(0), &mut stdout, &mut buf)?;
            read_available(&mut channel.stderr(), &mut stderr, &mut buf)?;
            return Ok((stdout, stderr));
        }

        if out || err {
            last_data = Instant::now();
        } else if last_data.elapsed() >= idle_timeout {
            return Err(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("no output for {idle_timeout:?}"),
            ));
        } else {
            std::thread::sleep(IDLE_POLL);
        }
    }
}

/// Append whatever `stream` has buffered; true if anything was read
fn read_available(
    stream: &mut impl Read,
    sink: &mut Vec<u8>,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut read_any = false;
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(read_any),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                read_any = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(read_any),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::session(host, format!("resolve: {e}")))?
        .next()
        .ok_or_else(|| Error::session(host, "resolve: no addresses"))
}

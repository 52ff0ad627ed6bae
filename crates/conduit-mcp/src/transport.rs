//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and exchanges newline-delimited JSON-RPC envelopes
//! over its stdin/stdout. The transport only frames and deframes; reading is
//! driven by whoever holds the stream returned from [`Transport::receive`].

use crate::config::ServerDescriptor;
use crate::error::McpError;
use crate::events::{ConnectionEvent, ConnectionSignal, ConnectionState};
use crate::jsonrpc::Envelope;
use conduit_types::util::preview;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a server gets to exit after its stdin is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Decoded envelopes in arrival order. Ends when the peer closes its output
/// or the transport is disconnected.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional JSON-RPC message channel.
///
/// Dyn-compatible so the client can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Establish the connection. No-op when already connected.
    fn connect(&self) -> TransportFuture<'_, Result<(), McpError>>;

    /// Write one envelope. Fails when not connected.
    fn send<'a>(&'a self, envelope: &'a Envelope) -> TransportFuture<'a, Result<(), McpError>>;

    /// Take the inbound stream. Available once per connection.
    fn receive(&self) -> Result<EnvelopeStream, McpError>;

    /// Tear the connection down. Idempotent.
    fn disconnect(&self) -> TransportFuture<'_, ()>;

    fn is_connected(&self) -> bool;

    /// Connection state transitions from now on.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Transport backed by a child process's stdio.
pub struct ProcessTransport {
    descriptor: ServerDescriptor,
    signal: Arc<ConnectionSignal>,
    stdin: Mutex<Option<ChildStdin>>,
    reader: std::sync::Mutex<ReaderSlot>,
    process: Mutex<Option<RunningProcess>>,
}

#[derive(Default)]
struct ReaderSlot {
    stdout: Option<ChildStdout>,
    stop: CancellationToken,
}

struct RunningProcess {
    child: Child,
    stop: CancellationToken,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessTransport {
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            signal: Arc::new(ConnectionSignal::new()),
            stdin: Mutex::new(None),
            reader: std::sync::Mutex::new(ReaderSlot::default()),
            process: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    fn build_command(&self) -> Command {
        let d = &self.descriptor;
        let mut cmd = Command::new(&d.command);
        cmd.args(&d.args)
            .envs(&d.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &d.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group, so a forced shutdown also reaches descendants.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn spawn(&self) -> Result<(), McpError> {
        let mut child = self
            .build_command()
            .spawn()
            .map_err(|source| McpError::Launch {
                command: self.descriptor.command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(McpError::Transport("child stdio was not piped".to_string()));
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(self.descriptor.command.clone(), stderr)));

        tracing::debug!(
            "Spawned MCP server '{}' (pid {:?})",
            self.descriptor.command,
            child.id()
        );

        let stop = CancellationToken::new();
        *self.stdin.lock().await = Some(stdin);
        *lock_reader(&self.reader) = ReaderSlot {
            stdout: Some(stdout),
            stop: stop.clone(),
        };
        *self.process.lock().await = Some(RunningProcess {
            child,
            stop,
            stderr_task,
        });
        Ok(())
    }
}

impl Transport for ProcessTransport {
    fn connect(&self) -> TransportFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            // A previous process that exited on its own still needs reaping.
            self.disconnect().await;

            self.signal.transition(ConnectionState::Connecting, None);
            match self.spawn().await {
                Ok(()) => {
                    self.signal.transition(ConnectionState::Connected, None);
                    Ok(())
                }
                Err(e) => {
                    self.signal
                        .transition(ConnectionState::Disconnected, Some(e.to_string()));
                    Err(e)
                }
            }
        })
    }

    fn send<'a>(&'a self, envelope: &'a Envelope) -> TransportFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(McpError::not_connected());
            }
            let line = envelope.encode()?;
            let mut guard = self.stdin.lock().await;
            let stdin = guard.as_mut().ok_or_else(McpError::not_connected)?;
            write_line(stdin, &line)
                .await
                .map_err(|e| McpError::Transport(format!("write to server failed: {e}")))
        })
    }

    fn receive(&self) -> Result<EnvelopeStream, McpError> {
        let mut slot = lock_reader(&self.reader);
        let stdout = slot.stdout.take().ok_or_else(|| {
            McpError::Transport("receive stream unavailable (not connected or already taken)".into())
        })?;
        let state = ReadState {
            lines: BufReader::new(stdout).lines(),
            stop: slot.stop.clone(),
            signal: Arc::clone(&self.signal),
            server: self.descriptor.command.clone(),
        };
        Ok(Box::pin(futures_util::stream::unfold(state, read_next)))
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let process = self.process.lock().await.take();
            if let Some(process) = &process {
                process.stop.cancel();
            }
            lock_reader(&self.reader).stdout = None;
            // Closing stdin asks the server to exit. A writer stuck on a full
            // pipe holds the lock; the kill below unblocks it.
            if let Ok(mut stdin) = self.stdin.try_lock() {
                stdin.take();
            }
            if let Some(process) = process {
                shutdown(process, &self.descriptor.command).await;
            }
            self.signal.transition(ConnectionState::Disconnected, None);
        })
    }

    fn is_connected(&self) -> bool {
        self.signal.get() == ConnectionState::Connected
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signal.subscribe()
    }
}

fn lock_reader(reader: &std::sync::Mutex<ReaderSlot>) -> std::sync::MutexGuard<'_, ReaderSlot> {
    reader.lock().unwrap_or_else(|e| e.into_inner())
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

struct ReadState {
    lines: Lines<BufReader<ChildStdout>>,
    stop: CancellationToken,
    signal: Arc<ConnectionSignal>,
    server: String,
}

async fn read_next(mut st: ReadState) -> Option<(Envelope, ReadState)> {
    loop {
        let next = tokio::select! {
            biased;
            _ = st.stop.cancelled() => return None,
            line = st.lines.next_line() => line,
        };
        match next {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Envelope::decode(line) {
                    Ok(envelope) => return Some((envelope, st)),
                    Err(e) => tracing::warn!(
                        "Dropping malformed message from MCP server '{}': {e}: {}",
                        st.server,
                        preview(line)
                    ),
                }
            }
            Ok(None) => {
                if !st.stop.is_cancelled() {
                    tracing::debug!("MCP server '{}' closed its output", st.server);
                    st.signal.transition(ConnectionState::Disconnected, None);
                }
                return None;
            }
            Err(e) => {
                if !st.stop.is_cancelled() {
                    tracing::warn!("Read from MCP server '{}' failed: {e}", st.server);
                    st.signal
                        .transition(ConnectionState::Disconnected, Some(e.to_string()));
                }
                return None;
            }
        }
    }
}

async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("[{server} stderr] {line}");
    }
}

async fn shutdown(mut process: RunningProcess, server: &str) {
    match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("MCP server '{server}' exited: {status}"),
        Ok(Err(e)) => tracing::warn!("Waiting for MCP server '{server}' failed: {e}"),
        Err(_) => {
            tracing::debug!("MCP server '{server}' ignored shutdown, killing it");
            force_kill(&mut process.child).await;
        }
    }
    if let Some(task) = process.stderr_task {
        task.abort();
    }
}

async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!("killpg({pid}) failed: {e}");
        }
    }
    let _ = child.kill().await;
}

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::protocol::{Envelope, LineScanner, OutputEvent};
use crate::error::ProvisionError;

/// Exit code reported when the guest command produced no exit status of its
/// own (the connection to the VM dropped or the process was killed).
pub const EXIT_DISCONNECTED: i32 = 2_300_218;

/// Capacity of the channel between the output reader task and the caller.
const EVENT_BUFFER: usize = 64;

/// Stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Executes anka subcommands.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Runner {
    /// Run `<tool> --machine-readable [--debug] <args>` and return the
    /// terminal envelope. Progress lines go to `progress` when supplied;
    /// `--debug` is only requested in that case.
    async fn invoke(
        &self,
        args: &[String],
        progress: Option<&mpsc::Sender<String>>,
    ) -> Result<Envelope, ProvisionError>;

    /// Run a command inside a VM with live stream relay.
    async fn run(&self, params: RunParams) -> Result<i32, ProvisionError>;
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Parameters for `anka run`.
pub struct RunParams {
    pub vm_name: String,
    pub command: Vec<String>,
    /// Host directory mounted into the guest working directory.
    pub volume: Option<PathBuf>,
    pub wait_network: bool,
    pub wait_time: bool,
    pub stdin: Option<Reader>,
    pub stdout: Writer,
    pub stderr: Writer,
}

impl RunParams {
    pub fn new(vm_name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            command,
            volume: None,
            wait_network: false,
            wait_time: false,
            stdin: None,
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }

    pub fn volume(mut self, dir: impl Into<PathBuf>) -> Self {
        self.volume = Some(dir.into());
        self
    }

    pub fn wait_for_network(mut self) -> Self {
        self.wait_network = true;
        self.wait_time = true;
        self
    }

    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Box::new(writer);
        self
    }

    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Box::new(writer);
        self
    }

    /// Argument list after the tool name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if let Some(dir) = &self.volume {
            args.push("--volume".into());
            args.push(dir.display().to_string());
        }
        if self.wait_network {
            args.push("--wait-network".into());
        }
        if self.wait_time {
            args.push("--wait-time".into());
        }
        args.push(self.vm_name.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// The real anka CLI, spawned with tokio.
#[derive(Debug, Clone)]
pub struct AnkaCli {
    tool: String,
}

impl AnkaCli {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.tool.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .env_clear()
            .envs(forwarded_env(std::env::vars()))
            .kill_on_drop(true);
        cmd
    }
}

impl Default for AnkaCli {
    fn default() -> Self {
        Self::new("anka")
    }
}

impl Runner for AnkaCli {
    async fn invoke(
        &self,
        args: &[String],
        progress: Option<&mpsc::Sender<String>>,
    ) -> Result<Envelope, ProvisionError> {
        let mut full = vec!["--machine-readable".to_string()];
        if progress.is_some() {
            full.push("--debug".into());
        }
        full.extend(args.iter().cloned());

        let line = self.command_line(&full);
        tracing::info!(command = %line, "executing");

        let transport = |message: String| ProvisionError::Transport {
            command: line.clone(),
            message,
        };

        let mut child = self
            .command(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| transport(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| transport("stderr was not captured".into()))?;

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let stdout_task = tokio::spawn(scan_stream(stdout, tx));
        let stderr_task = tokio::spawn(collect_stderr(stderr, progress.cloned()));

        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            match event {
                OutputEvent::Progress(text) => {
                    tracing::debug!(line = %text, "progress");
                    if let Some(sink) = progress {
                        // a dropped receiver just means nobody is watching
                        let _ = sink.send(text).await;
                    }
                }
                OutputEvent::Terminal(payload) => terminal = Some(payload),
            }
        }

        let read = stdout_task
            .await
            .map_err(|e| transport(format!("output reader failed: {e}")))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let status = child.wait().await.map_err(|e| ProvisionError::Io {
            context: format!("waiting for `{line}`"),
            source: e,
        })?;

        if let Err(e) = read {
            return Err(transport(format!("reading output: {e}")));
        }

        let envelope = match terminal.as_deref().map(Envelope::parse) {
            Some(Ok(envelope)) => envelope,
            // a crash leaves no usable envelope behind
            _ if !status.success() => {
                return Err(transport(format!(
                    "exited with {status} without machine readable output{}",
                    format_tail(&stderr_tail)
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ProvisionError::Protocol {
                    message: "missing machine readable output".into(),
                });
            }
        };
        tracing::debug!(status = %envelope.status, exit = %status, "command finished");
        envelope.into_result()
    }

    async fn run(&self, params: RunParams) -> Result<i32, ProvisionError> {
        let args = params.args();
        let line = self.command_line(&args);
        tracing::info!(command = %line, "executing in guest");

        let RunParams {
            stdin,
            mut stdout,
            mut stderr,
            ..
        } = params;

        let mut child = self
            .command(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProvisionError::Transport {
                command: line.clone(),
                message: e.to_string(),
            })?;

        // Stdin is relayed in its own task: the source may never reach EOF,
        // and the guest command finishing must not wait on it.
        let stdin_task = match (stdin, child.stdin.take()) {
            (Some(mut src), Some(mut dst)) => Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut src, &mut dst).await;
                // close stdin so commands reading until EOF can exit
                let _ = dst.shutdown().await;
                copied
            })),
            _ => None,
        };

        let (Some(mut child_out), Some(mut child_err)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(ProvisionError::Transport {
                command: line,
                message: "guest streams were not captured".into(),
            });
        };

        let (out, err, status) = tokio::join!(
            tokio::io::copy(&mut child_out, &mut stdout),
            tokio::io::copy(&mut child_err, &mut stderr),
            child.wait(),
        );

        if let Some(task) = stdin_task {
            task.abort();
        }
        if let Err(e) = out.and(err) {
            tracing::warn!(command = %line, "relaying guest output failed: {e}");
        }
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;

        let status = status.map_err(|e| ProvisionError::Io {
            context: format!("waiting for `{line}`"),
            source: e,
        })?;
        let code = exit_code(status);
        tracing::info!(command = %line, exit_code = code, "guest command finished");
        Ok(code)
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_DISCONNECTED)
}

fn format_tail(lines: &str) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {lines}")
    }
}

/// Only `PATH` and `ANKA_*` variables reach the tool.
pub fn forwarded_env(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    vars.filter(|(key, _)| key == "PATH" || key.starts_with("ANKA_"))
        .collect()
}

/// Split `stream` into tagged events until EOF.
async fn scan_stream<R>(stream: R, tx: mpsc::Sender<OutputEvent>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut scanner = LineScanner::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 || buf.last() != Some(&b'\n') {
            for event in scanner.finish(&buf) {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            return Ok(());
        }
        for event in scanner.line(&buf) {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Drain stderr, forwarding lines to `progress` and keeping the tail.
async fn collect_stderr<R>(stream: R, progress: Option<mpsc::Sender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(line = %line, "stderr");
        if let Some(sink) = &progress {
            let _ = sink.send(line.clone()).await;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// In-memory writer that can be read back after a guest command finished.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

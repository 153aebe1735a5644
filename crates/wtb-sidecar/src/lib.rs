//! WhatsApp Web adapter over a bridge sidecar process.
//!
//! Each operator gets its own child process (`WA_BRIDGE_CMD`), driven over NDJSON on
//! stdin/stdout. Lifecycle and message events are forwarded to the relay's event
//! channel; requests are matched to their `ack` by id.

pub mod protocol;

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wtb_core::{
    config::Config,
    domain::{OperatorId, RemoteChatId},
    errors::Error,
    media::MediaPayload,
    remote::{RemoteClient, RemoteConnector, RemoteEvent, RemoteEventSink},
    Result,
};

use crate::protocol::{encode_request, parse_line, SidecarCommand, SidecarEvent};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

const ACK_TIMEOUT: Duration = Duration::from_secs(120);
const EXIT_GRACE: Duration = Duration::from_secs(10);

type AckResult = std::result::Result<(), String>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckResult>>>>;

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Spawns one sidecar per operator.
#[derive(Clone, Debug)]
pub struct SidecarConnector {
    cfg: Arc<Config>,
}

impl SidecarConnector {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }

    /// Identifier the sidecar stores credentials under.
    pub fn client_id(operator: OperatorId) -> String {
        format!("client-{operator}")
    }

    fn command(&self, operator: OperatorId) -> Command {
        let mut cmd = Command::new(&self.cfg.bridge_cmd);
        cmd.args(&self.cfg.bridge_args)
            .arg("--client-id")
            .arg(Self::client_id(operator))
            .arg("--auth-dir")
            .arg(&self.cfg.auth_dir)
            .arg("--media-dir")
            .arg(&self.cfg.temp_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteConnector for SidecarConnector {
    async fn connect(
        &self,
        operator: OperatorId,
        sink: RemoteEventSink,
    ) -> Result<Arc<dyn RemoteClient>> {
        let mut child = self.command(operator).spawn().map_err(|e| {
            Error::External(format!(
                "failed to spawn {}: {e}",
                self.cfg.bridge_cmd.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("sidecar stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("sidecar stdout was not captured".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    debug!(operator = %operator, "sidecar: {line}");
                    tail.lock().await.push_line(line);
                }
            })
        });

        info!(
            operator = %operator,
            pid = ?child.id(),
            "started WhatsApp sidecar {}",
            self.cfg.bridge_cmd.display()
        );

        let client = Arc::new(SidecarClient {
            operator,
            stdin: Mutex::new(Some(stdin)),
            next_id: AtomicU64::new(1),
            acks: Arc::new(Mutex::new(HashMap::new())),
            child: Arc::new(Mutex::new(Some(child))),
            closing: CancellationToken::new(),
        });

        let reader = StdoutReader {
            sink,
            acks: client.acks.clone(),
            child: client.child.clone(),
            closing: client.closing.clone(),
            stderr_tail,
            stderr_task,
        };
        tokio::spawn(reader.run(stdout));

        Ok(client)
    }

    async fn purge_credentials(&self, operator: OperatorId) -> Result<()> {
        let dir = self.cfg.credentials_dir(&Self::client_id(operator));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(operator = %operator, "deleted session credentials {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Handle to one running sidecar.
pub struct SidecarClient {
    operator: OperatorId,
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    acks: PendingAcks,
    child: Arc<Mutex<Option<Child>>>,
    /// Set once we asked the sidecar to go away; its exit is then expected.
    closing: CancellationToken,
}

impl SidecarClient {
    async fn request(&self, command: SidecarCommand<'_>) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_request(id, &command)?;

        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.acks.lock().await.remove(&id);
            return Err(e);
        }
        debug!(operator = %self.operator, id, op = command.name(), "sidecar request sent");

        match timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(msg))) => Err(Error::External(format!("{} failed: {msg}", command.name()))),
            Ok(Err(_)) => Err(Error::External(format!(
                "sidecar exited before acknowledging {}",
                command.name()
            ))),
            Err(_) => {
                self.acks.lock().await.remove(&id);
                Err(Error::External(format!(
                    "timed out waiting for {} ack",
                    command.name()
                )))
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::External("sidecar stdin is closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin and give the process a moment to exit before killing it.
    async fn shutdown(&self) -> Result<()> {
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        match timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(operator = %self.operator, "sidecar exited: {status}");
                Ok(())
            }
            Err(_) => {
                warn!(operator = %self.operator, "sidecar did not exit, killing it");
                kill_child(&mut child).await
            }
        }
    }
}

#[async_trait]
impl RemoteClient for SidecarClient {
    async fn send_text(&self, to: &RemoteChatId, text: &str) -> Result<()> {
        self.request(SidecarCommand::SendText {
            to: to.as_str(),
            text,
        })
        .await
    }

    async fn send_media(
        &self,
        to: &RemoteChatId,
        media: &MediaPayload,
        caption: &str,
    ) -> Result<()> {
        self.request(SidecarCommand::SendMedia {
            to: to.as_str(),
            path: &media.path,
            mime_type: &media.mime_type,
            file_name: &media.file_name,
            caption,
        })
        .await
    }

    async fn logout(&self) -> Result<()> {
        // The sidecar exits after acking; that exit is not a disconnect.
        self.closing.cancel();
        let result = self.request(SidecarCommand::Logout).await;
        if let Err(e) = self.shutdown().await {
            error!(operator = %self.operator, "failed to stop sidecar: {e}");
        }
        result
    }
}

async fn kill_child(child: &mut Child) -> Result<()> {
    // If it's already exited, `try_wait` reaps it.
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    child.kill().await?;
    Ok(())
}

/// Reads sidecar stdout until EOF, then reports how the process ended.
struct StdoutReader {
    sink: RemoteEventSink,
    acks: PendingAcks,
    child: Arc<Mutex<Option<Child>>>,
    closing: CancellationToken,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdoutReader {
    async fn run(self, stdout: ChildStdout) {
        let operator = self.sink.operator();
        let mut ready = false;
        let mut finished = false;

        let mut reader = BufReader::new(stdout).lines();
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(operator = %operator, "sidecar stdout read failed: {e}");
                    break;
                }
            };

            let event = match parse_line(&line) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        operator = %operator,
                        "ignoring unparseable sidecar line ({e}): {}",
                        truncate_text(&line, 200)
                    );
                    continue;
                }
            };

            match event {
                SidecarEvent::Ack { id, ok, error } => {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "request rejected".to_string()))
                    };
                    match self.acks.lock().await.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => debug!(operator = %operator, id, "ack for unknown request"),
                    }
                }
                event => {
                    match &event {
                        SidecarEvent::Ready => ready = true,
                        SidecarEvent::Disconnected { .. } | SidecarEvent::AuthFailure { .. } => {
                            finished = true
                        }
                        _ => {}
                    }
                    let Some(remote) = event.into_remote() else {
                        continue;
                    };
                    if !self.sink.emit(remote) {
                        debug!(operator = %operator, "event channel closed, stopping reader");
                        break;
                    }
                }
            }
        }

        // Dropping the senders fails every outstanding request.
        self.acks.lock().await.clear();

        let status = self.reap().await;
        if self.closing.is_cancelled() || finished {
            return;
        }

        if let Some(task) = self.stderr_task {
            let _ = timeout(Duration::from_secs(2), task).await;
        }
        let mut reason = format!("sidecar exited ({status})");
        let stderr = self.stderr_tail.lock().await.snapshot();
        if !stderr.trim().is_empty() {
            reason.push_str("\nstderr (tail):\n");
            reason.push_str(&stderr);
        }

        warn!(operator = %operator, ready, "{reason}");
        let event = if ready {
            RemoteEvent::Disconnected { reason }
        } else {
            RemoteEvent::InitFailed { reason }
        };
        self.sink.emit(event);
    }

    async fn reap(&self) -> String {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return "stopped".to_string();
        };
        match timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => {
                if let Err(e) = kill_child(&mut child).await {
                    error!("failed to kill sidecar: {e}");
                }
                "killed after closing stdout".to_string()
            }
        }
    }
}

fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

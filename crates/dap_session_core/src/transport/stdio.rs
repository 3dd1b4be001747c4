//! Debug adapter spoken to over a child process's stdin/stdout with `Content-Length` framing.

use super::AdapterTransport;
use crate::cancellation::CancellationScope;
use crate::events::{AdapterEvent, AdapterExit};
use crate::{DebugError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type SharedChild = Arc<parking_lot::Mutex<Option<Child>>>;

/// How to launch the adapter process.
#[derive(Debug, Clone)]
pub struct AdapterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Append every DAP message to this JSONL file.
    pub protocol_log: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl AdapterCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            protocol_log: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// JSONL record of the raw protocol traffic, one envelope per message.
#[derive(Debug)]
pub struct ProtocolLog {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl ProtocolLog {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log(&self, direction: &str, payload: &Value) -> Result<()> {
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "direction": direction,
            "kind": classify_dap_message(payload),
            "payload": payload,
        });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Outbound half of a started adapter.
#[derive(Debug)]
struct Wire {
    writer: tokio::sync::Mutex<ChildStdin>,
    next_seq: AtomicU64,
    log: Option<Arc<ProtocolLog>>,
}

impl Wire {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn write(&self, message: &Value) -> Result<()> {
        if let Some(log) = &self.log {
            if let Err(e) = log.log("outbound", message).await {
                tracing::warn!(error = %e, "failed to write protocol log");
            }
        }
        let framed = frame_message(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_request_begin(
        &self,
        pending: &PendingMap,
        command: &str,
        arguments: Value,
    ) -> Result<(u64, oneshot::Receiver<Value>)> {
        let seq = self.next_seq();
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });

        let (tx, rx) = oneshot::channel();
        pending.lock().insert(seq, tx);

        if let Err(e) = self.write(&request).await {
            pending.lock().remove(&seq);
            return Err(DebugError::Transport(format!(
                "Failed to send DAP request '{command}' to adapter stdin: {e}"
            )));
        }
        tracing::debug!(seq, command, "sent DAP request");
        Ok((seq, rx))
    }
}

pub struct StdioTransport {
    command: AdapterCommand,
    child: SharedChild,
    wire: parking_lot::Mutex<Option<Arc<Wire>>>,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    supports_cancel: AtomicBool,
    disposed: AtomicBool,
}

impl StdioTransport {
    pub fn new(command: AdapterCommand) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            command,
            child: Arc::new(parking_lot::Mutex::new(None)),
            wire: parking_lot::Mutex::new(None),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            reader_task: parking_lot::Mutex::new(None),
            supports_cancel: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn wire(&self, command: &str) -> Result<Arc<Wire>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DebugError::Transport(format!(
                "adapter connection closed, can not send '{command}'"
            )));
        }
        self.wire
            .lock()
            .clone()
            .ok_or_else(|| DebugError::Transport(format!("adapter not started, can not send '{command}'")))
    }

    async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value> {
        let response = match timeout(self.command.request_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => {
                return Err(DebugError::Transport(format!(
                    "Adapter response channel closed while waiting for '{command}'"
                )));
            }
            Err(_) => {
                self.pending.lock().remove(&seq);
                return Err(DebugError::Timeout {
                    command: command.to_string(),
                    after: self.command.request_timeout,
                });
            }
        };

        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !success {
            return Err(DebugError::adapter(command, response_error_message(&response)));
        }
        Ok(response.get("body").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl AdapterTransport for StdioTransport {
    async fn start(&self) -> Result<()> {
        let program = &self.command.program;
        let mut command = Command::new(program);
        command
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.command.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            DebugError::Transport(format!(
                "Failed to spawn debug adapter at '{}': {e}",
                program.display()
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            DebugError::Transport("Adapter spawn failed: missing stdin pipe".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DebugError::Transport("Adapter spawn failed: missing stdout pipe".to_string())
        })?;
        if let Some(status) = child.try_wait()? {
            return Err(DebugError::Transport(format!(
                "Debug adapter exited during startup with status: {status}"
            )));
        }

        let log = match &self.command.protocol_log {
            Some(path) => Some(Arc::new(ProtocolLog::open(path).await?)),
            None => None,
        };
        let wire = Arc::new(Wire {
            writer: tokio::sync::Mutex::new(stdin),
            next_seq: AtomicU64::new(0),
            log,
        });

        tracing::info!(
            adapter = %program.display(),
            pid = child.id(),
            "debug adapter process running"
        );
        *self.child.lock() = Some(child);
        *self.wire.lock() = Some(wire.clone());
        let task = tokio::spawn(reader_loop(
            BufReader::new(stdout),
            self.pending.clone(),
            wire,
            self.events_tx.clone(),
            self.child.clone(),
        ));
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn request(
        &self,
        command: &str,
        arguments: Value,
        scope: Option<CancellationScope>,
    ) -> Result<Value> {
        let wire = self.wire(command)?;
        let (seq, rx) = wire.send_request_begin(&self.pending, command, arguments).await?;

        let Some(scope) = scope else {
            return self.await_response(command, seq, rx).await;
        };
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                self.pending.lock().remove(&seq);
                if self.supports_cancel.load(Ordering::SeqCst) {
                    tracing::debug!(seq, command, "cancelling DAP request");
                    match wire.send_request_begin(&self.pending, "cancel", json!({ "requestId": seq })).await {
                        Ok((cancel_seq, _)) => {
                            self.pending.lock().remove(&cancel_seq);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to send cancel request"),
                    }
                }
                Err(DebugError::Cancelled)
            }
            result = self.await_response(command, seq, rx) => result,
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().take()
    }

    fn set_supports_cancel(&self, supported: bool) {
        self.supports_cancel.store(supported, Ordering::SeqCst);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.pending.lock().clear();
        self.wire.lock().take();
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "debug adapter already gone");
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn reader_loop<R>(
    mut reader: R,
    pending: PendingMap,
    wire: Arc<Wire>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    child: SharedChild,
) where
    R: AsyncBufRead + Unpin,
{
    let error = loop {
        let message = match read_dap_message(&mut reader).await {
            Ok(value) => value,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break None,
            Err(e) => break Some(e.to_string()),
        };

        if let Some(log) = &wire.log {
            if let Err(e) = log.log("inbound", &message).await {
                tracing::warn!(error = %e, "failed to write protocol log");
            }
        }

        match message.get("type").and_then(Value::as_str) {
            Some("response") => {
                if let Some(request_seq) = message.get("request_seq").and_then(Value::as_u64) {
                    if let Some(tx) = pending.lock().remove(&request_seq) {
                        let _ = tx.send(message);
                    }
                }
            }
            Some("event") => {
                let name = message
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let body = message.get("body").cloned().unwrap_or(Value::Null);
                match AdapterEvent::parse(name, body) {
                    Ok(event) => {
                        tracing::trace!(event = name, "DAP event");
                        if events.send(event).is_err() {
                            tracing::debug!("event receiver dropped");
                        }
                    }
                    Err(e) => tracing::warn!(event = name, error = %e, "dropping malformed DAP event"),
                }
            }
            Some("request") => {
                let command = message
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let request_seq = message.get("seq").and_then(Value::as_u64).unwrap_or(0);
                let response = json!({
                    "seq": wire.next_seq(),
                    "type": "response",
                    "request_seq": request_seq,
                    "command": command,
                    "success": false,
                    "message": format!("reverse request '{command}' is not supported by this client"),
                });
                if let Err(e) = wire.write(&response).await {
                    tracing::warn!(command, error = %e, "failed to answer reverse request");
                }
            }
            _ => tracing::trace!("ignoring DAP message without a known type"),
        }
    };

    pending.lock().clear();
    let exit_code = child
        .lock()
        .as_mut()
        .and_then(|c| c.try_wait().ok().flatten())
        .and_then(|status| status.code());
    tracing::info!(?exit_code, ?error, "debug adapter connection closed");
    let _ = events.send(AdapterEvent::AdapterExited(AdapterExit { exit_code, error }));
}

pub(crate) async fn read_dap_message<R>(reader: &mut R) -> std::io::Result<Value>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "adapter stdout closed while reading DAP headers",
            ));
        }

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid Content-Length value: {e}"),
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing required Content-Length header",
        )
    })?;

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice::<Value>(&body).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid DAP JSON payload: {e}"),
        )
    })
}

fn frame_message(message: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn response_error_message(response: &Value) -> String {
    response
        .get("body")
        .and_then(|body| body.get("error"))
        .and_then(|error| error.get("format"))
        .and_then(Value::as_str)
        .or_else(|| response.get("message").and_then(Value::as_str))
        .unwrap_or("unknown adapter error")
        .to_string()
}

fn classify_dap_message(payload: &Value) -> &'static str {
    match payload.get("type").and_then(Value::as_str) {
        Some("request") => "request",
        Some("response") => "response",
        Some("event") => "event",
        _ => "other",
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

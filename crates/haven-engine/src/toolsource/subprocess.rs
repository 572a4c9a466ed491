use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, instrument, warn};

use crate::error::EngineError;

use super::{
    parse_tool_list, parse_tool_output, Catalog, JsonRpcRequest, JsonRpcResponse, ResourceInfo,
    Transport, ToolOutput, PROTOCOL_VERSION,
};

const INIT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Wire state for one running child. Rebuilt on every connect.
struct Wire {
    child: Child,
    next_id: AtomicU64,
    pending: PendingMap,
    tx_req: mpsc::Sender<String>,
    stderr_tail: Arc<Mutex<String>>,
}

/// Tool source backed by a child process speaking JSON-RPC 2.0 over stdio.
/// Requests are correlated by id through a oneshot map; lines without a
/// matching id (server notifications) are dropped.
pub struct SubprocessTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    /// Leave the child running across disconnects and reuse it on the next
    /// connect, for servers with expensive startup.
    keep_alive: bool,
    wire: Mutex<Option<Wire>>,
}

impl SubprocessTransport {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
        keep_alive: bool,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            working_dir,
            keep_alive,
            wire: Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(command = %self.command))]
    async fn spawn_wire(&self) -> Result<Wire, EngineError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Transport(format!("spawn {}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Transport("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let (tx_req, mut rx_req) = mpsc::channel::<String>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stderr_tail = Arc::new(Mutex::new(String::new()));

        let mut writer = BufWriter::new(stdin);
        tokio::spawn(async move {
            while let Some(line) = rx_req.recv().await {
                debug!(tx = %line, "rpc out");
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(rx = %line, "rpc in");
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) => {
                        if let Some(id) = resp.id {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                    Err(_) => warn!(line = %line, "unparsed rpc line"),
                }
            }
            // Dropping the senders fails every waiter with a closed channel.
            reader_pending.lock().await.clear();
        });

        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stderr = %line, "child stderr");
                    let mut tail = tail.lock().await;
                    if tail.len() < 2048 {
                        tail.push_str(&line);
                        tail.push('\n');
                    }
                }
            });
        }

        Ok(Wire {
            child,
            next_id: AtomicU64::new(1),
            pending,
            tx_req,
            stderr_tail,
        })
    }

    async fn call(
        wire: &Wire,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let id = wire.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::call(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| EngineError::Protocol(format!("encode {method}: {e}")))?;

        let (tx, rx) = oneshot::channel();
        wire.pending.lock().await.insert(id, tx);

        if wire.tx_req.send(line).await.is_err() {
            wire.pending.lock().await.remove(&id);
            return Err(EngineError::Transport("child stdin closed".into()));
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                let tail = wire.stderr_tail.lock().await.clone();
                return Err(EngineError::Transport(format!(
                    "child exited during {method}: {tail}"
                )));
            }
            Err(_) => {
                wire.pending.lock().await.remove(&id);
                return Err(EngineError::Transport(format!("{method} timed out")));
            }
        };

        if let Some(error) = response.error {
            return Err(EngineError::Protocol(format!(
                "{method} error {}: {}",
                error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| EngineError::Protocol(format!("{method} returned no result")))
    }

    async fn notify(wire: &Wire, method: &str) -> Result<(), EngineError> {
        let request = JsonRpcRequest::notification(method, None);
        let line = serde_json::to_string(&request)
            .map_err(|e| EngineError::Protocol(format!("encode {method}: {e}")))?;
        wire.tx_req
            .send(line)
            .await
            .map_err(|_| EngineError::Transport("child stdin closed".into()))
    }

    async fn initialize(wire: &Wire) -> Result<Catalog, EngineError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "haven", "version": env!("CARGO_PKG_VERSION")}
        });
        Self::call(wire, "initialize", Some(params), INIT_TIMEOUT).await?;
        Self::notify(wire, "notifications/initialized").await?;

        let tools = parse_tool_list(&Self::call(wire, "tools/list", None, REQUEST_TIMEOUT).await?);

        // Resource listing is optional in practice; a refusal is not fatal.
        let resources = match Self::call(wire, "resources/list", None, REQUEST_TIMEOUT).await {
            Ok(result) => result
                .get("resources")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|r| serde_json::from_value::<ResourceInfo>(r.clone()).ok())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        Ok(Catalog { tools, resources })
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self) -> Result<Catalog, EngineError> {
        let mut slot = self.wire.lock().await;

        // A kept-alive child survives disconnect; reuse it if it still talks.
        if self.keep_alive {
            if let Some(wire) = slot.as_ref() {
                if let Ok(result) = Self::call(wire, "tools/list", None, REQUEST_TIMEOUT).await {
                    return Ok(Catalog {
                        tools: parse_tool_list(&result),
                        resources: Vec::new(),
                    });
                }
            }
        }
        if let Some(mut old) = slot.take() {
            let _ = old.child.kill().await;
        }

        let wire = self.spawn_wire().await?;
        match tokio::time::timeout(INIT_TIMEOUT, Self::initialize(&wire)).await {
            Ok(Ok(catalog)) => {
                *slot = Some(wire);
                Ok(catalog)
            }
            Ok(Err(e)) => {
                let tail = wire.stderr_tail.lock().await.clone();
                warn!(error = %e, stderr = %tail, "subprocess initialize failed");
                Err(e)
            }
            Err(_) => {
                let tail = wire.stderr_tail.lock().await.clone();
                Err(EngineError::Transport(format!(
                    "initialize timed out: {tail}"
                )))
            }
        }
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let slot = self.wire.lock().await;
        let wire = slot
            .as_ref()
            .ok_or_else(|| EngineError::Transport("not connected".into()))?;
        Self::call(wire, "ping", None, PING_TIMEOUT).await.map(|_| ())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let slot = self.wire.lock().await;
        let wire = slot
            .as_ref()
            .ok_or_else(|| EngineError::Transport("not connected".into()))?;
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let result = Self::call(wire, "tools/call", Some(params), REQUEST_TIMEOUT).await?;
        Ok(parse_tool_output(&result))
    }

    async fn disconnect(&self) {
        if self.keep_alive {
            return;
        }
        let mut slot = self.wire.lock().await;
        if let Some(mut wire) = slot.take() {
            let _ = wire.child.kill().await;
        }
    }
}

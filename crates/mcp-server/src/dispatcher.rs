//! The JSON-RPC dispatch loop.
//!
//! One reader task owns the input line stream; tool calls run on a bounded
//! pool under a deadline; a single writer task emits each response as one
//! complete line. Correlation is by `id`; response order is not guaranteed.

use crate::env::Environment;
use crate::rpc::{self, Request, Response};
use crate::tools::{self, ToolError};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

const STATE_NEW: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_READY: u8 = 2;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub tool_timeout: Duration,
    pub tool_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(30),
            tool_concurrency: 1,
        }
    }
}

pub struct Dispatcher {
    /// `None` when the backing store could not be opened; the protocol
    /// stays up and tool calls answer `ServiceUninitialized`.
    env: Option<Arc<Environment>>,
    config: DispatcherConfig,
    state: Arc<AtomicU8>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(env: Option<Arc<Environment>>, config: DispatcherConfig) -> Self {
        Self {
            env,
            config,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
        }
    }

    /// Serve until the input stream closes.
    pub async fn run<R, W>(&self, input: R, output: W) -> std::io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(write_loop(output, write_rx));

        let semaphore = Arc::new(Semaphore::new(self.config.tool_concurrency.max(1)));
        let mut pending: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut lines = BufReader::new(input).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            pending.retain(|task| !task.is_finished());

            let value = match serde_json::from_str::<Value>(&line) {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("Unparsable request line: {err}");
                    send(
                        &write_tx,
                        Response::failure(Value::Null, rpc::PARSE_ERROR, "Parse error"),
                    )
                    .await;
                    continue;
                }
            };
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<Request>(value) {
                Ok(request) => {
                    if let Some(task) = self.handle(request, &write_tx, &semaphore) {
                        pending.push(task);
                    }
                }
                Err(err) => {
                    send(
                        &write_tx,
                        Response::failure(
                            id,
                            rpc::INVALID_REQUEST,
                            format!("invalid request: {err}"),
                        ),
                    )
                    .await;
                }
            }
        }

        // Input closed: let in-flight calls flush their responses.
        for task in pending {
            let _ = task.await;
        }
        drop(write_tx);
        let _ = writer_task.await;
        Ok(())
    }

    /// Handle one message; long-running tool calls return a join handle.
    fn handle(
        &self,
        request: Request,
        write_tx: &mpsc::Sender<String>,
        semaphore: &Arc<Semaphore>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if request.is_notification() {
            if request.method == "notifications/initialized"
                && self.state.load(Ordering::SeqCst) >= STATE_INITIALIZED
            {
                self.state.store(STATE_READY, Ordering::SeqCst);
                log::info!("Client completed the initialize handshake");
            }
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        if request.jsonrpc.as_deref() != Some(rpc::JSONRPC_VERSION) {
            let response =
                Response::failure(id, rpc::INVALID_REQUEST, "expected jsonrpc \"2.0\"");
            let tx = write_tx.clone();
            return Some(tokio::spawn(async move { send(&tx, response).await }));
        }

        match request.method.as_str() {
            "initialize" => {
                self.state
                    .compare_exchange(
                        STATE_NEW,
                        STATE_INITIALIZED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .ok();
                let response = Response::success(
                    id,
                    serde_json::json!({
                        "protocolVersion": rpc::PROTOCOL_VERSION,
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": "refork",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                );
                let tx = write_tx.clone();
                Some(tokio::spawn(async move { send(&tx, response).await }))
            }
            "tools/list" => {
                let response = if self.state.load(Ordering::SeqCst) == STATE_NEW {
                    Response::failure(
                        id,
                        rpc::SERVICE_UNINITIALIZED,
                        "initialize must be called first",
                    )
                } else {
                    Response::success(id, tools::tools_list_result())
                };
                let tx = write_tx.clone();
                Some(tokio::spawn(async move { send(&tx, response).await }))
            }
            "tools/call" => Some(self.spawn_tool_call(id, request.params, write_tx, semaphore)),
            other => {
                log::debug!("Unknown method {other}");
                let response =
                    Response::failure(id, rpc::METHOD_NOT_FOUND, format!("unknown method {other}"));
                let tx = write_tx.clone();
                Some(tokio::spawn(async move { send(&tx, response).await }))
            }
        }
    }

    fn spawn_tool_call(
        &self,
        id: Value,
        params: Value,
        write_tx: &mpsc::Sender<String>,
        semaphore: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<()> {
        let tx = write_tx.clone();
        let semaphore = semaphore.clone();
        let state = self.state.clone();
        let env = self.env.clone();
        let timeout = self.config.tool_timeout;

        tokio::spawn(async move {
            let response = tool_call_response(id, params, state, env, semaphore, timeout).await;
            send(&tx, response).await;
        })
    }
}

async fn tool_call_response(
    id: Value,
    params: Value,
    state: Arc<AtomicU8>,
    env: Option<Arc<Environment>>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
) -> Response {
    if state.load(Ordering::SeqCst) != STATE_READY {
        return Response::failure(
            id,
            rpc::SERVICE_UNINITIALIZED,
            "complete the initialize handshake before calling tools",
        );
    }
    let Some(env) = env else {
        return Response::failure(
            id,
            rpc::SERVICE_UNINITIALIZED,
            "storage is unavailable; check the service log",
        );
    };

    let Some(name) = params.get("name").and_then(Value::as_str).map(String::from) else {
        return Response::failure(id, rpc::INVALID_PARAMS, "missing tool name");
    };
    if !tools::is_known_tool(&name) {
        return Response::failure(id, rpc::TOOL_UNKNOWN, format!("unknown tool {name}"));
    }
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Response::failure(id, rpc::DEPENDENCY_UNAVAILABLE, "service shutting down")
        }
    };

    match tokio::time::timeout(timeout, tools::call_tool(&env, &name, &args)).await {
        Ok(Ok(text)) => Response::tool_text(id, text),
        Ok(Err(ToolError::InvalidParams(reason))) => {
            Response::failure(id, rpc::INVALID_PARAMS, reason)
        }
        Ok(Err(ToolError::DependencyUnavailable(reason))) => {
            Response::failure(id, rpc::DEPENDENCY_UNAVAILABLE, reason)
        }
        Err(_) => Response::failure(id, rpc::REQUEST_TIMEOUT, "Request timeout"),
    }
}

async fn send(tx: &mpsc::Sender<String>, response: Response) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                log::warn!("Writer task gone, dropping response");
            }
        }
        Err(err) => log::error!("Failed to serialize response: {err}"),
    }
}

/// Single writer: every response goes out as one complete line.
async fn write_loop<W: AsyncWrite + Unpin>(mut output: W, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if output.write_all(&bytes).await.is_err() {
            break;
        }
        if output.flush().await.is_err() {
            break;
        }
    }
}

//! JSON-RPC over stdio bridge.
//!
//! Turns a backend's byte streams into discrete request/response calls:
//! - Requests are written to stdin, one JSON object per line
//! - A background read loop parses stdout lines and resolves the pending
//!   call with the matching id
//! - Responses may arrive in any order; only the id matters
//! - When stdout closes every outstanding call fails with `ProcessTerminated`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::RouterError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type CallOutcome = Result<JsonRpcResponse, RouterError>;

// ─── Pending Calls ───────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingInner {
    calls: HashMap<u64, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

/// In-flight calls keyed by request id, shared with the read loop.
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<PendingInner>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call. Fails once the stream has closed.
    fn register(&self, id: u64) -> Option<oneshot::Receiver<CallOutcome>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(id, tx);
        Some(rx)
    }

    /// Hand a response to its caller. Returns `false` if nobody is waiting.
    fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let sender = self.lock().calls.remove(&id);
        match sender {
            // The receiver may already be gone (caller cancelled); that still
            // counts as matched.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) {
        self.lock().calls.remove(&id);
    }

    /// Fail every outstanding call and refuse new ones.
    fn close(&self, server: &str) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.calls.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RouterError::ProcessTerminated {
                server: server.to_string(),
            }));
        }
        count
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Removes a pending call when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ─── StdioBridge ─────────────────────────────────────────────────────────────

/// Correlating JSON-RPC bridge over one backend process's stdio.
pub struct StdioBridge {
    server_name: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioBridge {
    /// Wrap a process's stdin (`writer`) and stdout (`reader`).
    ///
    /// Spawns the read loop, so this must be called inside a tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R, call_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = Arc::new(PendingCalls::default());
        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Send a request and wait for its result using the bridge's default timeout.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RouterError> {
        self.send_with_timeout(method, params, self.call_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for the matching response.
    ///
    /// Never retries. On expiry the pending call is dropped before returning,
    /// so a late response is discarded by the read loop.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RouterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        line.push('\n');

        let rx = self.pending.register(id).ok_or_else(|| self.terminated())?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        tracing::debug!(server = %self.server_name, id, method, "sending request");

        let exchange = async {
            self.write_line(&line).await?;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(self.terminated()),
            }
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                RouterError::Timeout {
                    server: self.server_name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            })??;

        extract_result(response)
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RouterError> {
        if self.pending.is_closed() {
            return Err(self.terminated());
        }

        let mut line = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        line.push('\n');

        tokio::time::timeout(self.call_timeout, self.write_line(&line))
            .await
            .map_err(|_| RouterError::Timeout {
                server: self.server_name.clone(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            })?
    }

    /// Fail every pending call with `ProcessTerminated` and stop the read loop.
    ///
    /// Called by the supervisor once the process is gone.
    pub fn terminate(&self) {
        let failed = self.pending.close(&self.server_name);
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if failed > 0 {
            tracing::info!(server = %self.server_name, failed, "bridge torn down with calls in flight");
        }
    }

    /// Whether the stream has closed (no further calls are accepted).
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn write_line(&self, line: &str) -> Result<(), RouterError> {
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            if self.pending.is_closed() {
                self.terminated()
            } else {
                self.transport_error(format!("failed to write to stdin: {e}"))
            }
        })
    }

    fn terminated(&self) -> RouterError {
        RouterError::ProcessTerminated {
            server: self.server_name.clone(),
        }
    }

    fn transport_error(&self, reason: String) -> RouterError {
        RouterError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

impl Drop for StdioBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ─── Read Loop ───────────────────────────────────────────────────────────────

/// Read newline-delimited responses until the stream closes.
///
/// Anything that is not a response to an outstanding call is logged and
/// dropped; only end-of-stream or a read error ends the loop.
async fn read_loop<R>(server: String, reader: R, pending: Arc<PendingCalls>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::info!(server = %server, "backend stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read backend stdout");
                break;
            }
        }

        // A bad line is dropped like any other noise; it must not end the loop.
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "discarding non UTF-8 line");
                continue;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "discarding non JSON-RPC line");
                continue;
            }
        };

        if let Some(method) = response.method.as_deref() {
            tracing::debug!(server = %server, method, "ignoring backend-initiated message");
            continue;
        }

        match response.numeric_id() {
            Some(id) => {
                if !pending.resolve(id, Ok(response)) {
                    tracing::warn!(server = %server, id, "discarding response for unknown or expired id");
                }
            }
            None => {
                tracing::warn!(server = %server, id = %response.id, "discarding response with malformed id");
            }
        }
    }

    let failed = pending.close(&server);
    if failed > 0 {
        tracing::warn!(server = %server, failed, "failed in-flight calls after stream closed");
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `RouterError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, RouterError> {
    if let Some(err) = response.error {
        return Err(RouterError::Backend {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(RouterError::Backend {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

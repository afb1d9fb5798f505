//! Plugin-side runtime: a TCP listener that wires JSON-RPC traffic to a
//! user-supplied [`PluginImpl`] implementation.
//!
//! Handles:
//! * `getInfo` / `reportSummary` / `healthCheck` → method dispatch → response
//! * `execute` → parameter validation, a stream-backed [`OutputSink`], frame
//!   notifications in emission order, a completing response at end-of-stream
//! * `cancel` notifications → per-call cancellation tokens
//! * graceful stop: in-flight executes are tracked and drained before exit
//!
//! Usage:
//! ```ignore
//! use exec_plugin::plugin_runtime::run;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(MyPlugin::default(), 50051).await
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::ensure;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::PluginError;
use crate::jsonrpc::{
    Id, Message, Method, Request, Response, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
use crate::message::{
    code, CancelRequest, ErrorFrame, ExecuteRequest, ExecutionFrame, FrameNotification,
    HealthCheckResponse, HealthStatus, PluginInfo, Progress, SummaryRequest, SummaryResponse,
};
use crate::params;
use crate::sink::OutputSink;

// -----------------------------------------------------------------------------
// PluginImpl — implement this in your plugin binary
// -----------------------------------------------------------------------------

#[async_trait]
pub trait PluginImpl: Send + Sync + 'static {
    /// Metadata and parameter schema. Called for `getInfo` and by the
    /// default validation/summary implementations.
    async fn get_info(&self) -> PluginInfo;

    /// Authoritative schema check, run before `execute` is dispatched. The
    /// default applies the shared pipeline rules; override to enforce more
    /// (e.g. that a `float`-typed value actually parses).
    async fn validate_parameters(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let info = self.get_info().await;
        params::validate(params, &info.parameter_specs)?;
        Ok(())
    }

    /// Do the work, writing output/progress/errors into `sink`. Check
    /// `cancel` at every natural yield point and surface a CANCELLED error
    /// frame instead of continuing.
    async fn execute(
        &self,
        cancel: CancellationToken,
        params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PluginError>;

    /// Acknowledge the host's execution bookkeeping. The default echoes the
    /// request with `duration` in milliseconds filled in.
    async fn report_summary(&self, req: SummaryRequest) -> SummaryResponse {
        let name = self.get_info().await.name;
        SummaryResponse {
            plugin_name: name,
            start_time: req.start_time,
            end_time: req.end_time,
            duration: (req.end_time - req.start_time) as f64 / 1_000_000.0,
            success: req.success,
            error: req.error,
            metadata: req.metadata,
            metrics: req.metrics,
        }
    }

    /// Last call before the server exits.
    async fn close(&self) {}
}

// -----------------------------------------------------------------------------
// Stream-backed sink
// -----------------------------------------------------------------------------

/// Maps sink calls onto `frame` notifications for one execute call. All
/// frames and the completing response go through the connection's single
/// writer, so arrival order is emission order.
struct StreamSink {
    call_id: String,
    line_tx: mpsc::UnboundedSender<String>,
}

impl StreamSink {
    fn send_frame(&self, frame: ExecutionFrame) -> Result<(), PluginError> {
        let note = Request::notification(
            Method::Frame,
            Some(serde_json::to_value(FrameNotification {
                id: self.call_id.clone(),
                frame,
            })?),
        );
        let mut line = serde_json::to_string(&note)?;
        line.push('\n');
        self.line_tx
            .send(line)
            .map_err(|_| PluginError::Transport("output stream closed".into()))
    }
}

#[async_trait]
impl OutputSink for StreamSink {
    async fn on_output(&mut self, text: &str) -> Result<(), PluginError> {
        self.send_frame(ExecutionFrame::Output(text.to_string()))
    }

    async fn on_progress(&mut self, progress: Progress) -> Result<(), PluginError> {
        self.send_frame(ExecutionFrame::Progress(progress))
    }

    async fn on_error(
        &mut self,
        code: &str,
        message: &str,
        details: &str,
    ) -> Result<(), PluginError> {
        self.send_frame(ExecutionFrame::Error(ErrorFrame {
            code: code.to_string(),
            message: message.to_string(),
            details: details.to_string(),
        }))?;
        // The frame is on the wire: hand back the surfaced sentinel so the
        // runtime does not emit a duplicate EXECUTION_ERROR.
        Err(PluginError::surfaced(code, message))
    }
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

pub struct PluginServer {
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl PluginServer {
    /// Bind the listener. Port 0 picks an ephemeral port; read it back with
    /// [`local_addr`](Self::local_addr) before calling `serve`.
    pub async fn bind(port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and starts the graceful drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires, then wait out in-flight
    /// executes and call `plugin.close()`.
    pub async fn serve<P: PluginImpl>(self, plugin: P) -> anyhow::Result<()> {
        let plugin = Arc::new(plugin);
        let serving = Arc::new(AtomicBool::new(true));
        let tracker = TaskTracker::new();
        info!(addr = %self.listener.local_addr()?, "plugin server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        tokio::spawn(handle_connection(
                            Arc::clone(&plugin),
                            stream,
                            Arc::clone(&serving),
                            tracker.clone(),
                        ));
                    }
                    Err(err) => warn!(?err, "accept failed"),
                },
            }
        }

        serving.store(false, Ordering::SeqCst);
        tracker.close();
        tracker.wait().await;
        plugin.close().await;
        Ok(())
    }
}

/// Bind and serve on `port`. The entry point plugin binaries call.
pub async fn run<P: PluginImpl>(plugin: P, port: u16) -> anyhow::Result<()> {
    ensure!(port > 0, "invalid port: {port}");
    PluginServer::bind(port).await?.serve(plugin).await
}

// -----------------------------------------------------------------------------
// Per-connection plumbing
// -----------------------------------------------------------------------------

fn enqueue(line_tx: &mpsc::UnboundedSender<String>, rsp: Response) {
    match serde_json::to_string(&rsp) {
        Ok(mut line) => {
            line.push('\n');
            let _ = line_tx.send(line);
        }
        Err(err) => warn!(?err, "dropping unserializable response"),
    }
}

/// The `frame`/`cancel` notifications carry the execute call id as a plain
/// string, whatever `Id` form the caller used.
fn call_key(id: &Id) -> String {
    match id {
        Id::String(s) => s.clone(),
        Id::Number(n) => n.to_string(),
        Id::Null => String::new(),
    }
}

async fn handle_connection<P: PluginImpl>(
    plugin: Arc<P>,
    stream: TcpStream,
    serving: Arc<AtomicBool>,
    tracker: TaskTracker,
) {
    let (read_half, write_half) = stream.into_split();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(line) = line_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    // Cancelled when the connection dies, aborting its in-flight executes.
    let conn_token = CancellationToken::new();
    let cancels: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let req = match serde_json::from_str::<Message>(&line) {
            Ok(Message::Request(req)) => req,
            Ok(_) => continue, // stray response; not ours to answer
            Err(err) => {
                enqueue(
                    &line_tx,
                    Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(err.to_string()))),
                );
                continue;
            }
        };
        dispatch_request(&plugin, req, &line_tx, &serving, &tracker, &conn_token, &cancels);
    }

    conn_token.cancel();
}

fn dispatch_request<P: PluginImpl>(
    plugin: &Arc<P>,
    req: Request,
    line_tx: &mpsc::UnboundedSender<String>,
    serving: &Arc<AtomicBool>,
    tracker: &TaskTracker,
    conn_token: &CancellationToken,
    cancels: &Arc<DashMap<String, CancellationToken>>,
) {
    match req.method.parse::<Method>() {
        Ok(Method::GetInfo) => {
            if let Some(id) = req.id {
                let plugin = Arc::clone(plugin);
                let line_tx = line_tx.clone();
                tokio::spawn(async move {
                    let info = plugin.get_info().await;
                    enqueue(&line_tx, Response::success(id, json!(info)));
                });
            }
        }

        Ok(Method::HealthCheck) => {
            if let Some(id) = req.id {
                let status = if serving.load(Ordering::SeqCst) {
                    HealthStatus::Serving
                } else {
                    HealthStatus::NotServing
                };
                let verdict = HealthCheckResponse { status };
                enqueue(line_tx, Response::success(id, json!(verdict)));
            }
        }

        Ok(Method::ReportSummary) => {
            let Some(id) = req.id else { return };
            match req
                .params
                .and_then(|v| serde_json::from_value::<SummaryRequest>(v).ok())
            {
                Some(summary) => {
                    let plugin = Arc::clone(plugin);
                    let line_tx = line_tx.clone();
                    tokio::spawn(async move {
                        let resp = plugin.report_summary(summary).await;
                        enqueue(&line_tx, Response::success(id, json!(resp)));
                    });
                }
                None => enqueue(line_tx, Response::fail(id, INVALID_PARAMS, "Invalid params", None)),
            }
        }

        Ok(Method::Execute) => {
            let Some(id) = req.id else { return };
            let Some(request) = req
                .params
                .and_then(|v| serde_json::from_value::<ExecuteRequest>(v).ok())
            else {
                enqueue(line_tx, Response::fail(id, INVALID_PARAMS, "Invalid params", None));
                return;
            };
            if tracker.is_closed() {
                enqueue(line_tx, Response::fail(id, INTERNAL_ERROR, "server is draining", None));
                return;
            }
            let key = call_key(&id);
            let token = conn_token.child_token();
            cancels.insert(key.clone(), token.clone());

            let plugin = Arc::clone(plugin);
            let line_tx = line_tx.clone();
            let cancels = Arc::clone(cancels);
            tracker.spawn(async move {
                run_execute(plugin, id, key.clone(), request.params, token, &line_tx).await;
                cancels.remove(&key);
            });
        }

        Ok(Method::Cancel) => {
            if let Some(cancel) = req
                .params
                .and_then(|v| serde_json::from_value::<CancelRequest>(v).ok())
            {
                if let Some(token) = cancels.get(&cancel.id) {
                    token.cancel();
                }
            }
        }

        Ok(Method::Frame) | Err(_) => {
            if let Some(id) = req.id {
                enqueue(line_tx, Response::fail(id, METHOD_NOT_FOUND, "Method not found", None));
            }
        }
    }
}

async fn run_execute<P: PluginImpl>(
    plugin: Arc<P>,
    id: Id,
    call_id: String,
    params: HashMap<String, String>,
    cancel: CancellationToken,
    line_tx: &mpsc::UnboundedSender<String>,
) {
    let mut sink = StreamSink {
        call_id,
        line_tx: line_tx.clone(),
    };

    // Validate before any domain work; a rejection is a normal stream with a
    // single INVALID_PARAMETERS frame.
    if let Err(err) = plugin.validate_parameters(&params).await {
        let _ = sink.send_frame(ExecutionFrame::Error(ErrorFrame {
            code: code::INVALID_PARAMETERS.to_string(),
            message: err.to_string(),
            details: String::new(),
        }));
        enqueue(line_tx, Response::success(id, Value::Null));
        return;
    }

    match plugin.execute(cancel, params, &mut sink).await {
        Ok(()) => {}
        Err(err) if err.is_surfaced() => {} // frame already on the wire
        Err(err) => {
            let _ = sink.send_frame(ExecutionFrame::Error(ErrorFrame {
                code: code::EXECUTION_ERROR.to_string(),
                message: err.to_string(),
                details: String::new(),
            }));
        }
    }

    // End-of-stream marker; every frame above is already queued ahead of it.
    enqueue(line_tx, Response::success(id, Value::Null));
}

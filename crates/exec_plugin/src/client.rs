//! Host-side plugin proxy.
//!
//! One TCP connection per plugin, driven by a writer task and a reader task.
//! Unary calls park a oneshot responder in the in-flight table; `execute`
//! additionally registers a per-call frame channel that the reader feeds with
//! `frame` notifications until the completing response arrives.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::PluginError;
use crate::jsonrpc::{Id, Message, Method, Request, Response};
use crate::message::{
    CancelRequest, ExecuteRequest, ExecutionFrame, ExecutionSummary, FrameNotification,
    HealthCheckRequest, HealthCheckResponse, HealthStatus, PluginInfo, SummaryRequest,
    SummaryResponse,
};
use crate::params;
use crate::sink::OutputSink;

enum Outbound {
    Call(Request, oneshot::Sender<Response>),
    Notify(Request),
}

struct Shared {
    name: String,
    out_tx: mpsc::Sender<Outbound>,
    /// execute call id → frame channel for that call.
    frames: Arc<DashMap<String, mpsc::UnboundedSender<ExecutionFrame>>>,
    /// First successful `getInfo` response; failures are never cached.
    info: OnceCell<PluginInfo>,
    closed: CancellationToken,
}

/// Client handle for one plugin session. Cheap to clone; `close` is
/// idempotent and tears down both connection tasks.
#[derive(Clone)]
pub struct PluginClient {
    shared: Arc<Shared>,
}

fn response_key(id: &Id) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

impl PluginClient {
    /// Dial `addr` and start the connection tasks. The plugin `name` is
    /// recorded once here and stamped into every summary request.
    pub async fn connect(addr: &str, name: &str) -> Result<Self, PluginError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PluginError::Transport(format!("failed to connect to {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(32);
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let frames: Arc<DashMap<String, mpsc::UnboundedSender<ExecutionFrame>>> =
            Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        // writer: serialize outbound traffic onto the socket, one line each
        {
            let inflight = Arc::clone(&inflight);
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut writer = BufWriter::new(write_half);
                loop {
                    let outbound = tokio::select! {
                        _ = closed.cancelled() => break,
                        maybe = out_rx.recv() => match maybe {
                            Some(o) => o,
                            None => break,
                        },
                    };
                    let req = match outbound {
                        Outbound::Call(req, rsp_tx) => {
                            if let Some(id) = &req.id {
                                inflight.insert(response_key(id), rsp_tx);
                            }
                            req
                        }
                        Outbound::Notify(req) => req,
                    };
                    let mut line = match serde_json::to_string(&req) {
                        Ok(line) => line,
                        Err(err) => {
                            warn!(?err, "dropping unserializable request");
                            continue;
                        }
                    };
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // reader: route responses to their callers and frames to their calls
        {
            let inflight = Arc::clone(&inflight);
            let frames = Arc::clone(&frames);
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                loop {
                    let line = tokio::select! {
                        _ = closed.cancelled() => break,
                        next = lines.next_line() => match next {
                            Ok(Some(line)) => line,
                            _ => break,
                        },
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, tx)) = inflight.remove(&response_key(&rsp.id)) {
                                let _ = tx.send(rsp);
                            }
                        }
                        Ok(Message::Request(req)) if req.method == Method::Frame.as_ref() => {
                            let Some(params) = req.params else { continue };
                            match serde_json::from_value::<FrameNotification>(params) {
                                Ok(note) => {
                                    if let Some(tx) = frames.get(&note.id) {
                                        let _ = tx.send(note.frame);
                                    }
                                }
                                Err(err) => warn!(?err, "malformed frame notification"),
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(?err, "dropping malformed line from plugin"),
                    }
                }
                // Connection is gone. Dropping the parked senders wakes every
                // pending call and execute with a closed-channel error.
                inflight.clear();
                frames.clear();
            });
        }

        Ok(PluginClient {
            shared: Arc::new(Shared {
                name: name.to_string(),
                out_tx,
                frames,
                info: OnceCell::new(),
                closed,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    async fn call<R>(&self, method: Method, params: Option<Value>) -> Result<R, PluginError>
    where
        R: DeserializeOwned,
    {
        if self.shared.closed.is_cancelled() {
            return Err(PluginError::Transport("client is closed".into()));
        }
        let id = Id::String(Uuid::new_v4().to_string());
        let req = Request::call(id, method, params);
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.shared
            .out_tx
            .send(Outbound::Call(req, rsp_tx))
            .await
            .map_err(|_| PluginError::Transport("connection closed".into()))?;

        let rsp = rsp_rx
            .await
            .map_err(|_| PluginError::Transport("connection closed before response".into()))?;
        if let Some(err) = rsp.error {
            return Err(PluginError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(serde_json::from_value(rsp.result.unwrap_or(Value::Null))?)
    }

    /// Plugin metadata, fetched once and memoized. A failed fetch is
    /// returned as-is and retried on the next call.
    pub async fn get_info(&self) -> Result<PluginInfo, PluginError> {
        self.shared
            .info
            .get_or_try_init(|| self.call::<PluginInfo>(Method::GetInfo, None))
            .await
            .cloned()
    }

    /// Host-side schema check, same rules the plugin applies authoritatively.
    pub async fn validate_parameters(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let info = self.get_info().await?;
        params::validate(params, &info.parameter_specs)?;
        Ok(())
    }

    /// Run the plugin and pump every frame into `sink`, in arrival order.
    ///
    /// An error frame is delivered to the sink exactly once and the call
    /// fails with the already-surfaced error. Cancelling `cancel` sends a
    /// `cancel` notification and keeps draining until the plugin reacts
    /// (normally with a CANCELLED frame) or the stream ends.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PluginError> {
        let call_id = Uuid::new_v4().to_string();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        self.shared.frames.insert(call_id.clone(), frame_tx);

        let result = self.pump(&call_id, cancel, params, sink, frame_rx).await;

        self.shared.frames.remove(&call_id);
        if let Err(err) = &result {
            // A sink failure aborts the stream; tell the plugin to stop.
            if !err.is_surfaced() && !matches!(err, PluginError::Rpc { .. }) {
                let abort = CancelRequest { id: call_id };
                let note = Request::notification(Method::Cancel, Some(json!(abort)));
                let _ = self.shared.out_tx.try_send(Outbound::Notify(note));
            }
        }
        result
    }

    async fn pump(
        &self,
        call_id: &str,
        cancel: CancellationToken,
        params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
        mut frame_rx: mpsc::UnboundedReceiver<ExecutionFrame>,
    ) -> Result<(), PluginError> {
        if self.shared.closed.is_cancelled() {
            return Err(PluginError::Transport("client is closed".into()));
        }
        let req = Request::call(
            Id::String(call_id.to_string()),
            Method::Execute,
            Some(serde_json::to_value(ExecuteRequest { params })?),
        );
        let (rsp_tx, mut rsp_rx) = oneshot::channel();
        self.shared
            .out_tx
            .send(Outbound::Call(req, rsp_tx))
            .await
            .map_err(|_| PluginError::Transport("connection closed".into()))?;

        let mut cancel_requested = false;
        loop {
            tokio::select! {
                // Frames first: anything queued before the completing
                // response must reach the sink before we return.
                biased;

                maybe = frame_rx.recv() => match maybe {
                    Some(frame) => dispatch(frame, sink).await?,
                    None => {
                        return Err(PluginError::Transport(
                            "execute stream closed before completion".into(),
                        ))
                    }
                },

                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    let abort = CancelRequest { id: call_id.to_string() };
                    let note = Request::notification(Method::Cancel, Some(json!(abort)));
                    if self.shared.out_tx.send(Outbound::Notify(note)).await.is_err() {
                        return Err(PluginError::Cancelled);
                    }
                }

                rsp = &mut rsp_rx => {
                    while let Ok(frame) = frame_rx.try_recv() {
                        dispatch(frame, sink).await?;
                    }
                    return match rsp {
                        Ok(rsp) => match rsp.error {
                            Some(err) => Err(PluginError::Rpc {
                                code: err.code,
                                message: err.message,
                            }),
                            None => Ok(()),
                        },
                        Err(_) => Err(PluginError::Transport(
                            "execute stream closed before completion".into(),
                        )),
                    };
                }
            }
        }
    }

    /// Exchange execution bookkeeping for the final summary. `duration_ms`
    /// comes back computed by the plugin.
    pub async fn report_summary(
        &self,
        start_time: i64,
        end_time: i64,
        success: bool,
        error: Option<&str>,
        metadata: HashMap<String, String>,
        metrics: HashMap<String, f64>,
    ) -> Result<ExecutionSummary, PluginError> {
        let req = SummaryRequest {
            plugin_name: self.shared.name.clone(),
            start_time,
            end_time,
            success,
            error: error.unwrap_or_default().to_string(),
            metadata,
            metrics,
        };
        let resp: SummaryResponse = self
            .call(Method::ReportSummary, Some(serde_json::to_value(req)?))
            .await?;
        Ok(resp.into())
    }

    /// Liveness probe. The caller owns any per-attempt timeout.
    pub async fn check_health(&self) -> Result<HealthStatus, PluginError> {
        let resp: HealthCheckResponse = self
            .call(
                Method::HealthCheck,
                Some(json!(HealthCheckRequest::default())),
            )
            .await?;
        Ok(resp.status)
    }

    /// Tear down the connection tasks. Safe to call more than once; pending
    /// calls fail with a transport error.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }
}

async fn dispatch(frame: ExecutionFrame, sink: &mut dyn OutputSink) -> Result<(), PluginError> {
    match frame {
        ExecutionFrame::Output(text) => sink.on_output(&text).await,
        ExecutionFrame::Progress(progress) => sink.on_progress(progress).await,
        ExecutionFrame::Error(err) => {
            // The sink sees the error exactly once; the call then fails as
            // already-surfaced no matter what the sink returned.
            let _ = sink.on_error(&err.code, &err.message, &err.details).await;
            Err(PluginError::surfaced(err.code, err.message))
        }
    }
}

impl fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.shared.name)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

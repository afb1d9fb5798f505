//! Canned plugin implementations and sinks for tests.
//!
//! `MockPlugin` speaks the full contract in-process so host and SDK tests
//! can run a real client/server session over a loopback socket without
//! spawning a child process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::message::{code, ErrorFrame, ExecutionFrame, ParameterSpec, PluginInfo, Progress};
use crate::plugin_runtime::PluginImpl;
use crate::sink::OutputSink;

/// What a scripted [`MockPlugin`] does when executed.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Replay these frames into the sink, then finish cleanly (or, for an
    /// `Error` frame, with the surfaced error).
    Script(Vec<ExecutionFrame>),
    /// Return a plain execution error without surfacing it first.
    FailWith(String),
    /// Emit a progress frame every `tick` until cancelled, then surface
    /// CANCELLED. Ends on its own after `max_ticks` to keep tests bounded.
    RunUntilCancelled { tick: Duration, max_ticks: u32 },
}

#[derive(Clone)]
pub struct MockPlugin {
    info: PluginInfo,
    behavior: MockBehavior,
    info_calls: Arc<AtomicUsize>,
}

impl MockPlugin {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            info: mock_info(),
            behavior,
            info_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_info(mut self, info: PluginInfo) -> Self {
        self.info = info;
        self
    }

    /// How many `getInfo` calls actually reached the plugin; lets tests
    /// prove the client memoizes.
    pub fn info_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.info_calls)
    }
}

#[async_trait]
impl PluginImpl for MockPlugin {
    async fn get_info(&self) -> PluginInfo {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        self.info.clone()
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        _params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PluginError> {
        match &self.behavior {
            MockBehavior::Script(frames) => {
                for frame in frames.clone() {
                    match frame {
                        ExecutionFrame::Output(text) => sink.on_output(&text).await?,
                        ExecutionFrame::Progress(p) => sink.on_progress(p).await?,
                        ExecutionFrame::Error(e) => {
                            sink.on_error(&e.code, &e.message, &e.details).await?;
                            return Ok(());
                        }
                    }
                }
                Ok(())
            }
            MockBehavior::FailWith(message) => Err(PluginError::Execution(message.clone())),
            MockBehavior::RunUntilCancelled { tick, max_ticks } => {
                for step in 0..*max_ticks {
                    if cancel.is_cancelled() {
                        sink.on_error(code::CANCELLED, "operation cancelled by user", "")
                            .await?;
                        return Ok(());
                    }
                    sink.on_progress(Progress {
                        percent_complete: (step * 100 / (*max_ticks).max(1)) as f32,
                        stage: "working".into(),
                        current_step: step as i32 + 1,
                        total_steps: *max_ticks as i32,
                    })
                    .await?;
                    sleep(*tick).await;
                }
                sink.on_output("finished without cancellation").await?;
                Ok(())
            }
        }
    }
}

/// A hello-flavored schema: optional `message` with a default, `language`
/// with an allowed set, required `subject`.
pub fn mock_info() -> PluginInfo {
    let mut specs = HashMap::new();
    specs.insert(
        "message".to_string(),
        ParameterSpec {
            name: "message".into(),
            description: "text to echo".into(),
            default_value: Some("World".into()),
            value_type: "string".into(),
            ..Default::default()
        },
    );
    specs.insert(
        "language".to_string(),
        ParameterSpec {
            name: "language".into(),
            description: "greeting language".into(),
            default_value: Some("en".into()),
            value_type: "string".into(),
            allowed_values: vec!["en".into(), "es".into(), "fr".into(), "de".into()],
            ..Default::default()
        },
    );
    PluginInfo {
        name: "mock".into(),
        version: "0.0.1".into(),
        description: "a canned plugin for tests".into(),
        parameter_specs: specs,
        auth: None,
    }
}

/// Shorthand for a clean two-frame script.
pub fn happy_script() -> Vec<ExecutionFrame> {
    vec![
        ExecutionFrame::Progress(Progress {
            percent_complete: 0.0,
            stage: "Starting".into(),
            current_step: 1,
            total_steps: 2,
        }),
        ExecutionFrame::Output("hello from mock".into()),
        ExecutionFrame::Progress(Progress {
            percent_complete: 100.0,
            stage: "Finalizing".into(),
            current_step: 2,
            total_steps: 2,
        }),
    ]
}

/// Shorthand for a script that ends in a domain error frame.
pub fn failing_script() -> Vec<ExecutionFrame> {
    vec![
        ExecutionFrame::Output("about to fail".into()),
        ExecutionFrame::Error(ErrorFrame {
            code: "MOCK_FAILURE".into(),
            message: "scripted failure".into(),
            details: "details".into(),
        }),
    ]
}

/// One recorded sink event.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Output(String),
    Progress(Progress),
    Error {
        code: String,
        message: String,
        details: String,
    },
}

/// Sink that records everything it sees, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Error { code, message, .. } => {
                    Some((code.as_str(), message.as_str()))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn on_output(&mut self, text: &str) -> Result<(), PluginError> {
        self.events.push(SinkEvent::Output(text.to_string()));
        Ok(())
    }

    async fn on_progress(&mut self, progress: Progress) -> Result<(), PluginError> {
        self.events.push(SinkEvent::Progress(progress));
        Ok(())
    }

    async fn on_error(
        &mut self,
        code: &str,
        message: &str,
        details: &str,
    ) -> Result<(), PluginError> {
        self.events.push(SinkEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
            details: details.to_string(),
        });
        Ok(())
    }
}

use thiserror::Error;

use crate::message::code;
use crate::params::ParamError;

/// Errors that cross the host/plugin seam.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The connection itself failed: dial refused, stream broke mid-call,
    /// end-of-stream without a completing response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The failure was already delivered to the sink as an error frame.
    /// Callers must not surface it a second time.
    #[error("{code}: {message}")]
    Surfaced { code: String, message: String },

    /// Schema-level rejection detected before any domain work.
    #[error("invalid parameters: {0}")]
    InvalidParams(#[from] ParamError),

    /// The call's context was cancelled before the stream completed.
    #[error("execution cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A domain failure the plugin reports without its own error frame; the
    /// runtime wraps it as a single EXECUTION_ERROR frame.
    #[error("{0}")]
    Execution(String),
}

impl PluginError {
    pub fn surfaced(code: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::Surfaced {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True when the failure already reached the sink as an error frame.
    pub fn is_surfaced(&self) -> bool {
        matches!(self, PluginError::Surfaced { .. })
    }

    /// True for caller-initiated aborts, whether caught locally or echoed
    /// back by the plugin as a CANCELLED frame.
    pub fn is_cancelled(&self) -> bool {
        match self {
            PluginError::Cancelled => true,
            PluginError::Surfaced { code, .. } => code == code::CANCELLED,
            _ => false,
        }
    }
}

//! Data model shared by host and plugins: plugin metadata, the parameter
//! schema, the execution frame stream, and execution summaries.
//!
//! Everything here is a plain serde struct so it can travel the wire as-is;
//! `JsonSchema` derives feed the `schema` subcommand on the host side.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Error codes carried in [`ErrorFrame::code`].
pub mod code {
    /// Schema-level rejection, emitted before any domain work starts.
    pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
    /// A domain error the plugin did not surface itself.
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    /// The caller aborted the call.
    pub const CANCELLED: &str = "CANCELLED";
}

/// Metadata a plugin reports about itself via `getInfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub parameter_specs: HashMap<String, ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Describes a single parameter a plugin accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Advisory type tag ("string", "float", ...). Plugins may enforce it.
    #[serde(rename = "type", default)]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

/// Execution progress as reported by a plugin mid-stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Progress {
    pub percent_complete: f32,
    pub stage: String,
    pub current_step: i32,
    pub total_steps: i32,
}

/// Terminal error carried on the execute stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: String,
}

/// One value on the execute stream. Externally tagged, so the wire shape is
/// `{"output": ...}` | `{"progress": {...}}` | `{"error": {...}}` and
/// receivers can match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFrame {
    Output(String),
    Progress(Progress),
    Error(ErrorFrame),
}

/// Params object of the `execute` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Params object of a `frame` notification: the originating call id plus one
/// frame. Frames for one call id arrive in emission order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FrameNotification {
    pub id: String,
    pub frame: ExecutionFrame,
}

/// Params object of a `cancel` notification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CancelRequest {
    pub id: String,
}

/// Params object of `reportSummary`. Times are unix nanoseconds; an empty
/// `error` means the execution succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SummaryRequest {
    pub plugin_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Result object of `reportSummary`. `duration` is milliseconds, computed by
/// the plugin as `(end_time - start_time) / 1_000_000`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SummaryResponse {
    pub plugin_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: f64,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// What the host keeps after a summary exchange. Unlike the wire structs the
/// absent error really is absent here; an empty wire string is never turned
/// into an error value.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSummary {
    pub plugin_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: f64,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl From<SummaryResponse> for ExecutionSummary {
    fn from(resp: SummaryResponse) -> Self {
        let error = if resp.error.is_empty() {
            None
        } else {
            Some(resp.error)
        };
        ExecutionSummary {
            plugin_name: resp.plugin_name,
            start_time: resp.start_time,
            end_time: resp.end_time,
            duration_ms: resp.duration,
            success: resp.success,
            error,
            metadata: resp.metadata,
            metrics: resp.metrics,
        }
    }
}

/// Liveness probe verdict, orthogonal to the plugin methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_shape_is_a_oneof() {
        let out = serde_json::to_value(ExecutionFrame::Output("hi".into())).unwrap();
        assert_eq!(out, serde_json::json!({"output": "hi"}));

        let err = serde_json::to_value(ExecutionFrame::Error(ErrorFrame {
            code: code::CANCELLED.into(),
            message: "stop".into(),
            details: String::new(),
        }))
        .unwrap();
        assert_eq!(err["error"]["code"], "CANCELLED");

        let prog: ExecutionFrame = serde_json::from_value(serde_json::json!({
            "progress": {"percent_complete": 50.0, "stage": "mid", "current_step": 2, "total_steps": 4}
        }))
        .unwrap();
        match prog {
            ExecutionFrame::Progress(p) => assert_eq!(p.current_step, 2),
            other => panic!("decoded as {other:?}"),
        }
    }

    #[test]
    fn empty_summary_error_maps_to_none() {
        let resp = SummaryResponse {
            plugin_name: "p".into(),
            success: true,
            error: String::new(),
            ..Default::default()
        };
        let summary: ExecutionSummary = resp.into();
        assert!(summary.error.is_none());

        let resp = SummaryResponse {
            error: "boom".into(),
            ..Default::default()
        };
        let summary: ExecutionSummary = resp.into();
        assert_eq!(summary.error.as_deref(), Some("boom"));
    }

    #[test]
    fn health_status_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Serving).unwrap(),
            "\"SERVING\""
        );
        assert_eq!(
            serde_json::from_str::<HealthStatus>("\"NOT_SERVING\"").unwrap(),
            HealthStatus::NotServing
        );
    }

    #[test]
    fn param_spec_type_field_renames() {
        let spec: ParameterSpec = serde_json::from_value(serde_json::json!({
            "name": "language",
            "type": "string",
            "allowed_values": ["en", "es"]
        }))
        .unwrap();
        assert_eq!(spec.value_type, "string");
        assert!(!spec.required);
    }
}

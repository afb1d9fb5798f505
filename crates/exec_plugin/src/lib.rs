//! SDK for gantry plugins and their host.
//!
//! A plugin is an external process serving newline-delimited JSON-RPC 2.0
//! over TCP. Plugin authors implement [`plugin_runtime::PluginImpl`] and hand
//! it to [`plugin_runtime::run`]; the host side talks to it through
//! [`client::PluginClient`]. Both ends share the data model in [`message`]
//! and the parameter pipeline in [`params`].

pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod message;
pub mod params;
pub mod plugin_runtime;
pub mod plugin_test_util;
pub mod sink;

pub use client::PluginClient;
pub use error::PluginError;
pub use message::{
    code, ExecutionFrame, ExecutionSummary, HealthStatus, ParameterSpec, PluginInfo, Progress,
};
pub use plugin_runtime::{run, PluginImpl, PluginServer};
pub use sink::OutputSink;

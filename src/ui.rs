//! Terminal rendering: the console sink for streamed frames, plus the
//! formatted `info` and summary views.

use async_trait::async_trait;
use exec_plugin::{ExecutionSummary, OutputSink, PluginError, PluginInfo, Progress};
use tracing::{error, info};

use crate::catalog::{PluginDescriptor, PluginKind};

/// Sink that renders frames as prefixed log lines.
pub struct ConsoleSink {
    plugin_name: String,
}

impl ConsoleSink {
    pub fn new(plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
        }
    }
}

#[async_trait]
impl OutputSink for ConsoleSink {
    async fn on_output(&mut self, text: &str) -> Result<(), PluginError> {
        info!("[{}] {}", self.plugin_name, text);
        Ok(())
    }

    async fn on_progress(&mut self, progress: Progress) -> Result<(), PluginError> {
        info!(
            "[{}] Progress: {:.1}% ({} - Step {}/{})",
            self.plugin_name,
            progress.percent_complete,
            progress.stage,
            progress.current_step,
            progress.total_steps
        );
        Ok(())
    }

    async fn on_error(
        &mut self,
        code: &str,
        message: &str,
        details: &str,
    ) -> Result<(), PluginError> {
        if details.is_empty() {
            error!("[{}] Error {}: {}", self.plugin_name, code, message);
        } else {
            error!(
                "[{}] Error {}: {}\nDetails: {}",
                self.plugin_name, code, message, details
            );
        }
        Ok(())
    }
}

/// Print descriptor plus runtime schema for `gantry info <name>`.
pub fn display_plugin_info(info: &PluginInfo, descriptor: &PluginDescriptor) {
    println!("Plugin Information:");
    println!("  Name: {}", info.name);
    println!("  Version: {}", info.version);
    println!("  Description: {}", info.description);
    println!("  Type: {}", descriptor.kind);

    let mut names: Vec<_> = info.parameter_specs.keys().collect();
    names.sort();

    let usage: Vec<String> = names
        .iter()
        .map(|name| {
            let spec = &info.parameter_specs[*name];
            if spec.required {
                format!("--{name} <value>")
            } else {
                format!("[--{name} <value>]")
            }
        })
        .collect();
    println!();
    println!("Usage:");
    println!("  gantry run {} {}", info.name, usage.join(" "));
    println!();

    println!("Details:");
    if descriptor.kind == PluginKind::Command {
        println!("  Command Template: {}", descriptor.command);
    }
    if descriptor.kind == PluginKind::Remote {
        println!("  Address: {}", descriptor.address);
    } else {
        println!("  Working Directory: {}", descriptor.working_dir.display());
    }
    if !descriptor.environment.is_empty() {
        println!("  Environment Variables:");
        let mut env: Vec<_> = descriptor.environment.iter().collect();
        env.sort();
        for (key, value) in env {
            println!("    {key}: {value}");
        }
    }

    println!();
    println!("Parameters:");
    for name in names {
        let spec = &info.parameter_specs[name];
        println!("  - {name}:");
        println!("      Description: {}", spec.description);
        println!("      Required: {}", spec.required);
        if let Some(default) = &spec.default_value {
            println!("      Schema Default: {default}");
        }
        if let Some(default) = descriptor.defaults.get(name) {
            println!("      Config Default: {default}");
        }
        if !spec.allowed_values.is_empty() {
            println!("      Allowed Values: {:?}", spec.allowed_values);
        }
    }
}

/// Render the post-run summary block.
pub fn display_execution_summary(summary: &ExecutionSummary) {
    info!("Plugin Summary: {}", summary.plugin_name);
    info!("  Success: {}", summary.success);
    info!("  Duration: {:.2}ms", summary.duration_ms);
    if let Some(error) = &summary.error {
        info!("  Error: {error}");
    }
    if !summary.metadata.is_empty() {
        info!("  Metadata:");
        let mut metadata: Vec<_> = summary.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            info!("    {key}: {value}");
        }
    }
    if !summary.metrics.is_empty() {
        info!("  Metrics:");
        let mut metrics: Vec<_> = summary.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in metrics {
            info!("    {key}: {value:.2}");
        }
    }
}

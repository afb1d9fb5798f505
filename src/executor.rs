//! The one-shot execution coordinator: everything `gantry run` does between
//! the catalog lookup and the final summary line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use exec_plugin::message::code;
use exec_plugin::{ExecutionSummary, OutputSink, PluginError};
use exec_plugin::params;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::health::HealthConfig;
use crate::supervisor::Supervisor;
use crate::ui;

/// How one run ended, for exit-code policy.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// The caller cancelled; not a failure for exit-code purposes.
    Cancelled,
    /// `surfaced` means the sink already showed the failure and it must not
    /// be printed again.
    Failed { surfaced: bool, message: String },
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: Option<ExecutionSummary>,
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Resolve the descriptor, bring the plugin up, run it against `sink`, and
/// report the summary. The supervisor is one-shot: everything it started is
/// torn down before this returns.
pub async fn execute_plugin(
    cancel: CancellationToken,
    catalog: &Catalog,
    name: &str,
    params: HashMap<String, String>,
    sink: &mut dyn OutputSink,
) -> anyhow::Result<RunReport> {
    let descriptor = catalog.get(name)?;
    descriptor
        .validate()
        .with_context(|| format!("invalid plugin configuration for {name}"))?;

    let supervisor = Supervisor::new(HealthConfig::default());
    let report = run_session(cancel, &supervisor, catalog, name, params, sink).await;
    supervisor.stop_all().await;
    report
}

async fn run_session(
    cancel: CancellationToken,
    supervisor: &Arc<Supervisor>,
    catalog: &Catalog,
    name: &str,
    mut params: HashMap<String, String>,
    sink: &mut dyn OutputSink,
) -> anyhow::Result<RunReport> {
    let descriptor = catalog.get(name)?;
    supervisor
        .start(name, descriptor, &params)
        .await
        .with_context(|| format!("failed to start plugin {name}"))?;
    info!(%name, kind = %descriptor.kind, "started plugin");

    let client = supervisor.get(name).await?;
    let plugin_info = client
        .get_info()
        .await
        .context("failed to get plugin info")?;

    params::merge_defaults(&mut params, &descriptor.defaults, &plugin_info.parameter_specs);

    let start_time = now_ns();
    // Host-side check fails fast; the plugin runs the same rules again as
    // the authority. A rejection is surfaced through the sink like the
    // plugin-side frame would be.
    let exec_result = match client.validate_parameters(&params).await {
        Ok(()) => client.execute(cancel.clone(), params.clone(), sink).await,
        Err(PluginError::InvalidParams(err)) => {
            let message = err.to_string();
            let _ = sink.on_error(code::INVALID_PARAMETERS, &message, "").await;
            Err(PluginError::surfaced(code::INVALID_PARAMETERS, message))
        }
        Err(other) => Err(other),
    };
    let end_time = now_ns();

    let mut metadata = params.clone();
    metadata.insert("plugin_type".to_string(), descriptor.kind.to_string());
    let metrics = HashMap::from([(
        "execution_time_ms".to_string(),
        (end_time - start_time) as f64 / 1_000_000.0,
    )]);

    let error_text = exec_result.as_ref().err().map(|err| err.to_string());
    let summary = match client
        .report_summary(
            start_time,
            end_time,
            exec_result.is_ok(),
            error_text.as_deref(),
            metadata,
            metrics,
        )
        .await
    {
        Ok(summary) => {
            ui::display_execution_summary(&summary);
            Some(summary)
        }
        Err(err) => {
            warn!(%name, %err, "failed to report execution summary");
            None
        }
    };

    let outcome = match exec_result {
        Ok(()) => RunOutcome::Completed,
        Err(err) if cancel.is_cancelled() || err.is_cancelled() => {
            info!(%name, "plugin execution cancelled");
            RunOutcome::Cancelled
        }
        Err(err) => RunOutcome::Failed {
            surfaced: err.is_surfaced(),
            message: err.to_string(),
        },
    };

    Ok(RunReport { outcome, summary })
}

/// Start a plugin just long enough to print its descriptor and schema.
pub async fn show_plugin_info(catalog: &Catalog, name: &str) -> anyhow::Result<()> {
    let descriptor = catalog.get(name)?;
    descriptor
        .validate()
        .with_context(|| format!("invalid plugin configuration for {name}"))?;

    let supervisor = Supervisor::new(HealthConfig::default());
    let result = async {
        supervisor
            .start(name, descriptor, &HashMap::new())
            .await
            .with_context(|| format!("failed to start plugin {name}"))?;
        let client = supervisor.get(name).await?;
        let plugin_info = tokio::time::timeout(Duration::from_secs(10), client.get_info())
            .await
            .context("timed out fetching plugin info")?
            .context("failed to get plugin info")?;
        ui::display_plugin_info(&plugin_info, descriptor);
        Ok(())
    }
    .await;
    supervisor.stop_all().await;
    result
}

/// Parse trailing `run` arguments into a parameter map. Accepts
/// `--key=value`, `--key value`, and bare `--flag` (which becomes `"true"`);
/// anything not starting with `-` on its own is ignored.
pub fn parse_run_flags(args: &[String]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if !arg.starts_with('-') {
            i += 1;
            continue;
        }
        let key = arg.trim_start_matches('-');

        if let Some((k, v)) = key.split_once('=') {
            params.insert(k.to_string(), v.to_string());
        } else if i + 1 < args.len() && !args[i + 1].starts_with('-') {
            params.insert(key.to_string(), args[i + 1].clone());
            i += 1;
        } else {
            params.insert(key.to_string(), "true".to_string());
        }
        i += 1;
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_equals_form() {
        let params = parse_run_flags(&args(&["--message=World", "--language=en"]));
        assert_eq!(params["message"], "World");
        assert_eq!(params["language"], "en");
    }

    #[test]
    fn parses_space_form_and_bare_flags() {
        let params = parse_run_flags(&args(&["--num1", "1.5", "--verbose", "--num2", "2.5"]));
        assert_eq!(params["num1"], "1.5");
        assert_eq!(params["num2"], "2.5");
        assert_eq!(params["verbose"], "true");
    }

    #[test]
    fn trailing_flag_is_boolean() {
        let params = parse_run_flags(&args(&["--dry-run"]));
        assert_eq!(params["dry-run"], "true");
    }

    #[test]
    fn bare_values_are_ignored() {
        let params = parse_run_flags(&args(&["stray", "--key=v"]));
        assert_eq!(params.len(), 1);
        assert_eq!(params["key"], "v");
    }
}

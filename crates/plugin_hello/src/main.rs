//! A friendly plugin that greets you, with staged progress and a pause long
//! enough to watch it stream.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use exec_plugin::message::{code, ParameterSpec, PluginInfo, Progress};
use exec_plugin::{OutputSink, PluginError, PluginImpl};

const PLUGIN_VERSION: &str = "1.0.0";

struct HelloPlugin;

#[async_trait]
impl PluginImpl for HelloPlugin {
    async fn get_info(&self) -> PluginInfo {
        let mut specs = HashMap::new();
        specs.insert(
            "message".to_string(),
            ParameterSpec {
                name: "message".into(),
                description: "The name or message to greet".into(),
                required: false,
                default_value: Some("World".into()),
                value_type: "string".into(),
                allowed_values: vec![],
            },
        );
        specs.insert(
            "language".to_string(),
            ParameterSpec {
                name: "language".into(),
                description: "The language to use for greeting".into(),
                required: false,
                default_value: Some("en".into()),
                value_type: "string".into(),
                allowed_values: vec!["en".into(), "es".into(), "fr".into(), "de".into()],
            },
        );
        PluginInfo {
            name: "hello".into(),
            version: PLUGIN_VERSION.into(),
            description: "A friendly plugin that greets you".into(),
            parameter_specs: specs,
            auth: None,
        }
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PluginError> {
        let message = params
            .get("message")
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| "World".to_string());
        let language = params
            .get("language")
            .filter(|l| !l.is_empty())
            .cloned()
            .unwrap_or_else(|| "en".to_string());

        sink.on_progress(Progress {
            stage: "Starting".into(),
            percent_complete: 0.0,
            current_step: 1,
            total_steps: 4,
        })
        .await?;
        sink.on_output(&format!("Starting to greet {message} in {language}..."))
            .await?;
        sleep(Duration::from_secs(1)).await;

        sink.on_progress(Progress {
            stage: "Processing".into(),
            percent_complete: 25.0,
            current_step: 2,
            total_steps: 4,
        })
        .await?;

        for step in 0..3 {
            if cancel.is_cancelled() {
                sink.on_error(
                    code::CANCELLED,
                    "Operation cancelled by user",
                    "context cancelled",
                )
                .await?;
                return Ok(());
            }
            sink.on_output("...").await?;
            sink.on_progress(Progress {
                stage: "Processing".into(),
                percent_complete: 25.0 + (step + 1) as f32 * 25.0,
                current_step: 2 + step,
                total_steps: 4,
            })
            .await?;
            sleep(Duration::from_millis(500)).await;
        }

        let greeting = match language.as_str() {
            "es" => format!("¡Hola, {message}!"),
            "fr" => format!("Bonjour, {message}!"),
            "de" => format!("Hallo, {message}!"),
            _ => format!("Hello, {message}!"),
        };

        sink.on_progress(Progress {
            stage: "Finalizing".into(),
            percent_complete: 100.0,
            current_step: 4,
            total_steps: 4,
        })
        .await?;
        sink.on_output(&greeting).await?;
        Ok(())
    }
}

/// Accepts `-port N`, `--port N` and `--port=N`; every other argument (the
/// host forwards launch parameters as `--key=value`) is ignored.
fn port_from_args() -> Option<u16> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-port" || arg == "--port" {
            return args.next()?.parse().ok();
        }
        if let Some(value) = arg.strip_prefix("--port=").or(arg.strip_prefix("-port=")) {
            return value.parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is inherited by the host; keep our logs on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let port = port_from_args().context("specify a port with -port")?;
    exec_plugin::run(HelloPlugin, port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_plugin::plugin_test_util::{RecordingSink, SinkEvent};

    #[tokio::test]
    async fn greets_in_the_requested_language() {
        let mut sink = RecordingSink::new();
        let params = HashMap::from([
            ("message".to_string(), "Welt".to_string()),
            ("language".to_string(), "de".to_string()),
        ]);
        HelloPlugin
            .execute(CancellationToken::new(), params, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.outputs().last().copied(), Some("Hallo, Welt!"));
        assert!(sink.errors().is_empty());
    }

    #[tokio::test]
    async fn defaults_apply_when_params_are_absent() {
        let mut sink = RecordingSink::new();
        HelloPlugin
            .execute(CancellationToken::new(), HashMap::new(), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.outputs().last().copied(), Some("Hello, World!"));
    }

    #[tokio::test]
    async fn schema_rejects_unknown_language() {
        let err = HelloPlugin
            .validate_parameters(&HashMap::from([(
                "language".to_string(),
                "jp".to_string(),
            )]))
            .await
            .expect_err("jp is not allowed");
        assert!(err.to_string().contains("jp"));
    }

    #[tokio::test]
    async fn pre_cancelled_run_surfaces_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = RecordingSink::new();
        HelloPlugin
            .execute(cancel, HashMap::new(), &mut sink)
            .await
            .unwrap();
        match sink.events.last() {
            Some(SinkEvent::Error { code, .. }) => {
                assert_eq!(code, exec_plugin::message::code::CANCELLED)
            }
            other => panic!("expected CANCELLED, got {other:?}"),
        }
    }
}

//! Sums `num1`..`numN` parameters with running totals and staged progress.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use exec_plugin::message::{code, ParameterSpec, PluginInfo, Progress};
use exec_plugin::params::{self, ParamError};
use exec_plugin::{OutputSink, PluginError, PluginImpl};

const PLUGIN_VERSION: &str = "1.0.0";

struct AdditionPlugin;

fn number_spec(name: &str, description: &str, required: bool) -> ParameterSpec {
    ParameterSpec {
        name: name.into(),
        description: description.into(),
        required,
        default_value: None,
        value_type: "float".into(),
        allowed_values: vec![],
    }
}

#[async_trait]
impl PluginImpl for AdditionPlugin {
    async fn get_info(&self) -> PluginInfo {
        let mut specs = HashMap::new();
        specs.insert(
            "num1".to_string(),
            number_spec("num1", "First number to add", true),
        );
        specs.insert(
            "num2".to_string(),
            number_spec("num2", "Second number to add", true),
        );
        specs.insert(
            "num3".to_string(),
            number_spec("num3", "Third number to add (optional)", false),
        );
        specs.insert(
            "num4".to_string(),
            number_spec("num4", "Fourth number to add (optional)", false),
        );
        specs.insert(
            "num5".to_string(),
            number_spec("num5", "Fifth number to add (optional)", false),
        );
        PluginInfo {
            name: "addition".into(),
            version: PLUGIN_VERSION.into(),
            description: "A plugin that adds a series of numbers together".into(),
            parameter_specs: specs,
            auth: None,
        }
    }

    /// The schema rules plus an actual parse of every `num*` value; the
    /// `float` type tag is enforced here, not by the shared pipeline.
    async fn validate_parameters(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let info = self.get_info().await;
        params::validate(params, &info.parameter_specs)?;

        for (key, value) in params {
            if key.starts_with("num") {
                value.parse::<f64>().map_err(|err| {
                    PluginError::InvalidParams(ParamError::Malformed {
                        name: key.clone(),
                        reason: err.to_string(),
                    })
                })?;
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        params: HashMap<String, String>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PluginError> {
        sink.on_output("Collecting numbers...").await?;
        sink.on_progress(Progress {
            stage: "Initialization".into(),
            percent_complete: 0.0,
            current_step: 1,
            total_steps: 4,
        })
        .await?;
        sleep(Duration::from_millis(500)).await;

        let mut keys: Vec<&String> = params.keys().filter(|k| k.starts_with("num")).collect();
        keys.sort();

        if keys.is_empty() {
            sink.on_error(
                "NO_NUMBERS",
                "no numbers provided (use num1, num2, num3, etc.)",
                "",
            )
            .await?;
            return Ok(());
        }

        sink.on_progress(Progress {
            stage: "Processing Input".into(),
            percent_complete: 25.0,
            current_step: 2,
            total_steps: 4,
        })
        .await?;

        let mut numbers = Vec::with_capacity(keys.len());
        for key in &keys {
            if cancel.is_cancelled() {
                sink.on_error(code::CANCELLED, "Operation cancelled by user", "")
                    .await?;
                return Ok(());
            }
            let value = &params[*key];
            let number: f64 = match value.parse() {
                Ok(n) => n,
                Err(err) => {
                    sink.on_error(
                        "INVALID_NUMBER",
                        &format!("invalid number for {key}"),
                        &err.to_string(),
                    )
                    .await?;
                    return Ok(());
                }
            };
            numbers.push(number);
            sink.on_output(&format!("Added {key} = {number:.2}")).await?;
            sleep(Duration::from_millis(300)).await;
        }

        sink.on_output("\nCalculating sum...").await?;
        sink.on_progress(Progress {
            stage: "Calculating".into(),
            percent_complete: 50.0,
            current_step: 3,
            total_steps: 4,
        })
        .await?;
        sleep(Duration::from_millis(500)).await;

        let mut sum = 0.0;
        for (i, number) in numbers.iter().enumerate() {
            if cancel.is_cancelled() {
                sink.on_error(code::CANCELLED, "Operation cancelled by user", "")
                    .await?;
                return Ok(());
            }
            sum += number;
            if i > 0 {
                sink.on_output(&format!(
                    "Running total: {:.2} + {:.2} = {:.2}",
                    sum - number,
                    number,
                    sum
                ))
                .await?;
                sink.on_progress(Progress {
                    stage: "Calculating".into(),
                    percent_complete: 50.0 + i as f32 * 25.0 / (numbers.len() - 1) as f32,
                    current_step: 3,
                    total_steps: 4,
                })
                .await?;
                sleep(Duration::from_millis(300)).await;
            }
        }

        let expression: Vec<String> = numbers.iter().map(|n| format!("{n:.2}")).collect();
        sink.on_progress(Progress {
            stage: "Finalizing".into(),
            percent_complete: 100.0,
            current_step: 4,
            total_steps: 4,
        })
        .await?;
        sink.on_output(&format!(
            "\nFinal result: {} = {sum:.2}",
            expression.join(" + ")
        ))
        .await?;
        Ok(())
    }
}

/// Accepts `-port N`, `--port N` and `--port=N`; other arguments are the
/// host-forwarded launch parameters and are ignored.
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
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let port = port_from_args().context("specify a port with -port")?;
    exec_plugin::run(AdditionPlugin, port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_plugin::plugin_test_util::RecordingSink;

    fn nums(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn sums_three_numbers() {
        let mut sink = RecordingSink::new();
        AdditionPlugin
            .execute(
                CancellationToken::new(),
                nums(&[("num1", "1.5"), ("num2", "2.5"), ("num3", "6.0")]),
                &mut sink,
            )
            .await
            .unwrap();

        let last = sink.outputs().last().copied().unwrap().to_string();
        assert!(last.contains("= 10.00"), "final line was {last:?}");
        assert_eq!(last, "\nFinal result: 1.50 + 2.50 + 6.00 = 10.00");
    }

    #[tokio::test]
    async fn missing_required_number_fails_validation() {
        let err = AdditionPlugin
            .validate_parameters(&nums(&[("num1", "1.0")]))
            .await
            .expect_err("num2 is required");
        assert!(err.to_string().contains("num2"));
    }

    #[tokio::test]
    async fn non_numeric_value_fails_validation() {
        let err = AdditionPlugin
            .validate_parameters(&nums(&[("num1", "1.0"), ("num2", "two")]))
            .await
            .expect_err("two is not a float");
        assert!(err.to_string().contains("num2"));
    }

    #[tokio::test]
    async fn running_totals_are_streamed() {
        let mut sink = RecordingSink::new();
        AdditionPlugin
            .execute(
                CancellationToken::new(),
                nums(&[("num1", "1.0"), ("num2", "2.0")]),
                &mut sink,
            )
            .await
            .unwrap();

        let outputs = sink.outputs().join("\n");
        assert!(outputs.contains("Added num1 = 1.00"));
        assert!(outputs.contains("Running total: 1.00 + 2.00 = 3.00"));
    }
}

use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gantry::catalog::Catalog;
use gantry::executor::{self, RunOutcome};
use gantry::ui::ConsoleSink;
use gantry::{logger, schema};

#[derive(Parser, Debug)]
#[command(name = "gantry", about = "Out-of-process plugin host", version = "0.3.0")]
struct Cli {
    /// Path to the plugin catalog
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write daily log files into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available plugins
    List,

    /// Show detailed information for a specific plugin
    Info { name: String },

    /// Run a plugin
    Run(RunArgs),

    /// Emit JSON Schemas for the catalog and plugin metadata
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    name: String,

    /// Plugin parameters: --key=value, --key value, or a bare --flag
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    params: Vec<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logger::init_tracing(&cli.log_level, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::List => {
            let catalog = Catalog::load(&cli.config)?;
            println!("Available plugins:");
            for (name, description) in catalog.descriptions() {
                println!("  {name}: {description}");
            }
            Ok(())
        }

        Commands::Info { name } => {
            let catalog = Catalog::load(&cli.config)?;
            executor::show_plugin_info(&catalog, &name).await
        }

        Commands::Schema(args) => schema::write_schema(&args.out_dir),

        Commands::Run(args) => {
            let catalog = Catalog::load(&cli.config)?;
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            let params = executor::parse_run_flags(&args.params);
            let mut sink = ConsoleSink::new(&args.name);
            let report =
                executor::execute_plugin(cancel, &catalog, &args.name, params, &mut sink).await?;

            match report.outcome {
                RunOutcome::Completed => {
                    info!("plugin execution completed");
                    Ok(())
                }
                RunOutcome::Cancelled => Ok(()),
                RunOutcome::Failed { surfaced, message } => {
                    if surfaced {
                        // the sink already showed the failure
                        Err(anyhow!("plugin {} execution failed", args.name))
                    } else {
                        Err(anyhow!("plugin {} execution failed: {message}", args.name))
                    }
                }
            }
        }
    }
}

/// SIGINT/SIGTERM cancel the run; the plugin gets to wind down and the exit
/// code stays zero.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%err, "could not install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("received interrupt, shutting down");
        cancel.cancel();
    });
}

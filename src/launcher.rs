//! Turns a descriptor plus launch parameters into a running child process
//! and a connected client.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use exec_plugin::{PluginClient, PluginError};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::debug;

use crate::catalog::{PluginDescriptor, PluginKind};

/// Readiness probing: one dial per second, five attempts.
pub const READY_ATTEMPTS: u32 = 5;
pub const READY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0} plugins are not launched locally")]
    NotLaunchable(PluginKind),

    #[error("empty command after template substitution")]
    EmptyCommand,

    #[error("failed to start plugin {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("failed to connect to plugin {name} after {attempts} attempts: {source}")]
    NotReady {
        name: String,
        attempts: u32,
        #[source]
        source: PluginError,
    },
}

/// Build `(program, argv)` for a local plugin.
///
/// `binary`: `path -port N --key=value ...`. `command`: the template with
/// `{port}`, `{path}` and `{args}` substituted, then whitespace-split — no
/// shell is involved. Extra parameters are passed sorted by key.
pub fn build_command(
    descriptor: &PluginDescriptor,
    params: &HashMap<String, String>,
) -> Result<(String, Vec<String>), LaunchError> {
    let mut extra: Vec<String> = params.iter().map(|(k, v)| format!("--{k}={v}")).collect();
    extra.sort();

    match descriptor.kind {
        PluginKind::Binary => {
            let mut args = vec!["-port".to_string(), descriptor.port.to_string()];
            args.extend(extra);
            Ok((descriptor.path.to_string_lossy().into_owned(), args))
        }
        PluginKind::Command => {
            let command = descriptor
                .command
                .replace("{port}", &descriptor.port.to_string())
                .replace("{path}", &descriptor.path.to_string_lossy())
                .replace("{args}", &extra.join(" "));
            let mut parts = command.split_whitespace().map(str::to_string);
            match parts.next() {
                Some(program) => Ok((program, parts.collect())),
                None => Err(LaunchError::EmptyCommand),
            }
        }
        PluginKind::Remote => Err(LaunchError::NotLaunchable(descriptor.kind)),
    }
}

/// Spawn the child. Stdout/stderr are inherited so plugin logging lands on
/// the host's terminal; descriptor environment entries are appended to the
/// inherited environment.
pub fn spawn(
    name: &str,
    descriptor: &PluginDescriptor,
    params: &HashMap<String, String>,
) -> Result<Child, LaunchError> {
    let (program, args) = build_command(descriptor, params)?;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if !descriptor.working_dir.as_os_str().is_empty() {
        command.current_dir(&descriptor.working_dir);
    }
    for (key, value) in &descriptor.environment {
        command.env(key, value);
    }

    debug!(%name, %program, ?args, "spawning plugin process");
    command.spawn().map_err(|source| LaunchError::Spawn {
        name: name.to_string(),
        source,
    })
}

/// Wait for a freshly spawned plugin to accept its first connection.
pub async fn await_ready(name: &str, port: u16) -> Result<PluginClient, LaunchError> {
    let addr = format!("localhost:{port}");
    let mut last: Option<PluginError> = None;
    for _ in 0..READY_ATTEMPTS {
        sleep(READY_DELAY).await;
        match PluginClient::connect(&addr, name).await {
            Ok(client) => return Ok(client),
            Err(err) => last = Some(err),
        }
    }
    Err(LaunchError::NotReady {
        name: name.to_string(),
        attempts: READY_ATTEMPTS,
        source: last.unwrap_or_else(|| PluginError::Transport("no dial attempted".into())),
    })
}

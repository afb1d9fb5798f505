//! Owns the lifecycle of every active plugin: launch, readiness, health
//! monitoring, bounded restart, teardown.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use exec_plugin::{HealthStatus, PluginClient, PluginError};
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::PluginDescriptor;
use crate::health::{monitor_health, HealthConfig, LivenessProbe};
use crate::launcher::{self, LaunchError};

/// A plugin is autonomously restarted at most this many times over the life
/// of its managed handle. The counter never resets, even after a recovery.
pub const MAX_RESTARTS: u32 = 3;

/// Runtime record for one active plugin. Owned by the supervisor's map and
/// mutated only under its write lock.
pub struct ManagedPlugin {
    pub descriptor: PluginDescriptor,
    pub client: PluginClient,
    /// None for remote plugins.
    pub process: Option<Child>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    /// The merged parameter map used at spawn; restarts reuse it verbatim.
    pub launch_params: HashMap<String, String>,
    /// Stops this plugin's health monitor. None for remote plugins.
    monitor: Option<CancellationToken>,
}

/// Snapshot of a managed plugin's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginStatus {
    pub restart_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("plugin {0} is already running")]
    AlreadyRunning(String),

    #[error("plugin {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("failed to connect to plugin {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: PluginError,
    },
}

pub struct Supervisor {
    plugins: RwLock<HashMap<String, ManagedPlugin>>,
    /// Root token; cancelling it stops every monitor.
    shutdown: CancellationToken,
    health: HealthConfig,
}

impl Supervisor {
    pub fn new(health: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            plugins: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            health,
        })
    }

    /// Bring a plugin up and take ownership of it.
    ///
    /// Local kinds are spawned and probed for readiness; `remote` is a
    /// single dial. Any failure kills a started child and leaves the map
    /// untouched. A second `start` for a live name fails without side
    /// effects.
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        descriptor: &PluginDescriptor,
        params: &HashMap<String, String>,
    ) -> Result<(), SupervisorError> {
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let (client, process) = if descriptor.is_local() {
            let mut child = launcher::spawn(name, descriptor, params)?;
            match launcher::await_ready(name, descriptor.port).await {
                Ok(client) => (client, Some(child)),
                Err(err) => {
                    if let Err(kill_err) = child.kill().await {
                        warn!(%name, %kill_err, "failed to kill unready plugin process");
                    }
                    return Err(err.into());
                }
            }
        } else {
            let client = PluginClient::connect(&descriptor.dial_address(), name)
                .await
                .map_err(|source| SupervisorError::Connect {
                    name: name.to_string(),
                    source,
                })?;
            (client, None)
        };

        let monitor = if process.is_some() {
            let token = self.shutdown.child_token();
            self.spawn_monitor(name, token.clone());
            Some(token)
        } else {
            None
        };

        plugins.insert(
            name.to_string(),
            ManagedPlugin {
                descriptor: descriptor.clone(),
                client,
                process,
                restart_count: 0,
                last_error: None,
                launch_params: params.clone(),
                monitor,
            },
        );
        Ok(())
    }

    fn spawn_monitor(self: &Arc<Self>, name: &str, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let probe: Arc<dyn LivenessProbe> = Arc::new(NamedProbe {
            name: name.to_string(),
            supervisor: weak.clone(),
        });
        let config = self.health.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            monitor_health(token, probe, config, move |err| {
                let weak = weak.clone();
                let name = name.clone();
                async move {
                    if let Some(supervisor) = weak.upgrade() {
                        supervisor.handle_unhealthy(&name, err).await;
                    }
                }
            })
            .await;
        });
    }

    /// Health-monitor callback: record the failure and, within budget,
    /// restart in place.
    async fn handle_unhealthy(&self, name: &str, err: PluginError) {
        warn!(%name, %err, "plugin failed its liveness probes");
        let mut plugins = self.plugins.write().await;
        let Some(managed) = plugins.get_mut(name) else {
            return; // stopped since the probe ran
        };

        managed.last_error = Some(err.to_string());
        if managed.restart_count < MAX_RESTARTS {
            managed.restart_count += 1;
            info!(%name, attempt = managed.restart_count, "restarting plugin");
            restart(name, managed).await;
        }
    }

    /// Stop one plugin: close the transport, kill the process for local
    /// kinds, drop the handle. Teardown hiccups are logged, not fatal.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let mut managed = {
            let mut plugins = self.plugins.write().await;
            plugins
                .remove(name)
                .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?
        };

        if let Some(token) = managed.monitor.take() {
            token.cancel();
        }
        managed.client.close();
        if let Some(process) = managed.process.as_mut() {
            if let Err(err) = process.kill().await {
                warn!(%name, %err, "failed to kill plugin process");
            }
        }
        Ok(())
    }

    /// Stop everything: monitors first (via the root token), then each
    /// plugin's transport and process.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let mut plugins = self.plugins.write().await;
        for (name, mut managed) in plugins.drain() {
            managed.client.close();
            if let Some(process) = managed.process.as_mut() {
                if let Err(err) = process.kill().await {
                    warn!(%name, %err, "failed to kill plugin process");
                }
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<PluginClient, SupervisorError> {
        let plugins = self.plugins.read().await;
        plugins
            .get(name)
            .map(|managed| managed.client.clone())
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))
    }

    pub async fn status(&self, name: &str) -> Option<PluginStatus> {
        let plugins = self.plugins.read().await;
        plugins.get(name).map(|managed| PluginStatus {
            restart_count: managed.restart_count,
            last_error: managed.last_error.clone(),
        })
    }

    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Kill, relaunch, pause one second, dial once. On failure the error is
/// recorded and nothing more is attempted until the next unhealthy tick.
/// Caller holds the map write lock.
async fn restart(name: &str, managed: &mut ManagedPlugin) {
    managed.client.close();
    let Some(process) = managed.process.as_mut() else {
        managed.last_error = Some("cannot restart a plugin without a local process".to_string());
        return;
    };
    if let Err(err) = process.kill().await {
        warn!(%name, %err, "failed to kill plugin process before restart");
    }

    let mut child = match launcher::spawn(name, &managed.descriptor, &managed.launch_params) {
        Ok(child) => child,
        Err(err) => {
            managed.last_error = Some(format!("failed to restart plugin: {err}"));
            return;
        }
    };

    sleep(Duration::from_secs(1)).await;

    match PluginClient::connect(&managed.descriptor.dial_address(), name).await {
        Ok(client) => {
            managed.client = client;
            managed.process = Some(child);
        }
        Err(err) => {
            managed.last_error = Some(format!("failed to reconnect to plugin: {err}"));
            if let Err(kill_err) = child.kill().await {
                warn!(%name, %kill_err, "failed to kill unreachable restarted plugin");
            }
        }
    }
}

/// Probes whatever client the supervisor currently holds for `name`, so a
/// restart swaps the probed connection too.
struct NamedProbe {
    name: String,
    supervisor: Weak<Supervisor>,
}

#[async_trait]
impl LivenessProbe for NamedProbe {
    async fn check(&self) -> Result<HealthStatus, PluginError> {
        let Some(supervisor) = self.supervisor.upgrade() else {
            return Err(PluginError::Transport("supervisor is gone".into()));
        };
        let client = supervisor
            .get(&self.name)
            .await
            .map_err(|err| PluginError::Transport(err.to_string()))?;
        client.check_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PluginKind;
    use exec_plugin::plugin_test_util::{MockBehavior, MockPlugin};
    use exec_plugin::PluginServer;

    async fn mock_endpoint() -> (String, CancellationToken) {
        let server = PluginServer::bind(0).await.unwrap();
        let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(MockPlugin::new(MockBehavior::Script(vec![]))));
        (addr, shutdown)
    }

    fn remote_descriptor(addr: &str) -> PluginDescriptor {
        PluginDescriptor {
            kind: PluginKind::Remote,
            address: addr.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_get_stop_roundtrip_for_remote() {
        let (addr, server_shutdown) = mock_endpoint().await;
        let supervisor = Supervisor::new(HealthConfig::default());
        let descriptor = remote_descriptor(&addr);

        supervisor
            .start("mock", &descriptor, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(supervisor.running().await, vec!["mock"]);

        let client = supervisor.get("mock").await.unwrap();
        assert_eq!(client.check_health().await.unwrap(), HealthStatus::Serving);

        supervisor.stop("mock").await.unwrap();
        assert!(supervisor.running().await.is_empty());
        assert!(matches!(
            supervisor.stop("mock").await,
            Err(SupervisorError::NotRunning(_))
        ));

        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn second_start_for_a_live_name_is_rejected() {
        let (addr, server_shutdown) = mock_endpoint().await;
        let supervisor = Supervisor::new(HealthConfig::default());
        let descriptor = remote_descriptor(&addr);

        supervisor
            .start("mock", &descriptor, &HashMap::new())
            .await
            .unwrap();
        assert!(matches!(
            supervisor.start("mock", &descriptor, &HashMap::new()).await,
            Err(SupervisorError::AlreadyRunning(_))
        ));
        // the original handle is untouched
        assert!(supervisor.get("mock").await.is_ok());

        supervisor.stop_all().await;
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_launch_leaves_the_map_untouched() {
        let supervisor = Supervisor::new(HealthConfig::default());
        let descriptor = PluginDescriptor {
            kind: PluginKind::Binary,
            path: "/does/not/exist".into(),
            port: 50020,
            ..Default::default()
        };

        let err = supervisor
            .start("ghost", &descriptor, &HashMap::new())
            .await
            .expect_err("spawn must fail");
        assert!(matches!(err, SupervisorError::Launch(LaunchError::Spawn { .. })));
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn failed_remote_dial_is_reported_without_retry() {
        let supervisor = Supervisor::new(HealthConfig::default());
        // port 1 is privileged and closed
        let descriptor = remote_descriptor("127.0.0.1:1");

        let err = supervisor
            .start("far", &descriptor, &HashMap::new())
            .await
            .expect_err("dial must fail");
        assert!(matches!(err, SupervisorError::Connect { .. }));
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_empties_the_map_and_cancels_monitors() {
        let (addr, server_shutdown) = mock_endpoint().await;
        let supervisor = Supervisor::new(HealthConfig::default());

        supervisor
            .start("mock", &remote_descriptor(&addr), &HashMap::new())
            .await
            .unwrap();
        supervisor.stop_all().await;

        assert!(supervisor.running().await.is_empty());
        assert!(supervisor.shutdown.is_cancelled());
        server_shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_budget_caps_at_three() {
        let (addr, server_shutdown) = mock_endpoint().await;
        let supervisor = Supervisor::new(HealthConfig::default());

        // Hand-build a local managed plugin whose restarts can never
        // reconnect: the descriptor points at a closed port.
        let client = PluginClient::connect(&addr, "victim").await.unwrap();
        let process = tokio::process::Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let descriptor = PluginDescriptor {
            kind: PluginKind::Binary,
            path: "/bin/sleep".into(),
            port: 1,
            ..Default::default()
        };
        supervisor.plugins.write().await.insert(
            "victim".to_string(),
            ManagedPlugin {
                descriptor,
                client,
                process: Some(process),
                restart_count: 0,
                last_error: None,
                launch_params: HashMap::new(),
                monitor: None,
            },
        );

        for _ in 0..5 {
            supervisor
                .handle_unhealthy("victim", PluginError::Transport("probe failed".into()))
                .await;
        }

        let status = supervisor.status("victim").await.unwrap();
        assert_eq!(status.restart_count, MAX_RESTARTS);
        assert!(status.last_error.is_some());

        supervisor.stop_all().await;
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn unhealthy_report_for_a_stopped_plugin_is_ignored() {
        let supervisor = Supervisor::new(HealthConfig::default());
        supervisor
            .handle_unhealthy("nobody", PluginError::Transport("late probe".into()))
            .await;
        assert!(supervisor.status("nobody").await.is_none());
    }
}

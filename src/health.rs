//! Periodic liveness probing for local plugins.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exec_plugin::{HealthStatus, PluginClient, PluginError};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hard cap on a single probe attempt.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Anything that can answer a liveness probe.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self) -> Result<HealthStatus, PluginError>;
}

#[async_trait]
impl LivenessProbe for PluginClient {
    async fn check(&self) -> Result<HealthStatus, PluginError> {
        self.check_health().await
    }
}

/// Probe `probe` every `config.interval` until `cancel` fires.
///
/// A failing tick retries up to `max_retries` times with `retry_delay`
/// between attempts; if no attempt comes back SERVING, `on_unhealthy` is
/// invoked exactly once for that tick and ticking resumes. What happens next
/// (typically a restart) is the callback's decision.
pub async fn monitor_health<F, Fut>(
    cancel: CancellationToken,
    probe: Arc<dyn LivenessProbe>,
    config: HealthConfig,
    on_unhealthy: F,
) where
    F: Fn(PluginError) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately; swallow that so probing starts one
    // interval after the plugin came up
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut last_err: Option<PluginError> = None;
        for attempt in 0..config.max_retries {
            match timeout(PROBE_TIMEOUT, probe.check()).await {
                Ok(Ok(HealthStatus::Serving)) => {
                    last_err = None;
                    break;
                }
                Ok(Ok(HealthStatus::NotServing)) => {
                    last_err = Some(PluginError::Transport(
                        "liveness probe returned NOT_SERVING".into(),
                    ));
                }
                Ok(Err(err)) => last_err = Some(err),
                Err(_) => {
                    last_err = Some(PluginError::Transport("liveness probe timed out".into()))
                }
            }
            debug!(attempt, "liveness probe attempt failed");
            if attempt + 1 < config.max_retries {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(config.retry_delay) => {}
                }
            }
        }

        if let Some(err) = last_err {
            on_unhealthy(err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedProbe {
        verdicts: Mutex<VecDeque<Result<HealthStatus, ()>>>,
    }

    impl ScriptedProbe {
        fn new(verdicts: Vec<Result<HealthStatus, ()>>) -> Arc<Self> {
            Arc::new(Self {
                verdicts: Mutex::new(verdicts.into()),
            })
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn check(&self) -> Result<HealthStatus, PluginError> {
            let next = self.verdicts.lock().unwrap().pop_front();
            match next {
                Some(Ok(status)) => Ok(status),
                // script exhausted or scripted failure
                _ => Err(PluginError::Transport("probe refused".into())),
            }
        }
    }

    fn fast_config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(20),
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn serving_probe_never_fires_the_callback() {
        let probe = ScriptedProbe::new(vec![Ok(HealthStatus::Serving); 10]);
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&fired);
        let task = tokio::spawn(monitor_health(
            cancel.clone(),
            probe,
            fast_config(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_absorb_a_transient_failure() {
        // first tick: two failures then SERVING; the callback must not fire
        let probe = ScriptedProbe::new(vec![
            Err(()),
            Err(()),
            Ok(HealthStatus::Serving),
            Ok(HealthStatus::Serving),
        ]);
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&fired);
        let task = tokio::spawn(monitor_health(
            cancel.clone(),
            probe,
            fast_config(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fire_once_per_tick() {
        let probe = ScriptedProbe::new(vec![]); // always fails
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&fired);
        let task = tokio::spawn(monitor_health(
            cancel.clone(),
            probe,
            HealthConfig {
                interval: Duration::from_millis(30),
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
            },
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        // roughly three ticks' worth of run time
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let count = fired.load(Ordering::SeqCst);
        assert!((1..=4).contains(&count), "fired {count} times");
    }
}

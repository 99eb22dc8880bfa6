use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

use super::loader::BackendLoader;
use crate::config::WatchdogOptions;

/// Periodic sweep evicting backends idle or busy for too long.
pub struct Watchdog {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish()
    }
}

impl Watchdog {
    /// Start sweeping; `None` when neither timeout is configured.
    pub fn spawn(loader: Arc<BackendLoader>, options: WatchdogOptions) -> Option<Self> {
        if !options.enabled() {
            return None;
        }
        info!(
            idle_timeout = ?options.idle_timeout,
            busy_timeout = ?options.busy_timeout,
            interval = ?options.interval,
            "Starting backend watchdog"
        );
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(&loader, &options).await,
                    _ = stop.notified() => {
                        debug!("Watchdog stopped");
                        break;
                    }
                }
            }
        });
        Some(Self { handle, shutdown })
    }

    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

/// One pass over the loaded backends.
pub async fn sweep(loader: &BackendLoader, options: &WatchdogOptions) {
    for instance in loader.loaded() {
        let model = instance.model().to_string();
        let expired = match (instance.busy_for(), instance.idle_for()) {
            (Some(busy), _) if exceeds(busy, options.busy_timeout) => {
                warn!(model = %model, busy_for = ?busy, "Backend busy for too long");
                true
            }
            (_, Some(idle)) if exceeds(idle, options.idle_timeout) => {
                info!(model = %model, idle_for = ?idle, "Backend idle for too long");
                true
            }
            _ => false,
        };
        if expired {
            if let Err(e) = loader.evict(&model).await {
                debug!(model = %model, error = %e, "Watchdog eviction skipped");
            }
        }
    }
}

fn exceeds(elapsed: Duration, limit: Option<Duration>) -> bool {
    limit.is_some_and(|limit| elapsed > limit)
}

#[cfg(test)]
mod tests {
    use grpc_client::testing::FakeBackend;

    use super::*;
    use crate::config::{model::ModelConfig, BackendOptions, ModelDefaults};

    async fn loader_with_model() -> (Arc<BackendLoader>, tokio::task::JoinHandle<()>) {
        let (addr, server) = FakeBackend::with_tokens(["x"]).serve().await.unwrap();
        let options = BackendOptions {
            parallel_requests: true,
            external_backends: [("fake".to_string(), addr.to_string())].into(),
            load_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let loader = Arc::new(BackendLoader::new(options, "/m", "/b"));
        let mut config = ModelConfig::for_model_file("m");
        config.backend = "fake".into();
        config.apply_defaults(&ModelDefaults::default());
        loader.get(&config).await.unwrap();
        (loader, server)
    }

    #[tokio::test]
    async fn idle_backends_are_evicted() {
        let (loader, _server) = loader_with_model().await;
        let options = WatchdogOptions {
            idle_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        sweep(&loader, &options).await;
        assert!(loader.lookup("m").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        sweep(&loader, &options).await;
        assert!(loader.lookup("m").is_none());
    }

    #[tokio::test]
    async fn busy_backends_are_evicted_after_busy_timeout() {
        let (loader, _server) = loader_with_model().await;
        let options = WatchdogOptions {
            idle_timeout: Some(Duration::from_millis(20)),
            busy_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let instance = loader.lookup("m").unwrap();
        let guard = instance.acquire().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        sweep(&loader, &options).await;
        assert!(loader.lookup("m").is_some(), "busy backend is not idle");

        let strict = WatchdogOptions {
            busy_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        sweep(&loader, &strict).await;
        assert!(loader.lookup("m").is_none());
        drop(guard);
    }

    #[test]
    fn disabled_without_timeouts() {
        assert!(!WatchdogOptions::default().enabled());
    }
}

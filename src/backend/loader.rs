//! Backend registry: loads, caches and evicts one backend per model.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use grpc_client::{BackendClient, ClientError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    instance::BackendInstance,
    kinds::{self, ResolvedKind},
    process::BackendProcess,
};
use crate::{
    config::{model::ModelConfig, BackendOptions, GatewayConfig},
    error::{BackendError, ConfigError, GatewayError, GatewayResult},
    inference::options::model_options,
};

/// Snapshot of a loaded backend for listings and the monitor endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadedBackend {
    pub model: String,
    pub backend: String,
    pub address: String,
    pub pid: Option<u32>,
    pub busy: bool,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct BackendLoader {
    options: BackendOptions,
    models_path: PathBuf,
    backends_path: PathBuf,
    instances: Mutex<HashMap<String, Arc<BackendInstance>>>,
    load_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Held across evict-load-insert while a capacity limit is configured
    capacity_lock: tokio::sync::Mutex<()>,
    loads: AtomicUsize,
    spawns: AtomicUsize,
}

impl BackendLoader {
    pub fn new(options: BackendOptions, models_path: impl Into<PathBuf>, backends_path: impl Into<PathBuf>) -> Self {
        Self {
            options,
            models_path: models_path.into(),
            backends_path: backends_path.into(),
            instances: Mutex::new(HashMap::new()),
            load_locks: DashMap::new(),
            capacity_lock: tokio::sync::Mutex::new(()),
            loads: AtomicUsize::new(0),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn from_gateway_config(config: &GatewayConfig) -> Self {
        Self::new(config.backend.clone(), &config.models_path, &config.backends_path)
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Number of completed backend loads since startup.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of backend processes spawned since startup.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn lookup(&self, model: &str) -> Option<Arc<BackendInstance>> {
        self.instances.lock().get(model).cloned()
    }

    /// Return the backend serving `config`, loading it on first use.
    ///
    /// Loads for one model are serialised. Different models load in
    /// parallel unless a capacity limit is set, in which case every load
    /// that may evict is serialised so the limit holds globally.
    pub async fn get(&self, config: &ModelConfig) -> GatewayResult<Arc<BackendInstance>> {
        let key = config.name.as_str();
        if let Some(instance) = self.live_instance(key).await {
            return Ok(instance);
        }

        let lock = self
            .load_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _load_guard = lock.lock().await;

        if let Some(instance) = self.live_instance(key).await {
            debug!(model = key, "Backend loaded by a concurrent request");
            return Ok(instance);
        }

        let _capacity_guard = match self.options.capacity() {
            Some(_) => Some(self.capacity_lock.lock().await),
            None => None,
        };
        self.make_room(key).await;

        let instance = if config.backend.is_empty() {
            self.greedy_load(config).await?
        } else {
            self.backend_load(&config.backend, config).await?
        };
        self.instances
            .lock()
            .insert(key.to_string(), instance.clone());
        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(
            model = key,
            backend = instance.backend(),
            address = instance.address(),
            "Model loaded"
        );
        Ok(instance)
    }

    async fn live_instance(&self, key: &str) -> Option<Arc<BackendInstance>> {
        let instance = self.lookup(key)?;
        if instance.is_alive() {
            instance.touch();
            return Some(instance);
        }
        warn!(model = key, backend = instance.backend(), "Backend process exited, reloading");
        self.remove(key, &instance);
        instance.stop().await;
        None
    }

    fn remove(&self, key: &str, expected: &Arc<BackendInstance>) -> bool {
        let mut instances = self.instances.lock();
        match instances.get(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                instances.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Evict backends until a new one fits under the configured capacity.
    async fn make_room(&self, loading: &str) {
        let Some(capacity) = self.options.capacity() else {
            return;
        };
        loop {
            let candidates: Vec<(String, Arc<BackendInstance>)> = {
                let instances = self.instances.lock();
                if instances.len() < capacity {
                    return;
                }
                instances
                    .iter()
                    .filter(|(k, _)| k.as_str() != loading)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            };
            if candidates.is_empty() {
                return;
            }

            let idle_lru = candidates
                .iter()
                .filter(|(_, i)| !i.is_busy())
                .min_by_key(|(_, i)| i.last_used());
            let victim = match idle_lru {
                Some(v) => v.clone(),
                None if self.options.single_active => {
                    // single mode evicts even busy backends once they finish
                    match candidates.iter().min_by_key(|(_, i)| i.last_used()) {
                        Some(v) => v.clone(),
                        None => return,
                    }
                }
                None => {
                    warn!(
                        loading,
                        capacity,
                        "All loaded backends are busy, loading over capacity"
                    );
                    return;
                }
            };

            let (key, instance) = victim;
            if instance.is_busy() {
                debug!(model = %key, "Waiting for busy backend before eviction");
                instance.wait_until_idle().await;
            }
            info!(model = %key, loading, "Evicting least recently used backend");
            if self.remove(&key, &instance) {
                instance.stop().await;
            }
        }
    }

    /// Try every known backend kind in probe order until one loads.
    pub async fn greedy_load(&self, config: &ModelConfig) -> GatewayResult<Arc<BackendInstance>> {
        let mut available = self.installed_backends();
        let mut external: Vec<String> = self.options.external_backends.keys().cloned().collect();
        external.sort();
        available.extend(external);
        let candidates = kinds::probe_order(&self.options.probe_order, &available);
        info!(model = %config.name, candidates = ?candidates, "Probing backends");

        let mut failures = Vec::new();
        for kind in &candidates {
            match self.backend_load(kind, config).await {
                Ok(instance) => {
                    info!(model = %config.name, backend = %kind, "Backend loaded model");
                    return Ok(instance);
                }
                Err(e) => {
                    info!(model = %config.name, backend = %kind, error = %e, "Backend failed to load model");
                    failures.push(format!("[{kind}]: {e}"));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no backends available".to_string());
        }
        Err(BackendError::LoadFailed {
            model: config.name.clone(),
            reasons: failures.join("; "),
        }
        .into())
    }

    /// Load `config` with exactly one backend kind.
    pub async fn backend_load(&self, kind: &str, config: &ModelConfig) -> GatewayResult<Arc<BackendInstance>> {
        let ResolvedKind { kind, model_type } = kinds::resolve(kind);
        let mut load_options = model_options(config, &self.models_path);
        if let Some(model_type) = model_type {
            load_options.r#type = model_type.to_string();
        }

        let external = self
            .options
            .external_backends
            .get(&kind)
            .or_else(|| self.options.external_backends.get(&config.backend));
        let (address, process) = match external {
            Some(uri) if Path::new(uri).is_file() => self.spawn(Path::new(uri), &kind, config)?,
            Some(uri) => {
                debug!(backend = %kind, %uri, "Connecting to external backend");
                (uri.clone(), None)
            }
            None => {
                let executable = self.executable_for(&kind)?;
                self.spawn(&executable, &kind, config)?
            }
        };

        let client = match BackendClient::connect_lazy(&address) {
            Ok(client) => client,
            Err(e) => {
                if let Some(process) = &process {
                    process.stop().await;
                }
                return Err(e.into());
            }
        };

        if !self.wait_healthy(&client, config, &kind).await {
            if let Some(process) = &process {
                process.stop().await;
            }
            return Err(BackendError::NotReady {
                backend: kind,
                model: config.name.clone(),
            }
            .into());
        }

        debug!(model = %config.name, backend = %kind, "Sending LoadModel");
        if let Err(e) = client.load_model(load_options).await {
            if let Some(process) = &process {
                process.stop().await;
            }
            return Err(match e {
                ClientError::Failed(reason) => BackendError::LoadFailed {
                    model: config.name.clone(),
                    reasons: reason,
                }
                .into(),
                other => GatewayError::from(other),
            });
        }

        Ok(Arc::new(BackendInstance::new(
            &config.name,
            kind,
            client,
            process,
            self.options.parallel_requests,
        )))
    }

    fn spawn(
        &self,
        executable: &Path,
        kind: &str,
        config: &ModelConfig,
    ) -> GatewayResult<(String, Option<BackendProcess>)> {
        let port = portpicker::pick_unused_port().ok_or_else(|| BackendError::SpawnFailed {
            backend: kind.to_string(),
            reason: "no free port available".to_string(),
        })?;
        let address = format!("127.0.0.1:{port}");
        let process = BackendProcess::spawn(executable, &address, &config.name, kind, &self.models_path)
            .map_err(|e| BackendError::SpawnFailed {
                backend: kind.to_string(),
                reason: format!("{e:#}"),
            })?;
        self.spawns.fetch_add(1, Ordering::Relaxed);
        Ok((address, Some(process)))
    }

    async fn wait_healthy(&self, client: &BackendClient, config: &ModelConfig, kind: &str) -> bool {
        let attempts = if config.grpc.attempts > 0 {
            config.grpc.attempts
        } else {
            self.options.load_attempts
        };
        let delay = if config.grpc.attempts_sleep_time > 0 {
            std::time::Duration::from_secs(config.grpc.attempts_sleep_time)
        } else {
            self.options.load_delay
        };
        for attempt in 1..=attempts {
            match client.health(self.options.health_timeout).await {
                Ok(true) => {
                    debug!(backend = kind, attempt, "Backend is healthy");
                    return true;
                }
                Ok(false) => debug!(backend = kind, attempt, "Backend not ready yet"),
                Err(e) if attempt == attempts => {
                    warn!(backend = kind, error = %e, "Backend never became healthy")
                }
                Err(e) => debug!(backend = kind, attempt, error = %e, "Health check failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    /// Executable for `kind` under the backends directory.
    pub fn executable_for(&self, kind: &str) -> GatewayResult<PathBuf> {
        let path = llm_templates::verify_path(kind, &self.backends_path)
            .map_err(|_| ConfigError::PathTraversal(kind.to_string()))?;
        if !path.is_file() {
            return Err(BackendError::SpawnFailed {
                backend: kind.to_string(),
                reason: format!("backend not found: {}", path.display()),
            }
            .into());
        }
        Ok(path)
    }

    /// Backend kinds with an executable in the backends directory.
    pub fn installed_backends(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.backends_path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.') && !n.ends_with(".log"))
            .collect();
        names.sort();
        names
    }

    /// Stop and forget the backend serving `model`.
    pub async fn evict(&self, model: &str) -> GatewayResult<()> {
        let instance = self
            .instances
            .lock()
            .remove(model)
            .ok_or_else(|| BackendError::NotFound(format!("model {model} is not loaded")))?;
        info!(model, backend = instance.backend(), "Evicting backend");
        instance.stop().await;
        Ok(())
    }

    pub fn pid(&self, model: &str) -> Option<u32> {
        self.lookup(model).and_then(|i| i.pid())
    }

    pub fn loaded(&self) -> Vec<Arc<BackendInstance>> {
        let mut loaded: Vec<_> = self.instances.lock().values().cloned().collect();
        loaded.sort_by(|a, b| a.model().cmp(b.model()));
        loaded
    }

    pub fn list_loaded(&self) -> Vec<LoadedBackend> {
        self.loaded()
            .into_iter()
            .map(|i| LoadedBackend {
                model: i.model().to_string(),
                backend: i.backend().to_string(),
                address: i.address().to_string(),
                pid: i.pid(),
                busy: i.is_busy(),
                in_flight: i.in_flight(),
            })
            .collect()
    }

    pub async fn shutdown_all(&self) {
        let instances: Vec<_> = self.instances.lock().drain().collect();
        for (model, instance) in instances {
            debug!(model = %model, "Stopping backend");
            instance.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use grpc_client::testing::FakeBackend;

    use super::*;
    use crate::config::model::ModelDefaults;

    fn model(name: &str, backend: &str) -> ModelConfig {
        let mut config = ModelConfig::for_model_file(name);
        config.backend = backend.to_string();
        config.apply_defaults(&ModelDefaults::default());
        config
    }

    fn options(externals: &[(&str, String)]) -> BackendOptions {
        BackendOptions {
            load_attempts: 3,
            load_delay: Duration::from_millis(10),
            health_timeout: Duration::from_secs(1),
            external_backends: externals
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn concurrent_gets_load_once() {
        let fake = FakeBackend::with_tokens(["ok"]);
        let load_count = fake.load_count.clone();
        let (addr, _server) = fake.serve().await.unwrap();
        let loader = Arc::new(BackendLoader::new(
            options(&[("fake", addr.to_string())]),
            "/models",
            "/backends",
        ));
        let config = Arc::new(model("m", "fake"));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                let config = config.clone();
                tokio::spawn(async move { loader.get(&config).await.map(|i| i.address().to_string()) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), addr.to_string());
        }
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
        assert_eq!(loader.load_count(), 1);
        assert_eq!(loader.spawn_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_backend_is_not_ready() {
        let port = portpicker::pick_unused_port().unwrap();
        let loader = BackendLoader::new(options(&[("dead", format!("127.0.0.1:{port}"))]), "/m", "/b");
        let err = loader.get(&model("m", "dead")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(BackendError::NotReady { .. })));
        assert!(loader.lookup("m").is_none());
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let loader = BackendLoader::new(options(&[]), dir.path(), dir.path());
        let err = loader.get(&model("m", "llama")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(BackendError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn greedy_load_collects_failures_then_succeeds() {
        let (addr, _server) = FakeBackend::with_tokens(["ok"]).serve().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let loader = BackendLoader::new(options(&[("zz-fake", addr.to_string())]), dir.path(), dir.path());
        let instance = loader.get(&model("m", "")).await.unwrap();
        assert_eq!(instance.backend(), "zz-fake");

        let failing = BackendLoader::new(options(&[]), dir.path(), dir.path());
        let err = failing.greedy_load(&model("m", "")).await.unwrap_err();
        match err {
            GatewayError::Backend(BackendError::LoadFailed { reasons, .. }) => {
                assert!(reasons.contains("[llama-cpp]"), "{reasons}")
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn load_failure_is_reported() {
        let mut fake = FakeBackend::with_tokens(["ok"]);
        fake.load_error = Some("model file missing".to_string());
        let (addr, _server) = fake.serve().await.unwrap();
        let loader = BackendLoader::new(options(&[("fake", addr.to_string())]), "/m", "/b");
        let err = loader.get(&model("m", "fake")).await.unwrap_err();
        assert!(err.to_string().contains("model file missing"));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let (a, _sa) = FakeBackend::with_tokens(["a"]).serve().await.unwrap();
        let (b, _sb) = FakeBackend::with_tokens(["b"]).serve().await.unwrap();
        let mut opts = options(&[("fa", a.to_string()), ("fb", b.to_string())]);
        opts.max_active = Some(1);
        let loader = BackendLoader::new(opts, "/m", "/b");

        loader.get(&model("one", "fa")).await.unwrap();
        loader.get(&model("two", "fb")).await.unwrap();
        let loaded: Vec<_> = loader.list_loaded().into_iter().map(|l| l.model).collect();
        assert_eq!(loaded, vec!["two"]);
    }

    #[tokio::test]
    async fn single_mode_waits_for_busy_backend() {
        let (a, _sa) = FakeBackend::with_tokens(["a"]).serve().await.unwrap();
        let (b, _sb) = FakeBackend::with_tokens(["b"]).serve().await.unwrap();
        let mut opts = options(&[("fa", a.to_string()), ("fb", b.to_string())]);
        opts.single_active = true;
        opts.parallel_requests = true;
        let loader = Arc::new(BackendLoader::new(opts, "/m", "/b"));

        let first = loader.get(&model("one", "fa")).await.unwrap();
        let guard = first.acquire().await;
        let pending = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.get(&model("two", "fb")).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        drop(guard);
        pending.await.unwrap().unwrap();
        assert!(loader.lookup("one").is_none());
        assert!(loader.lookup("two").is_some());
    }

    fn slow_fake(token: &str) -> FakeBackend {
        let mut fake = FakeBackend::with_tokens([token]);
        fake.load_delay = Duration::from_millis(200);
        fake
    }

    async fn load_both(loader: &Arc<BackendLoader>) {
        let tasks: Vec<_> = [("one", "fa"), ("two", "fb")]
            .into_iter()
            .map(|(name, kind)| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.get(&model(name, kind)).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn single_mode_holds_under_concurrent_loads() {
        let (a, _sa) = slow_fake("a").serve().await.unwrap();
        let (b, _sb) = slow_fake("b").serve().await.unwrap();
        let mut opts = options(&[("fa", a.to_string()), ("fb", b.to_string())]);
        opts.single_active = true;
        let loader = Arc::new(BackendLoader::new(opts, "/m", "/b"));

        load_both(&loader).await;
        assert_eq!(loader.list_loaded().len(), 1);
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn distinct_models_load_in_parallel_without_capacity() {
        let (a, _sa) = slow_fake("a").serve().await.unwrap();
        let (b, _sb) = slow_fake("b").serve().await.unwrap();
        let loader = Arc::new(BackendLoader::new(
            options(&[("fa", a.to_string()), ("fb", b.to_string())]),
            "/m",
            "/b",
        ));

        let started = std::time::Instant::now();
        load_both(&loader).await;
        assert!(started.elapsed() < Duration::from_millis(380), "{:?}", started.elapsed());
        assert_eq!(loader.list_loaded().len(), 2);
    }

    #[tokio::test]
    async fn evict_unknown_model_is_not_found() {
        let loader = BackendLoader::new(options(&[]), "/m", "/b");
        let err = loader.evict("nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(BackendError::NotFound(_))));
    }
}

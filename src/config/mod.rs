//! Gateway configuration: command line, per-model YAML and their resolution.

pub mod cli;
pub mod loader;
pub mod model;

use std::{collections::HashMap, path::PathBuf, time::Duration};

pub use cli::Cli;
pub use loader::ModelConfigLoader;
pub use model::{ModelConfig, ModelDefaults};

pub const DEFAULT_PROBE_ORDER: &[&str] = &["llama-cpp"];

/// Capacity and startup knobs for backend processes.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Keep at most one backend alive
    pub single_active: bool,
    /// LRU bound on live backends; `None` is unbounded
    pub max_active: Option<usize>,
    /// Let a backend serve several requests at once
    pub parallel_requests: bool,
    /// Backend kinds tried in order when a model names none
    pub probe_order: Vec<String>,
    pub load_attempts: u32,
    pub load_delay: Duration,
    pub health_timeout: Duration,
    /// Backend name to executable path or `host:port`
    pub external_backends: HashMap<String, String>,
}

impl BackendOptions {
    /// Effective live-backend limit; single mode is a limit of one.
    pub fn capacity(&self) -> Option<usize> {
        if self.single_active {
            Some(1)
        } else {
            self.max_active.filter(|n| *n > 0)
        }
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            single_active: false,
            max_active: None,
            parallel_requests: false,
            probe_order: DEFAULT_PROBE_ORDER.iter().map(|s| s.to_string()).collect(),
            load_attempts: 20,
            load_delay: Duration::from_millis(2000),
            health_timeout: Duration::from_secs(5),
            external_backends: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub idle_timeout: Option<Duration>,
    pub busy_timeout: Option<Duration>,
    pub interval: Duration,
}

impl WatchdogOptions {
    pub fn enabled(&self) -> bool {
        self.idle_timeout.is_some() || self.busy_timeout.is_some()
    }
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            busy_timeout: None,
            interval: Duration::from_secs(2),
        }
    }
}

/// Everything the running gateway needs, resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub models_path: PathBuf,
    pub backends_path: PathBuf,
    pub templates_path: PathBuf,
    pub generated_content_path: PathBuf,
    pub config_file: Option<PathBuf>,
    pub threads: Option<u32>,
    pub context_size: i32,
    pub f16: bool,
    pub debug: bool,
    pub upload_limit_bytes: usize,
    pub api_keys: Vec<String>,
    pub galleries: Vec<String>,
    pub backend: BackendOptions,
    pub watchdog: WatchdogOptions,
    /// Zero keeps stored responses forever
    pub responses_store_ttl: Duration,
    pub trim_trailing_zero_embeddings: bool,
    /// Lifetime of a Responses WebSocket connection
    pub websocket_connection_limit: Duration,
}

impl GatewayConfig {
    pub fn model_defaults(&self) -> ModelDefaults {
        ModelDefaults {
            threads: self.threads,
            context_size: self.context_size,
            f16: self.f16,
            debug: self.debug,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            models_path: PathBuf::from("models"),
            backends_path: PathBuf::from("backends"),
            templates_path: PathBuf::from("models"),
            generated_content_path: PathBuf::from("generated"),
            config_file: None,
            threads: None,
            context_size: 512,
            f16: false,
            debug: false,
            upload_limit_bytes: 15 * 1024 * 1024,
            api_keys: Vec::new(),
            galleries: Vec::new(),
            backend: BackendOptions::default(),
            watchdog: WatchdogOptions::default(),
            responses_store_ttl: Duration::ZERO,
            trim_trailing_zero_embeddings: false,
            websocket_connection_limit: Duration::from_secs(60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_active_caps_capacity_at_one() {
        let mut options = BackendOptions {
            max_active: Some(3),
            ..Default::default()
        };
        assert_eq!(options.capacity(), Some(3));
        options.single_active = true;
        assert_eq!(options.capacity(), Some(1));
        options.single_active = false;
        options.max_active = Some(0);
        assert_eq!(options.capacity(), None);
    }
}

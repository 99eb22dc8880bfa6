use std::{collections::HashMap, path::PathBuf, time::Duration};

use clap::Parser;

use super::{BackendOptions, GatewayConfig, WatchdogOptions};
use crate::{error::ConfigError, logging::LoggingConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "llm-gateway", author, version, about, long_about = None)]
pub struct Cli {
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding model files and model YAML
    #[arg(long, env = "GATEWAY_MODELS_PATH", default_value = "models")]
    pub models_path: PathBuf,

    /// Directory holding backend executables, one per backend kind
    #[arg(long, env = "GATEWAY_BACKENDS_PATH", default_value = "backends")]
    pub backends_path: PathBuf,

    /// YAML file with a list of model configs
    #[arg(long, env = "GATEWAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Prompt templates directory; defaults to the models path
    #[arg(long, env = "GATEWAY_TEMPLATES_PATH")]
    pub templates_path: Option<PathBuf>,

    /// Where generated images, audio and video are written
    #[arg(long, env = "GATEWAY_GENERATED_CONTENT_PATH", default_value = "generated")]
    pub generated_content_path: PathBuf,

    #[arg(long, env = "GATEWAY_THREADS")]
    pub threads: Option<u32>,

    #[arg(long, env = "GATEWAY_CONTEXT_SIZE", default_value_t = 512)]
    pub context_size: i32,

    #[arg(long, env = "GATEWAY_F16")]
    pub f16: bool,

    #[arg(long, env = "GATEWAY_UPLOAD_LIMIT_MB", default_value_t = 15)]
    pub upload_limit_mb: usize,

    /// Comma separated API keys; empty disables authentication
    #[arg(long, env = "GATEWAY_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    #[arg(long, env = "GATEWAY_GALLERIES", value_delimiter = ',')]
    pub galleries: Vec<String>,

    #[arg(long, env = "GATEWAY_DEBUG")]
    pub debug: bool,

    #[arg(long, env = "GATEWAY_SINGLE_ACTIVE_BACKEND")]
    pub single_active_backend: bool,

    #[arg(long, env = "GATEWAY_MAX_ACTIVE_BACKENDS")]
    pub max_active_backends: Option<usize>,

    #[arg(long, env = "GATEWAY_PARALLEL_REQUESTS")]
    pub parallel_requests: bool,

    #[arg(long, env = "GATEWAY_WATCHDOG_IDLE_TIMEOUT", value_parser = parse_duration)]
    pub watchdog_idle_timeout: Option<Duration>,

    #[arg(long, env = "GATEWAY_WATCHDOG_BUSY_TIMEOUT", value_parser = parse_duration)]
    pub watchdog_busy_timeout: Option<Duration>,

    #[arg(long, env = "GATEWAY_WATCHDOG_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub watchdog_interval: Duration,

    /// `name=path-or-host:port`, repeatable
    #[arg(long = "external-backend", env = "GATEWAY_EXTERNAL_BACKENDS", value_delimiter = ',')]
    pub external_backends: Vec<String>,

    #[arg(long, env = "GATEWAY_BACKEND_PROBE_ORDER", value_delimiter = ',', default_value = "llama-cpp")]
    pub backend_probe_order: Vec<String>,

    #[arg(long, env = "GATEWAY_BACKEND_LOAD_ATTEMPTS", default_value_t = 20)]
    pub backend_load_attempts: u32,

    #[arg(long, env = "GATEWAY_BACKEND_LOAD_DELAY_MS", default_value_t = 2000)]
    pub backend_load_delay_ms: u64,

    #[arg(long, env = "GATEWAY_HEALTH_TIMEOUT_SECS", default_value_t = 5)]
    pub health_timeout_secs: u64,

    /// How long stored responses live; 0 keeps them forever
    #[arg(long, env = "GATEWAY_RESPONSES_STORE_TTL", default_value = "0", value_parser = parse_duration)]
    pub responses_store_ttl: Duration,

    #[arg(long, env = "GATEWAY_TRIM_TRAILING_ZERO_EMBEDDINGS")]
    pub trim_trailing_zero_embeddings: bool,

    #[arg(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "GATEWAY_LOG_JSON")]
    pub log_json: bool,

    #[arg(long, env = "GATEWAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Result<(GatewayConfig, LoggingConfig), ConfigError> {
        if self.single_active_backend && self.max_active_backends == Some(0) {
            return Err(ConfigError::Invalid(
                "--max-active-backends 0 conflicts with --single-active-backend".to_string(),
            ));
        }
        let external_backends = parse_external_backends(&self.external_backends)?;

        let logging = LoggingConfig {
            level: self.log_level,
            json: self.log_json,
            dir: self.log_dir,
        };
        let templates_path = self
            .templates_path
            .unwrap_or_else(|| self.models_path.clone());

        let config = GatewayConfig {
            host: self.host,
            port: self.port,
            models_path: self.models_path,
            backends_path: self.backends_path,
            templates_path,
            generated_content_path: self.generated_content_path,
            config_file: self.config_file,
            threads: self.threads,
            context_size: self.context_size,
            f16: self.f16,
            debug: self.debug,
            upload_limit_bytes: self.upload_limit_mb.saturating_mul(1024 * 1024),
            api_keys: non_empty(self.api_keys),
            galleries: non_empty(self.galleries),
            backend: BackendOptions {
                single_active: self.single_active_backend,
                max_active: self.max_active_backends,
                parallel_requests: self.parallel_requests,
                probe_order: non_empty(self.backend_probe_order),
                load_attempts: self.backend_load_attempts.max(1),
                load_delay: Duration::from_millis(self.backend_load_delay_ms),
                health_timeout: Duration::from_secs(self.health_timeout_secs.max(1)),
                external_backends,
            },
            watchdog: WatchdogOptions {
                idle_timeout: self.watchdog_idle_timeout.filter(|d| !d.is_zero()),
                busy_timeout: self.watchdog_busy_timeout.filter(|d| !d.is_zero()),
                interval: self.watchdog_interval.max(Duration::from_millis(100)),
            },
            responses_store_ttl: self.responses_store_ttl,
            trim_trailing_zero_embeddings: self.trim_trailing_zero_embeddings,
            ..GatewayConfig::default()
        };
        Ok((config, logging))
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Parse `30s`, `5m`, `1h`, `250ms` or a plain number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
    };
    Ok(duration)
}

fn parse_external_backends(entries: &[String]) -> Result<HashMap<String, String>, ConfigError> {
    let mut backends = HashMap::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let (name, uri) = entry
            .split_once('=')
            .or_else(|| entry.split_once(':').filter(|(_, rest)| rest.contains(':')))
            .ok_or_else(|| {
                ConfigError::Invalid(format!("external backend must be name=uri, got {entry:?}"))
            })?;
        let (name, uri) = (name.trim(), uri.trim());
        if name.is_empty() || uri.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "external backend must be name=uri, got {entry:?}"
            )));
        }
        backends.insert(name.to_string(), uri.to_string());
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["llm-gateway"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    #[serial]
    fn defaults() {
        let (config, logging) = parse(&[]).into_config().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.templates_path, config.models_path);
        assert_eq!(config.backend.probe_order, vec!["llama-cpp"]);
        assert_eq!(config.responses_store_ttl, Duration::ZERO);
        assert!(!config.trim_trailing_zero_embeddings);
        assert!(config.api_keys.is_empty());
        assert_eq!(logging.level, "info");
    }

    #[test]
    fn external_backends_and_keys() {
        let (config, _) = parse(&[
            "--external-backend",
            "fake=127.0.0.1:50051",
            "--external-backend",
            "mine=/opt/backends/mine",
            "--api-keys",
            "a,b",
            "--watchdog-idle-timeout",
            "15m",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.backend.external_backends["fake"], "127.0.0.1:50051");
        assert_eq!(config.backend.external_backends["mine"], "/opt/backends/mine");
        assert_eq!(config.api_keys, vec!["a", "b"]);
        assert_eq!(config.watchdog.idle_timeout, Some(Duration::from_secs(900)));
    }

    #[test]
    fn invalid_combinations_are_config_errors() {
        let bad = parse(&["--external-backend", "nouri"]).into_config();
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));

        let bad = parse(&["--single-active-backend", "--max-active-backends", "0"]).into_config();
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn environment_fills_unset_flags() {
        std::env::set_var("GATEWAY_PORT", "9090");
        std::env::set_var("GATEWAY_TRIM_TRAILING_ZERO_EMBEDDINGS", "true");
        let from_env = parse(&[]).into_config();
        let from_flag = parse(&["--port", "7000"]).into_config();
        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("GATEWAY_TRIM_TRAILING_ZERO_EMBEDDINGS");

        let (config, _) = from_env.unwrap();
        assert_eq!(config.port, 9090);
        assert!(config.trim_trailing_zero_embeddings);
        assert_eq!(from_flag.unwrap().0.port, 7000);
    }
}

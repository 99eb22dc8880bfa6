//! Model config discovery and per-request resolution.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{model::ModelConfig, GatewayConfig, ModelDefaults};
use crate::error::ConfigError;

const YAML_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Owns every known [`ModelConfig`] and resolves request model names to one.
#[derive(Debug)]
pub struct ModelConfigLoader {
    models_path: PathBuf,
    defaults: ModelDefaults,
    configs: DashMap<String, Arc<ModelConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Declared in YAML
    Configured,
    /// Bare model file under the models path
    ModelFile,
    /// Nothing on disk; defaults with the name as model file
    Default,
}

impl ModelConfigLoader {
    pub fn new(models_path: impl Into<PathBuf>, defaults: ModelDefaults) -> Self {
        Self {
            models_path: models_path.into(),
            defaults,
            configs: DashMap::new(),
        }
    }

    /// Build a loader populated from the models directory and config file.
    pub fn from_gateway_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let loader = Self::new(&config.models_path, config.model_defaults());
        loader.load_directory()?;
        if let Some(file) = &config.config_file {
            loader.load_file(file)?;
        }
        info!(
            models = loader.configs.len(),
            path = %loader.models_path.display(),
            "Model configurations loaded"
        );
        Ok(loader)
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    /// Scan the models directory for `*.yaml` / `*.yml`.
    pub fn load_directory(&self) -> Result<(), ConfigError> {
        if !self.models_path.exists() {
            warn!(path = %self.models_path.display(), "Models path does not exist");
            return Ok(());
        }
        let entries = fs::read_dir(&self.models_path).map_err(|source| ConfigError::Io {
            path: self.models_path.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_yaml(p))
            .collect();
        paths.sort();
        for path in paths {
            for config in read_configs(&path)? {
                self.register(config)?;
            }
        }
        Ok(())
    }

    /// Load a YAML file holding a list of configs or a single one.
    pub fn load_file(&self, path: &Path) -> Result<(), ConfigError> {
        for config in read_configs(path)? {
            self.register(config)?;
        }
        Ok(())
    }

    pub fn register(&self, mut config: ModelConfig) -> Result<Arc<ModelConfig>, ConfigError> {
        if config.name.is_empty() {
            return Err(ConfigError::Invalid("model config without a name".to_string()));
        }
        config.validate()?;
        config.apply_defaults(&self.defaults);
        debug!(model = %config.name, backend = %config.backend, "Registered model config");
        let config = Arc::new(config);
        self.configs.insert(config.name.clone(), config.clone());
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelConfig>> {
        self.configs.get(name).map(|c| c.value().clone())
    }

    /// Resolve a request's model name.
    ///
    /// Known configs win; then `<models>/<name>.yaml`, which is cached;
    /// otherwise a default config naming `name` as its model file.
    pub fn resolve(&self, name: &str) -> Result<(Arc<ModelConfig>, ConfigSource), ConfigError> {
        if let Some(config) = self.get(name) {
            return Ok((config, ConfigSource::Configured));
        }
        if name.is_empty() {
            return Err(ConfigError::Invalid("model is required".to_string()));
        }
        if name.contains("..") || Path::new(name).is_absolute() {
            return Err(ConfigError::PathTraversal(name.to_string()));
        }
        for ext in YAML_EXTENSIONS {
            let candidate = self.models_path.join(format!("{name}.{ext}"));
            if candidate.is_file() {
                let mut configs = read_configs(&candidate)?;
                if let Some(mut config) = configs.pop() {
                    if config.name.is_empty() {
                        config.name = name.to_string();
                    }
                    return Ok((self.register(config)?, ConfigSource::Configured));
                }
            }
        }
        let source = if self.models_path.join(name).is_file() {
            ConfigSource::ModelFile
        } else {
            ConfigSource::Default
        };
        let mut config = ModelConfig::for_model_file(name);
        config.validate()?;
        config.apply_defaults(&self.defaults);
        Ok((Arc::new(config), source))
    }

    /// True when `name` is a configured model or a file under the models path.
    pub fn exists(&self, name: &str) -> bool {
        matches!(
            self.resolve(name),
            Ok((_, ConfigSource::Configured | ConfigSource::ModelFile))
        )
    }

    pub fn configs(&self) -> Vec<Arc<ModelConfig>> {
        let mut configs: Vec<_> = self.configs.iter().map(|c| c.value().clone()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Configured names plus loose model files not claimed by any config.
    pub fn list_models(&self) -> Vec<String> {
        let configs = self.configs();
        let mut names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        let claimed: Vec<&str> = configs.iter().map(|c| c.model_file()).collect();
        if let Ok(entries) = fs::read_dir(&self.models_path) {
            let mut loose: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|f| is_model_file(f) && !claimed.contains(&f.as_str()))
                .filter(|f| !names.contains(f))
                .collect();
            loose.sort();
            names.extend(loose);
        }
        names
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| YAML_EXTENSIONS.contains(&e))
}

fn is_model_file(name: &str) -> bool {
    const SKIPPED: &[&str] = &["yaml", "yml", "tmpl", "json", "md", "txt", "keep", "partial"];
    if name.starts_with('.') {
        return false;
    }
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => !SKIPPED.contains(&ext),
        None => true,
    }
}

fn read_configs(path: &Path) -> Result<Vec<ModelConfig>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let parse = |v: serde_yaml::Value| {
        serde_yaml::from_value::<ModelConfig>(v).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    };
    match value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Sequence(items) => items.into_iter().map(parse).collect(),
        other => Ok(vec![parse(other)?]),
    }
}

//! Per-model configuration as read from YAML.

use std::collections::HashMap;

use llm_templates::TemplateConfig;
use once_cell::sync::Lazy;
use openai_protocol::{
    common::{SamplingOverrides, StringOrArray},
    usecase::ModelUsecase,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tool_parser::FunctionsConfig;

use crate::error::ConfigError;

static BACKEND_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid backend name regex"));

/// Seed value asking the backend to pick a random seed.
pub const RANDOM_SEED: i32 = -1;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Sampling knobs, found under `parameters:` in model YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionParameters {
    /// Model file or directory, relative to the models path
    pub model: String,
    pub language: String,
    pub translate: bool,
    pub n: i32,
    pub top_p: Option<f64>,
    pub top_k: Option<i32>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i32>,
    pub echo: bool,
    pub batch: i32,
    pub ignore_eos: bool,
    pub repeat_penalty: f64,
    pub repeat_last_n: i32,
    pub n_keep: i32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub tfz: Option<f64>,
    pub typical_p: Option<f64>,
    pub seed: Option<i32>,
    pub negative_prompt: String,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub negative_prompt_scale: f32,
    pub clip_skip: i32,
    pub tokenizer: String,
    pub model_base_name: String,
    pub use_fast_tokenizer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusersConfig {
    pub cuda: bool,
    pub pipeline_type: String,
    pub scheduler_type: String,
    /// Comma separated list of parameters the pipeline accepts
    pub enable_parameters: String,
    pub img2img: bool,
    pub clip_skip: i32,
    pub clip_model: String,
    pub clip_subfolder: String,
    pub control_net: String,
}

/// Overrides for the health polling that follows a backend spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub attempts: u32,
    /// Seconds between attempts
    pub attempts_sleep_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub voice: String,
    pub audio_path: String,
}

/// Names of tool executors whose tools this model may call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Leave `<think>` blocks in the content
    pub disable: bool,
    /// Fold `thinking` role messages into the following assistant message
    pub merge_thinking_messages: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: Option<usize>,
}

/// The merged unit every request works from once resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub description: String,
    pub usage: String,
    /// Backend kind; empty means probe for one
    pub backend: String,
    pub parameters: PredictionParameters,

    pub f16: Option<bool>,
    pub threads: Option<u32>,
    pub debug: Option<bool>,
    pub context_size: Option<i32>,
    pub roles: HashMap<String, String>,
    pub embeddings: Option<bool>,
    pub reranking: Option<bool>,
    pub known_usecases: Vec<String>,

    pub template: TemplateConfig,
    pub function: FunctionsConfig,

    pub system_prompt: String,
    pub grammar: String,
    pub stopwords: Vec<String>,
    pub cutstrings: Vec<String>,
    pub extract_regex: Vec<String>,
    pub trimspace: Vec<String>,
    pub trimsuffix: Vec<String>,

    pub mirostat: Option<i32>,
    pub mirostat_eta: Option<f64>,
    pub mirostat_tau: Option<f64>,

    pub tensor_split: String,
    pub main_gpu: String,
    pub gpu_layers: Option<i32>,
    pub mmap: Option<bool>,
    pub mmlock: Option<bool>,
    pub low_vram: Option<bool>,
    pub lora_adapter: String,
    pub lora_base: String,
    pub lora_scale: f32,
    pub mmproj: String,
    pub draft_model: String,
    pub n_draft: i32,
    pub flash_attention: Option<String>,
    pub no_kv_offloading: bool,
    pub cfg_scale: f32,
    #[serde(rename = "type")]
    pub model_type: String,
    pub prompt_cache_path: String,
    pub prompt_cache_all: bool,
    pub prompt_cache_ro: bool,

    pub diffusers: DiffusersConfig,
    pub step: i32,
    pub grpc: GrpcConfig,
    pub tts: TtsConfig,
    pub cuda: bool,
    /// Free-form `key:value` options handed to the backend on load
    pub options: Vec<String>,

    pub reasoning: ReasoningConfig,
    pub mcp: McpConfig,
    pub agent: AgentConfig,
    pub trim_trailing_zero_embeddings: Option<bool>,
}

/// Process-wide values that fill in what a model config leaves unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelDefaults {
    pub threads: Option<u32>,
    pub context_size: i32,
    pub f16: bool,
    pub debug: bool,
}

impl ModelConfig {
    /// Config for a model that has no YAML: the name doubles as the file.
    pub fn for_model_file(name: &str) -> Self {
        let mut config = Self {
            name: name.to_string(),
            ..Default::default()
        };
        config.parameters.model = name.to_string();
        config
    }

    /// Model file to load; falls back to the config name.
    pub fn model_file(&self) -> &str {
        if self.parameters.model.is_empty() {
            &self.name
        } else {
            &self.parameters.model
        }
    }

    pub fn apply_defaults(&mut self, defaults: &ModelDefaults) {
        let p = &mut self.parameters;
        p.seed.get_or_insert(RANDOM_SEED);
        p.top_k.get_or_insert(40);
        p.typical_p.get_or_insert(1.0);
        p.tfz.get_or_insert(1.0);
        p.top_p.get_or_insert(0.95);
        p.temperature.get_or_insert(0.9);
        p.max_tokens.get_or_insert(0);

        self.mmap.get_or_insert(true);
        self.mmlock.get_or_insert(false);
        self.mirostat.get_or_insert(0);
        self.mirostat_eta.get_or_insert(0.1);
        self.mirostat_tau.get_or_insert(5.0);
        self.low_vram.get_or_insert(false);
        self.embeddings.get_or_insert(false);
        self.reranking.get_or_insert(false);

        // configured value, then the command line, then 4
        let threads = self
            .threads
            .filter(|t| *t > 0)
            .or(defaults.threads.filter(|t| *t > 0))
            .unwrap_or(4);
        self.threads = Some(threads);

        if self.context_size.is_none() && defaults.context_size > 0 {
            self.context_size = Some(defaults.context_size);
        }
        self.f16.get_or_insert(defaults.f16);
        if defaults.debug {
            self.debug = Some(true);
        }
        self.debug.get_or_insert(false);
    }

    /// Reject paths that leave the models directory and malformed regexes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for target in [self.backend.as_str(), self.parameters.model.as_str(), self.mmproj.as_str()] {
            if target.starts_with('/') || target.starts_with('\\') || target.contains("..") {
                return Err(ConfigError::PathTraversal(target.to_string()));
            }
        }
        if !self.backend.is_empty() && !BACKEND_NAME.is_match(&self.backend) {
            return Err(ConfigError::Invalid(format!(
                "invalid backend name: {}",
                self.backend
            )));
        }
        for pattern in self.cutstrings.iter().chain(&self.extract_regex) {
            Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("model {}: bad regex {pattern:?}: {e}", self.name))
            })?;
        }
        self.function
            .validate_regexes()
            .map_err(|e| ConfigError::Invalid(format!("model {}: {e}", self.name)))
    }

    pub fn usecases(&self) -> ModelUsecase {
        let declared = self
            .known_usecases
            .iter()
            .filter_map(|name| ModelUsecase::from_config_name(name))
            .fold(ModelUsecase::empty(), |acc, flag| acc | flag);
        if !declared.is_empty() {
            return declared;
        }
        ModelUsecase::guess_for_backend(&self.backend)
    }

    pub fn max_iterations(&self) -> usize {
        self.agent
            .max_iterations
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    pub fn trims_trailing_zero_embeddings(&self, default: bool) -> bool {
        self.trim_trailing_zero_embeddings.unwrap_or(default)
    }

    /// Apply request-level sampling fields. Only fields the request sets
    /// are touched.
    pub fn overlay(&mut self, overrides: &SamplingOverrides) {
        let p = &mut self.parameters;
        if let Some(v) = overrides.temperature {
            p.temperature = Some(v);
        }
        if let Some(v) = overrides.top_p {
            p.top_p = Some(v);
        }
        if let Some(v) = overrides.top_k {
            p.top_k = Some(v);
        }
        if let Some(v) = overrides.max_tokens {
            p.max_tokens = Some(v);
        }
        if let Some(v) = overrides.seed {
            p.seed = Some(v);
        }
        if let Some(v) = overrides.typical_p {
            p.typical_p = Some(v);
        }
        if let Some(v) = overrides.tfz {
            p.tfz = Some(v);
        }
        if let Some(v) = overrides.repeat_penalty.filter(|v| *v != 0.0) {
            p.repeat_penalty = v;
        }
        if let Some(v) = overrides.repeat_last_n.filter(|v| *v != 0) {
            p.repeat_last_n = v;
        }
        if let Some(v) = overrides.frequency_penalty.filter(|v| *v != 0.0) {
            p.frequency_penalty = v;
        }
        if let Some(v) = overrides.presence_penalty.filter(|v| *v != 0.0) {
            p.presence_penalty = v;
        }
        if let Some(v) = overrides.n_keep.filter(|v| *v != 0) {
            p.n_keep = v;
        }
        if overrides.ignore_eos == Some(true) {
            p.ignore_eos = true;
        }
        if let Some(v) = overrides.rope_freq_base.filter(|v| *v != 0.0) {
            p.rope_freq_base = v;
        }
        if let Some(v) = overrides.rope_freq_scale.filter(|v| *v != 0.0) {
            p.rope_freq_scale = v;
        }
        if let Some(v) = overrides.negative_prompt_scale.filter(|v| *v != 0.0) {
            p.negative_prompt_scale = v;
        }
        if let Some(v) = overrides.negative_prompt.as_ref().filter(|v| !v.is_empty()) {
            p.negative_prompt = v.clone();
        }
        if let Some(v) = overrides.model_base_name.as_ref().filter(|v| !v.is_empty()) {
            p.model_base_name = v.clone();
        }
        if let Some(v) = overrides.use_fast_tokenizer {
            p.use_fast_tokenizer = v;
        }
        if let Some(v) = overrides.clip_skip.filter(|v| *v != 0) {
            self.diffusers.clip_skip = v;
        }
        if let Some(v) = overrides.mirostat {
            self.mirostat = Some(v);
        }
        if let Some(v) = overrides.mirostat_eta {
            self.mirostat_eta = Some(v);
        }
        if let Some(v) = overrides.mirostat_tau {
            self.mirostat_tau = Some(v);
        }
        if let Some(v) = overrides.grammar.as_ref().filter(|v| !v.is_empty()) {
            self.grammar = v.clone();
        }
        if let Some(v) = overrides.backend.as_ref().filter(|v| !v.is_empty()) {
            self.backend = v.clone();
        }
    }

    /// Add request stop words, keeping first-seen order without duplicates.
    pub fn add_stop_words(&mut self, stop: Option<&StringOrArray>) {
        for word in stop.map(StringOrArray::to_vec).unwrap_or_default() {
            if !word.is_empty() && !self.stopwords.contains(&word) {
                self.stopwords.push(word);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: gpt-4
backend: llama-cpp
unknown_key: ignored
context_size: 4096
parameters:
  model: qwen.gguf
  temperature: 0.2
template:
  chat: chatml
  use_tokenizer_template: false
function:
  grammar:
    parallel_calls: true
stopwords:
  - "<|im_end|>"
trim_trailing_zero_embeddings: true
"#;

    #[test]
    fn parses_yaml_and_ignores_unknown_keys() {
        let config: ModelConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.name, "gpt-4");
        assert_eq!(config.model_file(), "qwen.gguf");
        assert_eq!(config.parameters.temperature, Some(0.2));
        assert_eq!(config.template.chat, "chatml");
        assert!(config.function.grammar.parallel_calls);
        assert_eq!(config.context_size, Some(4096));
        assert!(config.trims_trailing_zero_embeddings(false));
        config.validate().unwrap();
    }

    #[test]
    fn defaults_fill_unset_values() {
        let mut config = ModelConfig::for_model_file("m.gguf");
        config.apply_defaults(&ModelDefaults {
            threads: None,
            context_size: 512,
            f16: true,
            debug: false,
        });
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.parameters.top_k, Some(40));
        assert_eq!(config.parameters.seed, Some(RANDOM_SEED));
        assert_eq!(config.context_size, Some(512));
        assert_eq!(config.f16, Some(true));
        assert_eq!(config.mmap, Some(true));
    }

    #[test]
    fn configured_threads_win_over_command_line() {
        let mut config = ModelConfig {
            threads: Some(2),
            ..Default::default()
        };
        config.apply_defaults(&ModelDefaults {
            threads: Some(8),
            ..Default::default()
        });
        assert_eq!(config.threads, Some(2));

        let mut zero = ModelConfig {
            threads: Some(0),
            ..Default::default()
        };
        zero.apply_defaults(&ModelDefaults {
            threads: Some(8),
            ..Default::default()
        });
        assert_eq!(zero.threads, Some(8));
    }

    #[test]
    fn rejects_traversal_and_bad_backend() {
        let mut config = ModelConfig::for_model_file("../etc/passwd");
        assert!(matches!(config.validate(), Err(ConfigError::PathTraversal(_))));
        config.parameters.model = "ok.gguf".into();
        config.backend = "llama cpp".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn overlay_and_stop_words() {
        let mut config = ModelConfig {
            stopwords: vec!["</s>".into()],
            ..Default::default()
        };
        config.apply_defaults(&ModelDefaults::default());
        let overrides = SamplingOverrides {
            temperature: Some(0.1),
            grammar: Some("root ::= \"x\"".into()),
            ..Default::default()
        };
        config.overlay(&overrides);
        config.add_stop_words(Some(&StringOrArray::Array(vec!["</s>".into(), "END".into()])));
        assert_eq!(config.parameters.temperature, Some(0.1));
        assert_eq!(config.parameters.top_k, Some(40));
        assert_eq!(config.grammar, "root ::= \"x\"");
        assert_eq!(config.stopwords, vec!["</s>", "END"]);
    }

    #[test]
    fn usecases_from_names_or_backend() {
        let config = ModelConfig {
            known_usecases: vec!["FLAG_CHAT".into(), "embeddings".into()],
            ..Default::default()
        };
        assert!(config.usecases().contains(ModelUsecase::CHAT | ModelUsecase::EMBEDDINGS));
        let whisper = ModelConfig {
            backend: "whisper".into(),
            ..Default::default()
        };
        assert_eq!(whisper.usecases(), ModelUsecase::TRANSCRIPT);
    }
}

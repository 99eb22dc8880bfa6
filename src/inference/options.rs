//! Translation from [`ModelConfig`] to backend request messages.

use std::path::Path;

use grpc_client::proto;

use crate::config::model::{ModelConfig, RANDOM_SEED};

const DEFAULT_BATCH: i32 = 512;

fn seed(config: &ModelConfig) -> i32 {
    match config.parameters.seed {
        Some(RANDOM_SEED) | None => rand::random_range(0..i32::MAX),
        Some(seed) => seed,
    }
}

/// Options sent with `LoadModel`.
pub fn model_options(config: &ModelConfig, models_path: &Path) -> proto::ModelOptions {
    let p = &config.parameters;
    let model = config.model_file().to_string();
    let flash_attention = config
        .flash_attention
        .as_deref()
        .is_some_and(|v| matches!(v, "on" | "true" | "auto" | "enabled"));
    proto::ModelOptions {
        model_file: models_path.join(&model).to_string_lossy().into_owned(),
        model_path: models_path.to_string_lossy().into_owned(),
        model,
        context_size: config.context_size.unwrap_or_default(),
        seed: seed(config),
        n_batch: if p.batch > 0 { p.batch } else { DEFAULT_BATCH },
        f16_memory: config.f16.unwrap_or_default(),
        m_lock: config.mmlock.unwrap_or_default(),
        m_map: config.mmap.unwrap_or(true),
        low_vram: config.low_vram.unwrap_or_default(),
        embeddings: config.embeddings.unwrap_or_default(),
        ngpu_layers: config.gpu_layers.unwrap_or(9_999_999),
        main_gpu: config.main_gpu.clone(),
        tensor_split: config.tensor_split.clone(),
        threads: config.threads.unwrap_or(4) as i32,
        rope_freq_base: p.rope_freq_base,
        rope_freq_scale: p.rope_freq_scale,
        lora_adapter: config.lora_adapter.clone(),
        lora_base: config.lora_base.clone(),
        lora_scale: config.lora_scale,
        r#type: config.model_type.clone(),
        pipeline_type: config.diffusers.pipeline_type.clone(),
        scheduler_type: config.diffusers.scheduler_type.clone(),
        cuda: config.cuda || config.diffusers.cuda,
        cfg_scale: config.cfg_scale,
        clip_skip: config.diffusers.clip_skip,
        model_base_name: p.model_base_name.clone(),
        use_fast_tokenizer: p.use_fast_tokenizer,
        audio_path: config.tts.audio_path.clone(),
        flash_attention,
        no_kv_offload: config.no_kv_offloading,
        options: config.options.clone(),
        mmproj: config.mmproj.clone(),
        ..Default::default()
    }
}

/// Sampling options shared by every prediction-style call.
pub fn predict_options(config: &ModelConfig, models_path: &Path) -> proto::PredictOptions {
    let p = &config.parameters;
    let prompt_cache_path = if config.prompt_cache_path.is_empty() {
        String::new()
    } else {
        let path = models_path.join(&config.prompt_cache_path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        path.to_string_lossy().into_owned()
    };
    proto::PredictOptions {
        temperature: p.temperature.unwrap_or(0.9) as f32,
        top_p: p.top_p.unwrap_or(0.95) as f32,
        top_k: p.top_k.unwrap_or(40),
        tokens: p.max_tokens.unwrap_or_default(),
        threads: config.threads.unwrap_or(4) as i32,
        n_draft: config.n_draft,
        prompt_cache_all: config.prompt_cache_all,
        prompt_cache_ro: config.prompt_cache_ro,
        prompt_cache_path,
        f16kv: config.f16.unwrap_or_default(),
        debug_mode: config.debug.unwrap_or_default(),
        debug: config.debug.unwrap_or_default(),
        grammar: config.grammar.clone(),
        negative_prompt_scale: p.negative_prompt_scale,
        negative_prompt: p.negative_prompt.clone(),
        rope_freq_base: p.rope_freq_base,
        rope_freq_scale: p.rope_freq_scale,
        mirostat: config.mirostat.unwrap_or_default(),
        mirostat_eta: config.mirostat_eta.unwrap_or(0.1) as f32,
        mirostat_tau: config.mirostat_tau.unwrap_or(5.0) as f32,
        stop_prompts: config.stopwords.clone(),
        repeat: p.repeat_last_n,
        penalty: p.repeat_penalty as f32,
        n_keep: p.n_keep,
        batch: p.batch,
        ignore_eos: p.ignore_eos,
        seed: seed(config),
        frequency_penalty: p.frequency_penalty as f32,
        presence_penalty: p.presence_penalty as f32,
        m_lock: config.mmlock.unwrap_or_default(),
        m_map: config.mmap.unwrap_or(true),
        main_gpu: config.main_gpu.clone(),
        tensor_split: config.tensor_split.clone(),
        tail_free_sampling_z: p.tfz.unwrap_or(1.0) as f32,
        typical_p: p.typical_p.unwrap_or(1.0) as f32,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::ModelDefaults;

    fn config() -> ModelConfig {
        let mut config = ModelConfig::for_model_file("qwen.gguf");
        config.stopwords = vec!["</s>".into()];
        config.parameters.seed = Some(7);
        config.apply_defaults(&ModelDefaults {
            context_size: 2048,
            ..Default::default()
        });
        config
    }

    #[test]
    fn model_options_resolve_paths() {
        let options = model_options(&config(), Path::new("/models"));
        assert_eq!(options.model, "qwen.gguf");
        assert_eq!(options.model_file, "/models/qwen.gguf");
        assert_eq!(options.context_size, 2048);
        assert_eq!(options.threads, 4);
        assert_eq!(options.n_batch, DEFAULT_BATCH);
        assert_eq!(options.seed, 7);
        assert!(options.m_map);
    }

    #[test]
    fn predict_options_carry_sampling() {
        let options = predict_options(&config(), Path::new("/models"));
        assert_eq!(options.top_k, 40);
        assert_eq!(options.stop_prompts, vec!["</s>"]);
        assert!((options.temperature - 0.9).abs() < f32::EPSILON);
        assert_eq!(options.seed, 7);
    }

    #[test]
    fn random_seed_is_replaced() {
        let mut config = config();
        config.parameters.seed = Some(RANDOM_SEED);
        assert!(predict_options(&config, Path::new("/m")).seed >= 0);
    }
}

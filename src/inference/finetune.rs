//! Post-processing applied to raw model output.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::model::ModelConfig;

static REGEX_CACHE: Lazy<DashMap<String, Option<Regex>>> = Lazy::new(DashMap::new);

fn cached(pattern: &str) -> Option<Regex> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return re.value().clone();
    }
    let compiled = Regex::new(pattern)
        .map_err(|e| warn!(pattern, error = %e, "Ignoring invalid output regex"))
        .ok();
    REGEX_CACHE.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Apply echo, cutstrings, extract_regex, trimspace and trimsuffix, in
/// that order.
pub fn finetune(config: &ModelConfig, prompt: &str, prediction: &str) -> String {
    let mut out = if config.parameters.echo {
        format!("{prompt}{prediction}")
    } else {
        prediction.to_string()
    };

    for pattern in &config.cutstrings {
        if let Some(re) = cached(pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }

    for pattern in &config.extract_regex {
        let Some(re) = cached(pattern) else { continue };
        let extracted = re
            .captures(&out)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string());
        if let Some(extracted) = extracted {
            out = extracted;
        }
    }

    for prefix in &config.trimspace {
        out = out.strip_prefix(prefix.as_str()).unwrap_or(&out).trim().to_string();
    }

    for suffix in &config.trimsuffix {
        out = out.strip_suffix(suffix.as_str()).unwrap_or(&out).trim().to_string();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_without_rules() {
        let config = ModelConfig::default();
        assert_eq!(finetune(&config, "p", " hi "), " hi ");
    }

    #[test]
    fn echo_prepends_prompt() {
        let mut config = ModelConfig::default();
        config.parameters.echo = true;
        assert_eq!(finetune(&config, "Q: ", "A"), "Q: A");
    }

    #[test]
    fn rules_run_in_order() {
        let config = ModelConfig {
            cutstrings: vec![r"<\|im_end\|>".into()],
            extract_regex: vec![r"(?s)ANSWER:(.*)".into()],
            trimspace: vec![" ".into()],
            trimsuffix: vec!["</s>".into()],
            ..Default::default()
        };
        let out = finetune(&config, "", "noise ANSWER:  42 </s><|im_end|>");
        assert_eq!(out, "42");
    }

    #[test]
    fn extract_regex_without_match_keeps_text() {
        let config = ModelConfig {
            extract_regex: vec![r"\[(\d+)\]".into()],
            ..Default::default()
        };
        assert_eq!(finetune(&config, "", "plain"), "plain");
        assert_eq!(finetune(&config, "", "value [7] here"), "7");
    }
}

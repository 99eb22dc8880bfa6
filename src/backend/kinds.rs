//! Backend kind names and their aliases.

pub const LLAMA_CPP: &str = "llama-cpp";
pub const STABLEDIFFUSION_GGML: &str = "stablediffusion-ggml";
pub const TRANSFORMERS: &str = "transformers";
pub const HUGGINGFACE: &str = "huggingface";
pub const LOCAL_STORE: &str = "local-store";
pub const WHISPER: &str = "whisper";

/// Legacy names that map onto a current backend kind.
const ALIASES: &[(&str, &str)] = &[
    ("go-llama", LLAMA_CPP),
    ("llama", LLAMA_CPP),
    ("embedded-store", LOCAL_STORE),
    ("huggingface-embeddings", TRANSFORMERS),
    ("langchain-huggingface", HUGGINGFACE),
    ("transformers-musicgen", TRANSFORMERS),
    ("sentencetransformers", TRANSFORMERS),
    ("mamba", TRANSFORMERS),
    ("stablediffusion", STABLEDIFFUSION_GGML),
];

/// Aliases that also pin the model `type` sent on load.
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("sentencetransformers", "SentenceTransformer"),
    ("huggingface-embeddings", "SentenceTransformer"),
    ("mamba", "Mamba"),
    ("transformers-musicgen", "MusicgenForConditionalGeneration"),
];

/// Kinds never probed when a model names no backend.
const NOT_PROBED: &[&str] = &[LOCAL_STORE];

/// Kinds probed last.
const PROBED_LAST: &[&str] = &[HUGGINGFACE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKind {
    pub kind: String,
    pub model_type: Option<&'static str>,
}

/// Lower-case `name` and follow its alias, if any.
pub fn resolve(name: &str) -> ResolvedKind {
    let lower = name.trim().to_ascii_lowercase();
    let kind = ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, real)| real.to_string())
        .unwrap_or_else(|| lower.clone());
    let model_type = TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, t)| *t);
    ResolvedKind { kind, model_type }
}

/// Order candidates for greedy loading: configured priority first, then
/// the rest in the given order, with a few kinds pushed to the end.
pub fn probe_order(priority: &[String], available: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    let push = |name: &str, ordered: &mut Vec<String>| {
        let kind = resolve(name).kind;
        if !NOT_PROBED.contains(&kind.as_str()) && !ordered.contains(&kind) {
            ordered.push(kind);
        }
    };
    for name in priority {
        push(name, &mut ordered);
    }
    for name in available.iter().filter(|n| !PROBED_LAST.contains(&n.as_str())) {
        push(name, &mut ordered);
    }
    for name in available.iter().filter(|n| PROBED_LAST.contains(&n.as_str())) {
        push(name, &mut ordered);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(resolve("llama").kind, LLAMA_CPP);
        assert_eq!(resolve("Go-Llama").kind, LLAMA_CPP);
        assert_eq!(resolve("stablediffusion").kind, STABLEDIFFUSION_GGML);
        assert_eq!(resolve("whisper").kind, WHISPER);

        let st = resolve("sentencetransformers");
        assert_eq!(st.kind, TRANSFORMERS);
        assert_eq!(st.model_type, Some("SentenceTransformer"));
    }

    #[test]
    fn probe_order_dedupes_and_defers() {
        let priority = vec!["llama".to_string()];
        let available = vec![
            HUGGINGFACE.to_string(),
            WHISPER.to_string(),
            LLAMA_CPP.to_string(),
            LOCAL_STORE.to_string(),
        ];
        assert_eq!(
            probe_order(&priority, &available),
            vec![LLAMA_CPP, WHISPER, HUGGINGFACE]
        );
    }
}

//! Model usecase flags.
//!
//! A model config may declare `known_usecases`; when it doesn't, the gateway
//! guesses them from the backend kind and the configured templates. The flags
//! drive `/v1/models` filtering and endpoint admission.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Copy, Debug, Default, Clone, Eq, PartialEq, Hash)]
    pub struct ModelUsecase: u16 {
        /// Chat completions (/v1/chat/completions, /v1/messages, /v1/responses)
        const CHAT             = 1 << 0;
        /// Legacy completions (/v1/completions)
        const COMPLETION       = 1 << 1;
        /// Edits
        const EDIT             = 1 << 2;
        /// Embeddings (/v1/embeddings)
        const EMBEDDINGS       = 1 << 3;
        /// Rerank (/v1/rerank)
        const RERANK           = 1 << 4;
        /// Image generation (/v1/images/generations)
        const IMAGE            = 1 << 5;
        /// Speech to text (/v1/audio/transcriptions)
        const TRANSCRIPT       = 1 << 6;
        /// Text to speech (/v1/audio/speech)
        const TTS              = 1 << 7;
        /// Sound generation (/v1/sound-generation)
        const SOUND_GENERATION = 1 << 8;
        /// Tokenization (/v1/tokenize)
        const TOKENIZE         = 1 << 9;
        /// Voice activity detection (/v1/vad)
        const VAD              = 1 << 10;
        /// Video generation (/video)
        const VIDEO            = 1 << 11;
        /// Object detection (/v1/detection)
        const DETECTION        = 1 << 12;

        /// Anything a text-generation backend serves
        const LLM = Self::CHAT.bits() | Self::COMPLETION.bits()
                  | Self::EDIT.bits() | Self::TOKENIZE.bits();
    }
}

const USECASE_NAMES: &[(ModelUsecase, &str)] = &[
    (ModelUsecase::CHAT, "chat"),
    (ModelUsecase::COMPLETION, "completion"),
    (ModelUsecase::EDIT, "edit"),
    (ModelUsecase::EMBEDDINGS, "embeddings"),
    (ModelUsecase::RERANK, "rerank"),
    (ModelUsecase::IMAGE, "image"),
    (ModelUsecase::TRANSCRIPT, "transcript"),
    (ModelUsecase::TTS, "tts"),
    (ModelUsecase::SOUND_GENERATION, "sound_generation"),
    (ModelUsecase::TOKENIZE, "tokenize"),
    (ModelUsecase::VAD, "vad"),
    (ModelUsecase::VIDEO, "video"),
    (ModelUsecase::DETECTION, "detection"),
];

impl ModelUsecase {
    /// Look up a single flag by its config name (`FLAG_` prefix and case are ignored).
    pub fn from_config_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let lower = lower.strip_prefix("flag_").unwrap_or(&lower);
        USECASE_NAMES
            .iter()
            .find(|(_, n)| *n == lower)
            .map(|(f, _)| *f)
    }

    pub fn as_names(&self) -> Vec<&'static str> {
        USECASE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Default usecases for a backend kind when the config declares none.
    pub fn guess_for_backend(backend: &str) -> Self {
        match backend {
            "whisper" | "faster-whisper" | "moonshine" => Self::TRANSCRIPT,
            "piper" | "bark" | "bark-cpp" | "coqui" | "kokoro" | "vall-e-x" | "parler-tts" => {
                Self::TTS
            }
            "transformers-musicgen" | "musicgen" => Self::SOUND_GENERATION,
            "stablediffusion" | "stablediffusion-ggml" | "diffusers" | "tinydream" => {
                Self::IMAGE | Self::VIDEO
            }
            "rerankers" => Self::RERANK,
            "silero-vad" => Self::VAD,
            "rfdetr" => Self::DETECTION,
            "sentencetransformers" | "huggingface-embeddings" => Self::EMBEDDINGS,
            _ => Self::LLM | Self::EMBEDDINGS,
        }
    }
}

impl std::fmt::Display for ModelUsecase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.as_names();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

impl Serialize for ModelUsecase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let names = self.as_names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ModelUsecase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de;

        struct UsecaseVisitor;

        impl<'de> de::Visitor<'de> for UsecaseVisitor {
            type Value = ModelUsecase;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a list of usecase names")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ModelUsecase, E> {
                let mut usecase = ModelUsecase::empty();
                for name in v.split(',').filter(|s| !s.trim().is_empty()) {
                    usecase |= ModelUsecase::from_config_name(name)
                        .ok_or_else(|| E::custom(format!("unknown usecase: {name}")))?;
                }
                Ok(usecase)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<ModelUsecase, A::Error> {
                let mut usecase = ModelUsecase::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    usecase |= ModelUsecase::from_config_name(&name).ok_or_else(|| {
                        de::Error::custom(format!("unknown usecase: {name}"))
                    })?;
                }
                Ok(usecase)
            }
        }

        deserializer.deserialize_any(UsecaseVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flag_prefixed_names() {
        let usecase: ModelUsecase =
            serde_json::from_value(serde_json::json!(["FLAG_CHAT", "embeddings"])).unwrap();
        assert!(usecase.contains(ModelUsecase::CHAT));
        assert!(usecase.contains(ModelUsecase::EMBEDDINGS));
        assert!(!usecase.contains(ModelUsecase::TTS));
    }

    #[test]
    fn config_names_ignore_prefix_and_case() {
        assert_eq!(ModelUsecase::from_config_name("FLAG_TTS"), Some(ModelUsecase::TTS));
        assert_eq!(
            ModelUsecase::from_config_name(" Sound_Generation "),
            Some(ModelUsecase::SOUND_GENERATION)
        );
        assert_eq!(ModelUsecase::from_config_name("llm"), None);
    }

    #[test]
    fn rejects_unknown_names() {
        let result: Result<ModelUsecase, _> = serde_json::from_value(serde_json::json!(["warp"]));
        assert!(result.is_err());
    }

    #[test]
    fn guesses_from_backend() {
        assert_eq!(ModelUsecase::guess_for_backend("whisper"), ModelUsecase::TRANSCRIPT);
        assert!(ModelUsecase::guess_for_backend("llama-cpp").contains(ModelUsecase::CHAT));
    }
}

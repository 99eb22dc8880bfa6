//! Prompt templating for chat and completion models.
//!
//! Templates come in two flavors: Go `text/template` syntax with sprig-style
//! helpers, and Jinja syntax as shipped with HuggingFace chat templates.
//! Go-flavor sources are translated to Jinja on first use and both are
//! compiled into cached `minijinja` environments.

pub mod cache;
pub mod engine;
pub mod error;
mod functions;
pub mod evaluator;
pub mod gotext;

pub use cache::{verify_path, TemplateCache, TEMPLATE_EXTENSION};
pub use engine::{Flavor, GoTextDialect, JinjaDialect, TemplateDialect};
pub use error::{Result, TemplateError};
pub use evaluator::{
    ChatMessageTemplateData, ChatPromptConfig, Evaluator, MultimodalOptions, PromptExtras,
    PromptTemplateData, TemplateConfig, TemplateMessage, TemplateType,
    ASSISTANT_FUNCTION_CALL_ROLE, DEFAULT_MULTIMODAL_TEMPLATE,
};

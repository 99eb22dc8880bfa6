use thiserror::Error;

pub type Result<T> = std::result::Result<T, TemplateError>;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to parse template {name}: {reason}")]
    ParseFailed { name: String, reason: String },

    #[error("failed to render template {name}: {reason}")]
    RenderFailed { name: String, reason: String },

    #[error("template path escapes the templates directory: {0}")]
    PathTraversal(String),

    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

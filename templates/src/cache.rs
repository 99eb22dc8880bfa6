//! Compiled template cache.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

use minijinja::{context, Environment, Value};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::{
    engine::{Flavor, GoTextDialect, JinjaDialect, TemplateDialect},
    error::{Result, TemplateError},
};

/// Extension of template files in the templates directory.
pub const TEMPLATE_EXTENSION: &str = "tmpl";

/// Resolve `name` under `base`, refusing anything that could leave it.
pub fn verify_path(name: &str, base: &Path) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || name.is_empty() {
        return Err(TemplateError::PathTraversal(name.to_string()));
    }
    Ok(base.join(relative))
}

/// Whether a template reference can name a file rather than carry an
/// inline body.
fn looks_like_file_name(name: &str) -> bool {
    name.len() < 256 && !name.contains(['\n', '{', '}'])
}

struct EngineState {
    env: Environment<'static>,
    /// Template reference (file name or inline body hash) to compiled key
    compiled: HashMap<String, String>,
}

struct Engine {
    dialect: Box<dyn TemplateDialect>,
    state: Mutex<EngineState>,
}

impl Engine {
    fn new(dialect: Box<dyn TemplateDialect>) -> Self {
        let mut env = Environment::new();
        dialect.configure(&mut env);
        Self {
            dialect,
            state: Mutex::new(EngineState {
                env,
                compiled: HashMap::new(),
            }),
        }
    }
}

/// Lookup-or-compile cache over both template flavors.
///
/// A template reference is either the stem of a `.tmpl` file in the
/// templates directory or an inline template body.
pub struct TemplateCache {
    templates_dir: PathBuf,
    go: Engine,
    jinja: Engine,
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("templates_dir", &self.templates_dir)
            .finish_non_exhaustive()
    }
}

impl TemplateCache {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            go: Engine::new(Box::new(GoTextDialect)),
            jinja: Engine::new(Box::new(JinjaDialect)),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    fn engine(&self, flavor: Flavor) -> &Engine {
        match flavor {
            Flavor::GoText => &self.go,
            Flavor::Jinja => &self.jinja,
        }
    }

    /// True when `<templates_dir>/<name>.tmpl` exists.
    pub fn exists(&self, name: &str) -> bool {
        looks_like_file_name(name)
            && verify_path(&format!("{name}.{TEMPLATE_EXTENSION}"), &self.templates_dir)
                .is_ok_and(|path| path.is_file())
    }

    /// Read the body a reference stands for, together with its cache key.
    fn resolve(&self, reference: &str) -> Result<(String, String)> {
        if looks_like_file_name(reference) {
            let file = format!("{reference}.{TEMPLATE_EXTENSION}");
            let path = verify_path(&file, &self.templates_dir)?;
            if path.is_file() {
                let body = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                return Ok((format!("file:{reference}"), body));
            }
        }
        let hash = blake3::hash(reference.as_bytes()).to_hex().to_string();
        Ok((format!("inline:{hash}"), reference.to_string()))
    }

    /// Compile `reference` if needed, returning its key in the environment.
    fn compile(&self, engine: &Engine, state: &mut EngineState, reference: &str) -> Result<String> {
        if let Some(key) = state.compiled.get(reference) {
            return Ok(key.clone());
        }
        let (ref_key, body) = self.resolve(reference)?;
        let source_hash = blake3::hash(body.as_bytes()).to_hex();
        let key = format!("{}:{}", engine.dialect.flavor().as_str(), &source_hash[..16]);

        if state.env.get_template(&key).is_err() {
            let parse_failed = |reason: String| TemplateError::ParseFailed {
                name: ref_key.clone(),
                reason,
            };
            let prepared = engine.dialect.prepare(&body).map_err(parse_failed)?;
            state
                .env
                .add_template_owned(key.clone(), prepared)
                .map_err(|e| parse_failed(e.to_string()))?;
            debug!(template = %ref_key, flavor = engine.dialect.flavor().as_str(), "Compiled template");
        }
        state.compiled.insert(reference.to_string(), key.clone());
        Ok(key)
    }

    /// Render `reference` against `data`.
    ///
    /// Go-flavor templates see `data`'s fields at the top level and the
    /// whole of it as `.`.
    pub fn evaluate<S: Serialize>(&self, flavor: Flavor, reference: &str, data: &S) -> Result<String> {
        let engine = self.engine(flavor);
        let mut state = engine.state.lock();
        let key = self.compile(engine, &mut state, reference)?;

        let render_failed = |reason: String| TemplateError::RenderFailed {
            name: reference.chars().take(64).collect(),
            reason,
        };
        let template = state
            .env
            .get_template(&key)
            .map_err(|e| render_failed(e.to_string()))?;
        let value = Value::from_serialize(data);
        let ctx = match flavor {
            Flavor::GoText => context! { __root => value.clone(), ..value },
            Flavor::Jinja => value,
        };
        template.render(ctx).map_err(|e| render_failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rejects_traversal() {
        let base = Path::new("/models");
        assert!(matches!(
            verify_path("../etc/passwd", base),
            Err(TemplateError::PathTraversal(_))
        ));
        assert!(verify_path("/etc/passwd", base).is_err());
        assert_eq!(verify_path("chat.tmpl", base).unwrap(), base.join("chat.tmpl"));
    }

    #[test]
    fn inline_templates_render_in_both_flavors() {
        let cache = TemplateCache::new("/nonexistent");
        let data = json!({"input": "hi", "system_prompt": "be nice"});
        assert_eq!(
            cache.evaluate(Flavor::GoText, "{{.SystemPrompt}}: {{.Input}}", &data).unwrap(),
            "be nice: hi"
        );
        assert_eq!(
            cache.evaluate(Flavor::Jinja, "{{ system_prompt }}: {{ input }}", &data).unwrap(),
            "be nice: hi"
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        let cache = TemplateCache::new("/nonexistent");
        let err = cache.evaluate(Flavor::Jinja, "{% if %}", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::ParseFailed { .. }));
        let err = cache.evaluate(Flavor::GoText, "{{ if .A }}", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::ParseFailed { .. }));
    }

    #[test]
    fn render_errors_are_reported() {
        let cache = TemplateCache::new("/nonexistent");
        let err = cache
            .evaluate(Flavor::Jinja, "{{ raise_exception('nope') }}", &json!({}))
            .unwrap_err();
        assert!(matches!(err, TemplateError::RenderFailed { .. }));
    }
}

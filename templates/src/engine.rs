//! Template dialects.
//!
//! Both dialects compile into a `minijinja` environment; a dialect decides
//! how the environment is configured and how its sources are rewritten
//! before compilation.

use minijinja::Environment;

use crate::{functions, gotext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Go `text/template` syntax with sprig helpers
    GoText,
    /// Jinja syntax as used by HuggingFace chat templates
    Jinja,
}

impl Flavor {
    pub fn from_jinja_flag(jinja: bool) -> Self {
        if jinja {
            Flavor::Jinja
        } else {
            Flavor::GoText
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::GoText => "gotext",
            Flavor::Jinja => "jinja",
        }
    }
}

pub trait TemplateDialect: Send + Sync {
    fn flavor(&self) -> Flavor;

    /// Apply syntax options and register helper functions.
    fn configure(&self, env: &mut Environment<'static>);

    /// Turn a source written in this dialect into Jinja.
    fn prepare(&self, source: &str) -> Result<String, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GoTextDialect;

impl TemplateDialect for GoTextDialect {
    fn flavor(&self) -> Flavor {
        Flavor::GoText
    }

    fn configure(&self, env: &mut Environment<'static>) {
        env.set_keep_trailing_newline(true);
        functions::register_go_helpers(env);
    }

    fn prepare(&self, source: &str) -> Result<String, String> {
        gotext::translate(source)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JinjaDialect;

impl TemplateDialect for JinjaDialect {
    fn flavor(&self) -> Flavor {
        Flavor::Jinja
    }

    fn configure(&self, env: &mut Environment<'static>) {
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        functions::register_jinja_helpers(env);
    }

    fn prepare(&self, source: &str) -> Result<String, String> {
        Ok(source.to_string())
    }
}

//! Prompt construction from chat messages and model templates.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    cache::TemplateCache,
    engine::Flavor,
    error::{Result, TemplateError},
};

/// Role-map key used for assistant turns that carry function calls.
pub const ASSISTANT_FUNCTION_CALL_ROLE: &str = "assistant_function_call";

pub const DEFAULT_MULTIMODAL_TEMPLATE: &str = "{{ range .Audio }}[audio-{{.ID}}]{{end}}{{ range .Images }}[img-{{.ID}}]{{end}}{{ range .Video }}[vid-{{.ID}}]{{end}}{{.Text}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateType {
    Chat,
    ChatMessage,
    Completion,
    Edit,
    Functions,
}

/// The `template:` section of a model configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub chat: String,
    pub chat_message: String,
    pub completion: String,
    pub edit: String,
    #[serde(alias = "function")]
    pub functions: String,
    pub multimodal: String,
    /// Evaluate templates with Jinja semantics instead of Go text/template
    pub jinja_template: bool,
    pub join_chat_messages_by_character: Option<String>,
    pub reply_prefix: String,
}

impl TemplateConfig {
    pub fn flavor(&self) -> Flavor {
        Flavor::from_jinja_flag(self.jinja_template)
    }

    fn for_type(&self, template_type: TemplateType) -> &str {
        match template_type {
            TemplateType::Chat => &self.chat,
            TemplateType::ChatMessage => &self.chat_message,
            TemplateType::Completion => &self.completion,
            TemplateType::Edit => &self.edit,
            TemplateType::Functions => &self.functions,
        }
    }
}

/// Context of the top-level prompt templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptTemplateData {
    pub system_prompt: String,
    /// The conversation already carried a system message
    pub suppress_system_prompt: bool,
    pub input: String,
    pub instruction: String,
    pub functions: Vec<Value>,
    pub message_index: usize,
    pub reasoning_effort: String,
    pub metadata: BTreeMap<String, String>,
}

/// Context of the per-message template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatMessageTemplateData {
    pub system_prompt: String,
    /// Role label from the model's role map
    pub role: String,
    /// Role as sent by the client
    pub role_name: String,
    pub function_name: String,
    pub content: String,
    pub message_index: usize,
    /// Grammar-constrained function calling is active on this last message
    pub function: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    pub last_message: bool,
}

/// A chat message reduced to what templates consume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateMessage {
    pub role: String,
    pub content: String,
    pub name: Option<String>,
    pub function_call: Option<Value>,
    pub tool_calls: Option<Value>,
    pub reasoning: Option<String>,
}

impl TemplateMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    fn call_payload(&self) -> Option<Value> {
        match &self.tool_calls {
            Some(Value::Array(calls)) if !calls.is_empty() => self.tool_calls.clone(),
            _ => self.function_call.clone(),
        }
    }
}

/// Model-level settings used while building a chat prompt.
#[derive(Debug, Clone, Copy)]
pub struct ChatPromptConfig<'a> {
    pub model: &'a str,
    pub templates: &'a TemplateConfig,
    pub system_prompt: &'a str,
    pub roles: &'a HashMap<String, String>,
    /// A grammar constrains the reply
    pub grammar_active: bool,
}

/// Extra request fields exposed to prompt templates.
#[derive(Debug, Clone, Default)]
pub struct PromptExtras {
    pub reasoning_effort: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MultimodalOptions {
    pub total_images: usize,
    pub total_videos: usize,
    pub total_audios: usize,
    pub images_in_message: usize,
    pub videos_in_message: usize,
    pub audios_in_message: usize,
}

#[derive(Serialize)]
struct MediaRef {
    id: usize,
}

#[derive(Serialize)]
struct MultimodalData<'a> {
    text: &'a str,
    #[serde(flatten)]
    options: MultimodalOptions,
    images: Vec<MediaRef>,
    audio: Vec<MediaRef>,
    video: Vec<MediaRef>,
}

fn media_refs(total: usize, in_message: usize) -> Vec<MediaRef> {
    (total.saturating_sub(in_message)..total)
        .map(|id| MediaRef { id })
        .collect()
}

#[derive(Debug)]
pub struct Evaluator {
    cache: TemplateCache,
}

impl Evaluator {
    pub fn new(cache: TemplateCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &TemplateCache {
        &self.cache
    }

    /// Render, turning runtime failures into `fallback`. Parse and lookup
    /// failures are returned.
    fn render_or<S: Serialize>(
        &self,
        flavor: Flavor,
        reference: &str,
        data: &S,
        fallback: &str,
    ) -> Result<String> {
        match self.cache.evaluate(flavor, reference, data) {
            Err(TemplateError::RenderFailed { name, reason }) => {
                warn!(template = %name, %reason, "Template evaluation failed, using untemplated input");
                Ok(fallback.to_string())
            }
            other => other,
        }
    }

    /// Render the prompt-level template of `template_type`.
    ///
    /// A `<model>.tmpl` file in the templates directory is used unless the
    /// configuration names a template for this type. Without any template
    /// the input is returned unchanged.
    pub fn evaluate_template_for_prompt(
        &self,
        template_type: TemplateType,
        model: &str,
        templates: &TemplateConfig,
        data: &PromptTemplateData,
    ) -> Result<String> {
        let configured = templates.for_type(template_type);
        let reference = if !configured.is_empty() {
            configured
        } else if !model.is_empty() && self.cache.exists(model) {
            model
        } else {
            return Ok(data.input.clone());
        };

        let flavor = templates.flavor();
        match flavor {
            Flavor::GoText => self.render_or(flavor, reference, data, &data.input),
            Flavor::Jinja => {
                let mut ctx = serde_json::to_value(data).unwrap_or_default();
                if let Some(map) = ctx.as_object_mut() {
                    map.insert("content".to_string(), Value::String(data.input.clone()));
                }
                self.render_or(flavor, reference, &ctx, &data.input)
            }
        }
    }

    /// Render a whole conversation with a Jinja chat template.
    fn template_jinja_chat(
        &self,
        messages: &[TemplateMessage],
        config: &ChatPromptConfig<'_>,
        functions: &[Value],
    ) -> Result<String> {
        let rendered: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({
                    "role": m.role,
                    "content": m.content,
                });
                if let Some(name) = &m.name {
                    msg["name"] = Value::String(name.clone());
                }
                if let Some(calls) = m.call_payload() {
                    msg["tool_call"] = Value::String(calls.to_string());
                    msg["tool_calls"] = calls;
                }
                if let Some(reasoning) = &m.reasoning {
                    msg["reasoning_content"] = Value::String(reasoning.clone());
                }
                msg
            })
            .collect();
        let mut ctx = serde_json::json!({
            "messages": rendered,
            "system_prompt": config.system_prompt,
            "add_generation_prompt": true,
            "bos_token": "",
            "eos_token": "",
        });
        if !functions.is_empty() {
            ctx["tools"] = Value::Array(functions.to_vec());
        }
        self.cache
            .evaluate(Flavor::Jinja, &config.templates.chat_message, &ctx)
    }

    /// Build the prompt for a chat request.
    ///
    /// With a Jinja configuration the chat-message template renders the
    /// whole conversation. Otherwise each message is rendered on its own
    /// (through the chat-message template when set, else as `role content`),
    /// the results are joined and the chat or functions template wraps them.
    pub fn template_messages(
        &self,
        messages: &[TemplateMessage],
        config: &ChatPromptConfig<'_>,
        functions: &[Value],
        use_functions: bool,
        extras: &PromptExtras,
    ) -> Result<String> {
        let templates = config.templates;
        if templates.jinja_template && !templates.chat_message.is_empty() {
            match self.template_jinja_chat(messages, config, functions) {
                Ok(prompt) => return Ok(prompt),
                Err(TemplateError::RenderFailed { name, reason }) => {
                    warn!(template = %name, %reason, "Jinja chat template failed, joining messages");
                }
                Err(e) => return Err(e),
            }
        }

        let mut suppress_system_prompt = false;
        let mut rendered = Vec::with_capacity(messages.len());
        let last = messages.len().saturating_sub(1);

        for (index, message) in messages.iter().enumerate() {
            let has_calls = message.function_call.is_some() || message.tool_calls.is_some();
            let mut role = message.role.as_str();
            if has_calls
                && role == "assistant"
                && config
                    .roles
                    .get(ASSISTANT_FUNCTION_CALL_ROLE)
                    .is_some_and(|r| !r.is_empty())
            {
                role = ASSISTANT_FUNCTION_CALL_ROLE;
            }
            let label = config.roles.get(role).map(String::as_str).unwrap_or_default();
            let content_exists = !message.content.is_empty();

            let mut content = String::new();
            if !templates.chat_message.is_empty() && !templates.jinja_template {
                let data = ChatMessageTemplateData {
                    system_prompt: config.system_prompt.to_string(),
                    role: label.to_string(),
                    role_name: role.to_string(),
                    function_name: message.name.clone().unwrap_or_default(),
                    content: message.content.clone(),
                    message_index: index,
                    function: config.grammar_active && index == last,
                    function_call: message.call_payload(),
                    tool_calls: message.tool_calls.clone(),
                    last_message: index == last,
                };
                match self
                    .cache
                    .evaluate(Flavor::GoText, &templates.chat_message, &data)
                {
                    Ok(out) if out.is_empty() => {
                        warn!(message_index = index, "Chat message template produced blank output, skipping message");
                        continue;
                    }
                    Ok(out) => content = out,
                    Err(TemplateError::RenderFailed { reason, .. }) => {
                        error!(message_index = index, %reason, "Error processing message with template");
                    }
                    Err(e) => return Err(e),
                }
            }

            if content.is_empty() {
                if content_exists {
                    content = format!("{label}{}", message.content);
                }
                let prefix = if label.is_empty() {
                    String::new()
                } else {
                    format!("{label} ")
                };
                for payload in [&message.function_call, &message.tool_calls].into_iter().flatten() {
                    let json = payload.to_string();
                    if content_exists {
                        content.push('\n');
                        content.push_str(&prefix);
                        content.push_str(&json);
                    } else {
                        content = format!("{prefix}{json}");
                    }
                }
                if content_exists && role == "system" {
                    suppress_system_prompt = true;
                }
            }
            rendered.push(content);
        }

        let separator = templates
            .join_chat_messages_by_character
            .as_deref()
            .unwrap_or("\n");
        let joined = rendered.join(separator);
        debug!(prompt = %joined, "Prompt before templating");

        let template_type = if !templates.functions.is_empty() && use_functions {
            TemplateType::Functions
        } else {
            TemplateType::Chat
        };
        let data = PromptTemplateData {
            system_prompt: config.system_prompt.to_string(),
            suppress_system_prompt,
            input: joined,
            functions: functions.to_vec(),
            reasoning_effort: extras.reasoning_effort.clone(),
            metadata: extras.metadata.clone(),
            ..Default::default()
        };
        self.evaluate_template_for_prompt(template_type, config.model, templates, &data)
    }

    /// Insert media placeholders in front of a message's text.
    pub fn template_multimodal(
        &self,
        template: &str,
        options: MultimodalOptions,
        text: &str,
    ) -> Result<String> {
        let template = if template.is_empty() {
            DEFAULT_MULTIMODAL_TEMPLATE
        } else {
            template
        };
        let data = MultimodalData {
            text,
            options,
            images: media_refs(options.total_images, options.images_in_message),
            audio: media_refs(options.total_audios, options.audios_in_message),
            video: media_refs(options.total_videos, options.videos_in_message),
        };
        self.cache.evaluate(Flavor::GoText, template, &data)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const LLAMA3: &str = r#"<|start_header_id|>{{if eq .RoleName "assistant"}}assistant{{else if eq .RoleName "system"}}system{{else if eq .RoleName "tool"}}tool{{else if eq .RoleName "user"}}user{{end}}<|end_header_id|>

{{ if .FunctionCall -}}
Function call:
{{ else if eq .RoleName "tool" -}}
Function response:
{{ end -}}
{{ if .Content -}}
{{.Content -}}
{{ else if .FunctionCall -}}
{{ toJson .FunctionCall -}}
{{ end -}}
<|eot_id|>"#;

    fn evaluator() -> Evaluator {
        Evaluator::new(TemplateCache::new("/nonexistent"))
    }

    fn render(templates: &TemplateConfig, messages: &[TemplateMessage]) -> String {
        let roles = HashMap::new();
        let config = ChatPromptConfig {
            model: "m",
            templates,
            system_prompt: "",
            roles: &roles,
            grammar_active: false,
        };
        evaluator()
            .template_messages(messages, &config, &[], false, &PromptExtras::default())
            .unwrap()
    }

    #[test]
    fn llama3_chat_message_template() {
        let templates = TemplateConfig {
            chat_message: LLAMA3.to_string(),
            ..Default::default()
        };
        assert_eq!(
            render(&templates, &[TemplateMessage::new("user", "A long time ago...")]),
            "<|start_header_id|>user<|end_header_id|>\n\nA long time ago...<|eot_id|>"
        );
        let call = TemplateMessage {
            role: "assistant".into(),
            function_call: Some(json!({"function": "test"})),
            ..Default::default()
        };
        assert_eq!(
            render(&templates, &[call]),
            "<|start_header_id|>assistant<|end_header_id|>\n\nFunction call:\n{\"function\":\"test\"}<|eot_id|>"
        );
        assert_eq!(
            render(&templates, &[TemplateMessage::new("tool", "Response from tool")]),
            "<|start_header_id|>tool<|end_header_id|>\n\nFunction response:\nResponse from tool<|eot_id|>"
        );
    }

    #[test]
    fn jinja_chat_template() {
        let templates = TemplateConfig {
            chat_message: "{% for m in messages %}[{{ m['role'] }}] {{ m.content }}\n{% endfor %}".into(),
            jinja_template: true,
            ..Default::default()
        };
        let messages = [
            TemplateMessage::new("system", "rules"),
            TemplateMessage::new("user", "hi"),
        ];
        assert_eq!(render(&templates, &messages), "[system] rules\n[user] hi\n");
    }

    #[test]
    fn plain_join_uses_role_labels_and_chat_template() {
        let templates = TemplateConfig {
            chat: "{{.Input}}\nASSISTANT:".into(),
            join_chat_messages_by_character: Some("\n\n".into()),
            ..Default::default()
        };
        let roles = HashMap::from([
            ("user".to_string(), "USER: ".to_string()),
            ("system".to_string(), "SYSTEM: ".to_string()),
        ]);
        let config = ChatPromptConfig {
            model: "m",
            templates: &templates,
            system_prompt: "",
            roles: &roles,
            grammar_active: false,
        };
        let messages = [
            TemplateMessage::new("system", "be brief"),
            TemplateMessage::new("user", "hi"),
        ];
        let prompt = evaluator()
            .template_messages(&messages, &config, &[], false, &PromptExtras::default())
            .unwrap();
        assert_eq!(prompt, "SYSTEM: be brief\n\nUSER: hi\nASSISTANT:");
    }

    #[test]
    fn blank_message_templates_skip_the_message() {
        let templates = TemplateConfig {
            chat_message: r#"{{if ne .RoleName "system"}}{{.Content}}{{end}}"#.into(),
            ..Default::default()
        };
        let messages = [
            TemplateMessage::new("system", "hidden"),
            TemplateMessage::new("user", "shown"),
        ];
        assert_eq!(render(&templates, &messages), "shown");
    }

    #[test]
    fn functions_template_when_tools_are_used() {
        let templates = TemplateConfig {
            chat: "chat:{{.Input}}".into(),
            functions: "tools:{{ len .Functions }}:{{.Input}}".into(),
            ..Default::default()
        };
        let roles = HashMap::new();
        let config = ChatPromptConfig {
            model: "m",
            templates: &templates,
            system_prompt: "",
            roles: &roles,
            grammar_active: true,
        };
        let functions = [json!({"name": "get_weather"})];
        let prompt = evaluator()
            .template_messages(
                &[TemplateMessage::new("user", "weather?")],
                &config,
                &functions,
                true,
                &PromptExtras::default(),
            )
            .unwrap();
        assert_eq!(prompt, "tools:1:weather?");
    }

    #[test]
    fn template_parse_failure_is_fatal() {
        let templates = TemplateConfig {
            chat: "{{ if .Input }}".into(),
            ..Default::default()
        };
        let roles = HashMap::new();
        let config = ChatPromptConfig {
            model: "m",
            templates: &templates,
            system_prompt: "",
            roles: &roles,
            grammar_active: false,
        };
        let err = evaluator()
            .template_messages(
                &[TemplateMessage::new("user", "x")],
                &config,
                &[],
                false,
                &PromptExtras::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::ParseFailed { .. }));
    }

    #[test]
    fn multimodal_placeholders() {
        let ev = evaluator();
        let opts = |ti, ta, im, am| MultimodalOptions {
            total_images: ti,
            total_audios: ta,
            images_in_message: im,
            audios_in_message: am,
            ..Default::default()
        };
        assert_eq!(ev.template_multimodal("", opts(1, 0, 1, 0), "bar").unwrap(), "[img-0]bar");
        assert_eq!(ev.template_multimodal("", opts(2, 0, 2, 0), "bar").unwrap(), "[img-0][img-1]bar");
        assert_eq!(
            ev.template_multimodal("", opts(4, 1, 2, 1), "bar").unwrap(),
            "[audio-0][img-2][img-3]bar"
        );
        assert_eq!(ev.template_multimodal("", opts(0, 0, 0, 0), "bar").unwrap(), "bar");
        let custom = "{{ range .Images }}[img-{{ add1 .ID}}]{{end}}{{.Text}}";
        assert_eq!(ev.template_multimodal(custom, opts(1, 0, 1, 0), "bar").unwrap(), "[img-1]bar");
    }
}

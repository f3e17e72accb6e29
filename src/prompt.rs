//! Chat prompts, written as Handlebars templates in TOML or JSON files.
//!
//! A prompt file looks like:
//!
//! ```toml
//! developer = "You are a helpful assistant."
//!
//! [[messages]]
//! user = "Summarize this:\n\n{{text}}"
//! ```

use std::sync::LazyLock;

use handlebars::Handlebars;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{JsonObject, read_json_or_toml},
    prelude::*,
};

/// Our template engine. We render prompts, not HTML, so nothing gets escaped,
/// and a typo in a binding name is an error instead of an empty string.
static HANDLEBARS: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
});

/// Something that can be rendered using template bindings.
pub trait RenderTemplate {
    type Output;

    /// Render all the templates in `self`.
    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output>;
}

/// A chat completion prompt.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// Messages, in order. Normally the last one is a user message.
    pub messages: Vec<Message>,
}

impl ChatPrompt {
    /// Parse a built-in TOML prompt.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse prompt")
    }

    /// Load a prompt from `path`, if we have one.
    pub async fn load_optional(path: Option<&Path>) -> Result<Option<Self>> {
        match path {
            Some(path) => read_json_or_toml::<Self>(path)
                .await
                .map(Some)
                .with_context(|| format!("Failed to load prompt from {}", path.display())),
            None => Ok(None),
        }
    }

    /// Render our templates using `bindings`.
    pub fn render(&self, bindings: &JsonObject) -> Result<RenderedPrompt> {
        self.render_template(&HANDLEBARS, bindings)
            .context("Failed to render prompt")
    }
}

impl RenderTemplate for ChatPrompt {
    type Output = RenderedPrompt;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut messages = vec![];
        if let Some(developer) = &self.developer {
            messages.push(RenderedMessage::Developer {
                text: handlebars.render_template(developer, bindings)?,
            });
        }
        for message in &self.messages {
            messages.extend(message.render_template(handlebars, bindings)?);
        }
        Ok(RenderedPrompt { messages })
    }
}

/// A user message, and optionally an example response.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// The user message.
    pub user: String,

    /// Images to attach to the user message, as URLs. Normally a single
    /// template like `"{{image_data_url}}"`.
    #[serde(default)]
    pub images: Vec<String>,

    /// An example assistant response, for few-shot prompting.
    #[serde(default)]
    pub assistant: Option<String>,
}

impl RenderTemplate for Message {
    type Output = Vec<RenderedMessage>;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let images = self
            .images
            .iter()
            .map(|image| handlebars.render_template(image, bindings))
            .collect::<Result<Vec<_>, _>>()?;
        let mut messages = vec![RenderedMessage::User {
            text: handlebars.render_template(&self.user, bindings)?,
            images,
        }];
        if let Some(assistant) = &self.assistant {
            messages.push(RenderedMessage::Assistant {
                text: handlebars.render_template(assistant, bindings)?,
            });
        }
        Ok(messages)
    }
}

/// A prompt which is ready to send to an LLM.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPrompt {
    pub messages: Vec<RenderedMessage>,
}

impl RenderedPrompt {
    /// The text of the last user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|message| match message {
            RenderedMessage::User { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// A single rendered message.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderedMessage {
    Developer { text: String },
    User { text: String, images: Vec<String> },
    Assistant { text: String },
}

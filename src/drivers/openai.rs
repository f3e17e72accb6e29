//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs,
        FinishReason, ImageDetail, ImageUrl,
    },
};

use crate::{
    prelude::*,
    prompt::{RenderedMessage, RenderedPrompt},
    retry::{retry_result_fatal, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Create an OpenAI-compatible client, configured from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
fn create_openai_client() -> Client<OpenAIConfig> {
    let mut config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        config = config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        config = config.with_api_base(api_base);
    }
    Client::with_config(config)
}

/// Convert our prompt into OpenAI's message types.
fn to_openai_messages(prompt: &RenderedPrompt) -> Vec<ChatCompletionRequestMessage> {
    prompt
        .messages
        .iter()
        .map(|message| match message {
            // "system" works with more gateways than "developer".
            RenderedMessage::Developer { text } => {
                ChatCompletionRequestSystemMessage::from(text.as_str()).into()
            }
            RenderedMessage::User { text, images } if images.is_empty() => {
                ChatCompletionRequestUserMessage::from(text.as_str()).into()
            }
            RenderedMessage::User { text, images } => {
                let mut parts = vec![ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText { text: text.clone() },
                )];
                parts.extend(images.iter().map(|url| {
                    ChatCompletionRequestUserMessageContentPart::ImageUrl(
                        ChatCompletionRequestMessageContentPartImage {
                            image_url: ImageUrl {
                                url: url.clone(),
                                detail: Some(ImageDetail::High),
                            },
                        },
                    )
                }));
                ChatCompletionRequestUserMessage::from(
                    ChatCompletionRequestUserMessageContent::Array(parts),
                )
                .into()
            }
            RenderedMessage::Assistant { text } => {
                ChatCompletionRequestAssistantMessage::from(text.as_str()).into()
            }
        })
        .collect()
}

/// Talks to an OpenAI-compatible chat completions endpoint.
#[derive(Debug)]
pub struct OpenAiDriver {
    client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: create_openai_client(),
        })
    }
}

#[async_trait]
impl Driver for OpenAiDriver {
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(model.to_owned())
            .messages(to_openai_messages(prompt))
            // Don't keep our users' documents around on the server.
            .store(false);
        if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        if let Some(temperature) = llm_opts.temperature {
            req.temperature(temperature);
        }
        if let Some(top_p) = llm_opts.top_p {
            req.top_p(top_p);
        }
        let req = try_fatal!(req.build().context("Error building request"));
        trace!(?req, "Request");

        let chat = self.client.chat();
        let response = try_potentially_transient!(llm_opts.apply_timeout(chat.create(req)).await);

        let token_usage = response.usage.as_ref().map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        match choice.finish_reason {
            Some(FinishReason::ContentFilter) => {
                return retry_result_fatal(anyhow!("Content filter triggered"));
            }
            Some(FinishReason::Length) => {
                warn!("LLM response was cut short by --max-completion-tokens");
            }
            _ => {}
        }
        let text = choice.message.content.clone().unwrap_or_default();
        debug!(%text, "Response");
        retry_result_ok(ChatCompletionResponse { text, token_usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_openai_messages() {
        let prompt = RenderedPrompt {
            messages: vec![
                RenderedMessage::Developer {
                    text: "Be brief.".to_owned(),
                },
                RenderedMessage::User {
                    text: "Read this.".to_owned(),
                    images: vec!["data:image/png;base64,AAAA".to_owned()],
                },
                RenderedMessage::Assistant {
                    text: "Done.".to_owned(),
                },
            ],
        };
        let messages = serde_json::to_value(to_openai_messages(&prompt)).unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Be brief.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][0]["text"], "Read this.");
        assert_eq!(messages[1]["content"][1]["type"], "image_url");
        assert_eq!(
            messages[1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "Done.");
    }
}

//! Echo driver for testing.
//!
//! Replies with the text of the last user message, so we can run the whole
//! pipeline without an LLM.

use crate::{
    prelude::*,
    prompt::RenderedPrompt,
    retry::{retry_result_fatal, retry_result_ok},
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult};

/// Echo driver for testing.
#[derive(Debug)]
pub struct EchoDriver;

#[async_trait]
impl Driver for EchoDriver {
    async fn chat_completion(
        &self,
        _model: &str,
        prompt: &RenderedPrompt,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        match prompt.last_user_text() {
            Some(text) => retry_result_ok(ChatCompletionResponse {
                text: text.to_owned(),
                token_usage: None,
            }),
            None => retry_result_fatal(anyhow!("No user message found in prompt")),
        }
    }
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;

    use super::*;

    #[tokio::test]
    async fn test_no_user_message() {
        let prompt = RenderedPrompt { messages: vec![] };
        let result = EchoDriver
            .chat_completion("echo", &prompt, &LlmOpts::default())
            .await;
        match result {
            RetryResult::Fatal { error, .. } => {
                assert!(error.to_string().contains("No user message"))
            }
            _ => panic!("expected a fatal error"),
        }
    }
}

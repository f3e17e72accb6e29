//! LLM drivers.
//!
//! Everything talks to LLMs through [`LlmClient`], which wraps a [`Driver`]
//! with rate limiting, timeouts and retries. The real driver speaks the
//! OpenAI chat completions API, which also covers LiteLLM, Ollama and most
//! other gateways. The echo driver lets us run the whole pipeline offline.

use std::{error, fmt, ops::AddAssign, pin::Pin, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use leaky_bucket::RateLimiter;
use schemars::JsonSchema;
use tokio::time;

use crate::{
    prelude::*,
    prompt::RenderedPrompt,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, Retried, retry_with_backoff},
};

pub mod echo;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI-compatible API (also LiteLLM, Ollama, etc).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Reply with the last user message. For testing without an LLM.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver.
    pub fn create_driver(&self) -> Result<Box<dyn Driver>> {
        match self {
            DriverType::OpenAI => Ok(Box::new(openai::OpenAiDriver::new()?)),
            DriverType::Echo => Ok(Box::new(echo::EchoDriver)),
        }
    }
}

/// Options for talking to LLMs.
#[derive(Args, Clone, Debug, Default)]
pub struct LlmOpts {
    /// The LLM driver to use. `openai` works with OpenAI, LiteLLM and Ollama.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// An upper limit on the number of completion tokens to generate. Each
    /// task has its own default.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Each task has
    /// its own default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// The top-p sampling value to use, between 0.0 and 1.0. Defaults to the
    /// model's default.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// A timeout, in seconds, for the LLM to return a complete response.
    /// Timed-out requests are retried.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for LLM requests, like "10/s" or "500/m". This is applied
    /// separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

impl LlmOpts {
    /// Fill in any settings the user didn't choose with task defaults.
    pub fn with_defaults(&self, max_completion_tokens: u32, temperature: f32) -> Self {
        Self {
            max_completion_tokens: Some(
                self.max_completion_tokens.unwrap_or(max_completion_tokens),
            ),
            temperature: Some(self.temperature.unwrap_or(temperature)),
            ..self.clone()
        }
    }

    /// Apply our timeout, if any, to a future.
    ///
    /// `'fut` is the lifetime of anything borrowed by `future`, which we need
    /// to preserve through the boxing.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        match self.timeout {
            Some(timeout) => time::timeout(Duration::from_secs(timeout), future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(LlmError::Timeout),
                })
                .boxed(),
            None => future.boxed(),
        }
    }
}

/// A [`RetryResult`] for LLM requests, which lets drivers distinguish
/// transient errors from fatal ones.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run a single "chat completion" request, without retrying.
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// A chat completion response.
#[derive(Debug)]
pub struct ChatCompletionResponse {
    /// The text of the response.
    pub text: String,

    /// Token usage, if the server reported it.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    /// Add two optional usages, keeping `None` only if both are `None`.
    pub fn sum(a: Option<TokenUsage>, b: Option<TokenUsage>) -> Option<TokenUsage> {
        match (a, b) {
            (Some(mut a), Some(b)) => {
                a += b;
                Some(a)
            }
            (a, b) => a.or(b),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// An LLM, with everything needed to call it politely.
#[derive(Debug)]
pub struct LlmClient {
    driver: Box<dyn Driver>,
    model: String,
    llm_opts: LlmOpts,
    rate_limiter: Option<RateLimiter>,
}

impl LlmClient {
    /// Create a client for `model`.
    pub fn new(model: String, llm_opts: LlmOpts) -> Result<Self> {
        let driver = llm_opts.driver.create_driver()?;
        let rate_limiter = llm_opts.rate_limit.as_ref().map(RateLimit::to_rate_limiter);
        Ok(Self {
            driver,
            model,
            llm_opts,
            rate_limiter,
        })
    }

    /// The model we're talking to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send `prompt`, retrying transient failures. `llm_opts` overrides the
    /// options we were created with.
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    pub async fn chat(
        &self,
        prompt: &RenderedPrompt,
        llm_opts: Option<&LlmOpts>,
    ) -> Result<Retried<ChatCompletionResponse>> {
        let llm_opts = llm_opts.unwrap_or(&self.llm_opts);
        retry_with_backoff(|| async {
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.acquire_one().await;
            }
            self.driver
                .chat_completion(&self.model, prompt, llm_opts)
                .await
        })
        .await
    }
}

/// An error which occurred while calling an LLM.
#[derive(Debug)]
pub enum LlmError<E> {
    /// An error from the underlying client.
    Native(E),

    /// We gave up waiting.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and overloaded servers often do better on a
            // second try.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::prompt::RenderedMessage;

    use super::*;

    #[test]
    fn test_with_defaults() {
        let opts = LlmOpts::default().with_defaults(2200, 0.7);
        assert_eq!(opts.max_completion_tokens, Some(2200));
        assert_eq!(opts.temperature, Some(0.7));

        let opts = LlmOpts {
            temperature: Some(0.0),
            ..LlmOpts::default()
        }
        .with_defaults(3000, 0.7);
        assert_eq!(opts.max_completion_tokens, Some(3000));
        assert_eq!(opts.temperature, Some(0.0));
    }

    #[test]
    fn test_token_usage_sum() {
        let usage = |p, c| TokenUsage {
            prompt_tokens: p,
            completion_tokens: c,
        };
        assert_eq!(TokenUsage::sum(None, None), None);
        assert_eq!(TokenUsage::sum(Some(usage(1, 2)), None), Some(usage(1, 2)));
        assert_eq!(
            TokenUsage::sum(Some(usage(1, 2)), Some(usage(10, 20))),
            Some(usage(11, 22))
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let opts = LlmOpts {
            timeout: Some(0),
            ..LlmOpts::default()
        };
        let result = opts
            .apply_timeout(async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(LlmError::Timeout)));
    }

    #[tokio::test]
    async fn test_echo_client() {
        let client = LlmClient::new(
            "test-model".to_owned(),
            LlmOpts {
                driver: DriverType::Echo,
                rate_limit: Some("100/s".parse().unwrap()),
                ..LlmOpts::default()
            },
        )
        .unwrap();
        let prompt = RenderedPrompt {
            messages: vec![RenderedMessage::User {
                text: "hello".to_owned(),
                images: vec![],
            }],
        };
        let response = client.chat(&prompt, None).await.unwrap();
        assert_eq!(response.value.text, "hello");
        assert!(response.retry_errors.is_empty());
        assert_eq!(client.model(), "test-model");
    }
}

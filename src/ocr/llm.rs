//! LLM-based OCR engine, for vision-capable models.

use crate::{
    async_utils::io::JsonObject,
    data_url::image_data_url,
    drivers::{LlmClient, LlmOpts},
    prelude::*,
    prompt::ChatPrompt,
};

use super::{OcrEngine, OcrImageInput, OcrImageOutput};

/// The default OCR prompt, used if no prompt is provided.
const DEFAULT_OCR_PROMPT: &str = include_str!("default_ocr_prompt.toml");

/// Transcriptions should be deterministic.
const OCR_TEMPERATURE: f32 = 0.0;

/// Plenty for a dense page.
const OCR_MAX_COMPLETION_TOKENS: u32 = 4096;

/// Get our default OCR prompt.
pub fn default_ocr_prompt() -> ChatPrompt {
    ChatPrompt::from_toml_str(DEFAULT_OCR_PROMPT).expect("failed to parse built-in OCR prompt")
}

/// An LLM-based OCR engine.
#[derive(Debug)]
pub struct LlmOcrEngine {
    llm: LlmClient,
    prompt: ChatPrompt,
}

impl LlmOcrEngine {
    /// Create a new LLM-based OCR engine.
    pub fn new(model: String, prompt: ChatPrompt, llm_opts: LlmOpts) -> Result<Self> {
        let llm_opts = llm_opts.with_defaults(OCR_MAX_COMPLETION_TOKENS, OCR_TEMPERATURE);
        Ok(Self {
            llm: LlmClient::new(model, llm_opts)?,
            prompt,
        })
    }
}

#[async_trait]
impl OcrEngine for LlmOcrEngine {
    #[instrument(level = "debug", skip_all, fields(id = %input.id, model = %self.llm.model()))]
    async fn ocr_image(&self, input: OcrImageInput) -> Result<OcrImageOutput> {
        let mut bindings = JsonObject::new();
        bindings.insert(
            "image_data_url".to_owned(),
            Value::String(image_data_url(&input.path).await?),
        );
        let prompt = self.prompt.render(&bindings)?;

        let response = self.llm.chat(&prompt, None).await?;
        Ok(OcrImageOutput {
            text: Some(response.value.text),
            errors: response.retry_errors,
            token_usage: response.value.token_usage,
        })
    }
}

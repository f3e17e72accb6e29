//! OCR engine interface.
//!
//! We treat OCR engines as black boxes: an image goes in, text comes out.

use std::sync::Arc;

use crate::{
    drivers::{LlmOpts, TokenUsage},
    prelude::*,
    prompt::ChatPrompt,
};

pub mod llm;
pub mod tesseract;

/// Anything shorter than this probably isn't a successful read.
pub const MIN_OCR_TEXT_CHARS: usize = 50;

/// An image to OCR.
#[derive(Debug)]
pub struct OcrImageInput {
    /// The ID of the record we're working on, for logging.
    pub id: Value,

    /// The path to the image.
    pub path: PathBuf,
}

/// The result of OCRing an image.
#[derive(Debug, Default)]
pub struct OcrImageOutput {
    /// The text, if the OCR succeeded.
    pub text: Option<String>,

    /// Any non-fatal errors that occurred during OCR.
    pub errors: Vec<String>,

    /// How many tokens did the LLM use?
    pub token_usage: Option<TokenUsage>,
}

impl OcrImageOutput {
    /// Return our text, or an error if we didn't read enough of it.
    pub fn require_text(&self) -> Result<&str> {
        let text = self.text.as_deref().unwrap_or_default().trim();
        if text.chars().count() < MIN_OCR_TEXT_CHARS {
            Err(anyhow!("could not read enough text from the image"))
        } else {
            Ok(text)
        }
    }
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// OCR a single image.
    async fn ocr_image(&self, input: OcrImageInput) -> Result<OcrImageOutput>;
}

/// Get the OCR engine for the specified model.
///
/// `"tesseract"` runs the `tesseract` CLI. Anything else is assumed to be the
/// name of a vision-capable LLM. For non-LLM models, `prompt` is ignored.
pub fn ocr_engine_for_model(
    model: &str,
    prompt: Option<ChatPrompt>,
    llm_opts: LlmOpts,
) -> Result<Arc<dyn OcrEngine>> {
    match model {
        "tesseract" => Ok(Arc::new(tesseract::TesseractOcrEngine)),
        _ => {
            let prompt = prompt.unwrap_or_else(llm::default_ocr_prompt);
            Ok(Arc::new(llm::LlmOcrEngine::new(
                model.to_owned(),
                prompt,
                llm_opts,
            )?))
        }
    }
}

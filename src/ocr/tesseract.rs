//! Tesseract OCR engine.

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*};

use super::{OcrEngine, OcrImageInput, OcrImageOutput};

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractOcrEngine;

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(id = %input.id))]
    async fn ocr_image(&self, input: OcrImageInput) -> Result<OcrImageOutput> {
        if !input.path.is_file() {
            return Err(anyhow!("image {} does not exist", input.path.display()));
        }

        // Tesseract appends ".txt" to the output base name we give it.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")
            .context("cannot create tesseract temporary directory")?;
        let output_path = tmpdir.path().join("output.txt");

        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input.path)
                .arg(output_path.with_extension(""))
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output)?;

        let text = tokio::fs::read_to_string(&output_path)
            .await
            .context("cannot read tesseract output file")?;
        Ok(OcrImageOutput {
            text: Some(text),
            ..OcrImageOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_image() {
        let err = TesseractOcrEngine
            .ocr_image(OcrImageInput {
                id: json!(1),
                path: PathBuf::from("/nonexistent/cover.jpg"),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}

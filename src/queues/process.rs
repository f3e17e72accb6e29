//! The full pipeline: OCR, book-cover detection, book search and
//! summarization, one record at a time.

use std::sync::Arc;

use futures::FutureExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::JoinWorker,
    books::{BookInfo, BookSearchClient},
    drivers::TokenUsage,
    ocr::{OcrEngine, OcrImageInput},
    prelude::*,
    retry::error_to_string,
    summary::{Summarizer, Summary, SummaryMode},
};

use super::{
    detect::DetectOutput,
    work::{WorkInput, WorkOutput, WorkQueue, WorkStatus},
};

/// Only look up books when we're at least this sure we have a cover.
pub const DEFAULT_BOOK_THRESHOLD: f64 = 0.5;

/// An input record for `process`. Supply either `text` or an image `path`.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct ProcessInput {
    /// Text which has already been extracted.
    #[serde(default)]
    pub text: Option<String>,

    /// A photo to OCR, used if `text` is missing or empty.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Overrides `--mode` for this record.
    #[serde(default)]
    pub mode: Option<SummaryMode>,
}

/// An output record for `process`.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct ProcessOutput {
    /// The image we read, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// The text we worked from, either from the input or from OCR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Book-cover detection results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectOutput>,

    /// The book we found, if this looked like a cover.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<BookInfo>,

    /// Did we summarize the book's description instead of the text?
    pub is_book_summary: bool,

    /// The summary. If this is present, the record succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

/// Everything the pipeline needs, shared between records.
pub struct ProcessState {
    pub ocr: Arc<dyn OcrEngine>,
    /// `None` if book search is turned off.
    pub books: Option<BookSearchClient>,
    pub summarizer: Summarizer,
    pub default_mode: SummaryMode,
    pub book_threshold: f64,
}

/// Make a [`WorkQueue`] that runs the full pipeline.
pub fn create_process_work_queue(
    concurrency_limit: usize,
    state: Arc<ProcessState>,
) -> Result<(WorkQueue<ProcessInput, ProcessOutput>, JoinWorker)> {
    let work_fn = move |input| {
        let state = state.clone();
        run_process(state, input).boxed()
    };
    WorkQueue::new(concurrency_limit, Arc::new(work_fn))
}

/// Things we accumulate while processing a record.
#[derive(Default)]
struct Progress {
    output: ProcessOutput,
    errors: Vec<String>,
    token_usage: Option<TokenUsage>,
}

/// Process a single record.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn run_process(
    state: Arc<ProcessState>,
    input: WorkInput<ProcessInput>,
) -> Result<WorkOutput<ProcessOutput>> {
    let mut progress = Progress::default();
    progress.output.path = input.data.path.clone();

    if let Err(err) = process_record(&state, &input, &mut progress).await {
        warn!("Processing failed: {:#}", err);
        progress.errors.push(error_to_string(&err));
    }

    let status = if progress.output.summary.is_some() {
        WorkStatus::Ok
    } else {
        WorkStatus::Failed
    };
    Ok(WorkOutput {
        id: input.id,
        status,
        token_usage: progress.token_usage,
        errors: progress.errors,
        data: progress.output,
    })
}

async fn process_record(
    state: &ProcessState,
    input: &WorkInput<ProcessInput>,
    progress: &mut Progress,
) -> Result<()> {
    // Get our text.
    let given_text = input
        .data
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());
    let text = match (given_text, &input.data.path) {
        (Some(text), _) => text.to_owned(),
        (None, Some(path)) => {
            let ocr_output = state
                .ocr
                .ocr_image(OcrImageInput {
                    id: input.id.clone(),
                    path: path.clone(),
                })
                .await?;
            progress.errors.extend(ocr_output.errors.iter().cloned());
            progress.token_usage =
                TokenUsage::sum(progress.token_usage.take(), ocr_output.token_usage.clone());
            ocr_output.require_text()?.to_owned()
        }
        (None, None) => return Err(anyhow!("record needs either `text` or `path`")),
    };
    progress.output.text = Some(text.clone());

    // Is this a book cover?
    let detection = DetectOutput::from_text(&text);
    debug!(
        is_book_cover = detection.detection.is_book_cover,
        confidence = detection.detection.confidence,
        "Detected"
    );
    let mut summary_text = text;
    if let (Some(books), Some(title)) = (&state.books, &detection.clean_title) {
        if detection.detection.is_book_cover
            && detection.detection.confidence >= state.book_threshold
        {
            match books.search(title, detection.clean_author.as_deref()).await {
                Ok(retried) => {
                    progress.errors.extend(retried.retry_errors);
                    if let Some(found) = retried.value.found {
                        summary_text = found.to_summary_text();
                        progress.output.book = Some(found.book);
                        progress.output.is_book_summary = true;
                    }
                }
                // We can still summarize the cover text.
                Err(err) => {
                    warn!("Book search failed: {:#}", err);
                    progress
                        .errors
                        .push(format!("book search failed: {}", error_to_string(&err)));
                }
            }
        }
    }
    progress.output.detection = Some(detection);

    // Summarize.
    let mode = input.data.mode.unwrap_or(state.default_mode);
    let retried = state.summarizer.summarize(&summary_text, mode).await?;
    progress.errors.extend(retried.retry_errors);
    progress.token_usage =
        TokenUsage::sum(progress.token_usage.take(), retried.value.token_usage);
    progress.output.summary = Some(retried.value.summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        books::{BooksOpts, tests::fake_books_api},
        drivers::{DriverType, LlmOpts},
        ocr::tesseract::TesseractOcrEngine,
        queues::work::WorkItemProcessor as _,
    };

    use super::*;

    const GATSBY: &str = "THE GREAT GATSBY\nby F. Scott Fitzgerald\nA Novel";

    const PROSE: &str = "The morning light crept slowly across the valley floor, \
        warming the stones that had lain cold through the long night. Farmers \
        walked out to their fields and talked about the rain.";

    fn echo_state(books: Option<BookSearchClient>) -> Arc<ProcessState> {
        let llm_opts = LlmOpts {
            driver: DriverType::Echo,
            ..LlmOpts::default()
        };
        Arc::new(ProcessState {
            ocr: Arc::new(TesseractOcrEngine),
            books,
            summarizer: Summarizer::new("echo".to_owned(), llm_opts, None).unwrap(),
            default_mode: SummaryMode::Standard,
            book_threshold: DEFAULT_BOOK_THRESHOLD,
        })
    }

    async fn process_all(
        state: Arc<ProcessState>,
        inputs: Vec<ProcessInput>,
    ) -> Vec<WorkOutput<ProcessOutput>> {
        let (queue, worker) = create_process_work_queue(2, state).unwrap();
        let handle = queue.handle();
        let mut outputs = vec![];
        for (idx, data) in inputs.into_iter().enumerate() {
            let input = WorkInput {
                id: json!(idx),
                data,
            };
            outputs.push(handle.process_blocking(input).await.unwrap());
        }
        drop(handle);
        drop(queue);
        worker.join().await.unwrap();
        outputs
    }

    fn text_input(text: &str) -> ProcessInput {
        ProcessInput {
            text: Some(text.to_owned()),
            path: None,
            mode: None,
        }
    }

    #[tokio::test]
    async fn test_prose_without_book_search() {
        let outputs = process_all(
            echo_state(None),
            vec![
                text_input(PROSE),
                text_input("   "),
                ProcessInput {
                    text: None,
                    path: None,
                    mode: None,
                },
            ],
        )
        .await;

        let ok = &outputs[0];
        assert_eq!(ok.status, WorkStatus::Ok);
        assert!(!ok.data.is_book_summary);
        assert!(!ok.data.detection.as_ref().unwrap().detection.is_book_cover);
        assert!(ok.data.summary.is_some());

        for failed in &outputs[1..] {
            assert_eq!(failed.status, WorkStatus::Failed);
            assert_eq!(failed.errors, vec!["record needs either `text` or `path`"]);
        }
    }

    #[tokio::test]
    async fn test_short_cover_text_fails_without_book_search() {
        let outputs = process_all(echo_state(None), vec![text_input(GATSBY)]).await;
        let output = &outputs[0];
        assert_eq!(output.status, WorkStatus::Failed);
        assert!(output.data.detection.as_ref().unwrap().detection.is_book_cover);
        assert!(output.errors[0].contains("at least 50 characters"));
    }

    #[tokio::test]
    async fn test_book_cover_is_looked_up() {
        let (api_base, requests) = fake_books_api(vec![json!({
            "items": [{
                "id": "G1",
                "volumeInfo": {
                    "title": "The Great Gatsby",
                    "authors": ["F. Scott Fitzgerald"],
                    "description": "A novel of the Jazz Age."
                }
            }]
        })])
        .await;
        let books = BookSearchClient::new(&BooksOpts {
            books_api_base: api_base,
            books_api_key: None,
            books_rate_limit: None,
        })
        .unwrap();

        let outputs = process_all(echo_state(Some(books)), vec![text_input(GATSBY)]).await;
        let output = &outputs[0];
        assert_eq!(output.status, WorkStatus::Ok, "errors: {:?}", output.errors);
        assert!(output.data.is_book_summary);
        assert_eq!(output.data.book.as_ref().unwrap().title, "The Great Gatsby");
        assert!(
            requests.lock().unwrap()[0]
                .contains("intitle%3A%22THE+GREAT+GATSBY%22+inauthor%3A%22F.+Scott+Fitzgerald%22")
        );
    }

    #[tokio::test]
    async fn test_book_search_errors_are_not_fatal() {
        // An invalid URL fails fatally, without retries.
        let books = BookSearchClient::new(&BooksOpts {
            books_api_base: "not a url".to_owned(),
            books_api_key: None,
            books_rate_limit: None,
        })
        .unwrap();
        let text = format!("{}\n{}", GATSBY, "Winner of many awards and prizes");
        let outputs = process_all(echo_state(Some(books)), vec![text_input(&text)]).await;
        let output = &outputs[0];
        assert_eq!(output.status, WorkStatus::Ok);
        assert!(!output.data.is_book_summary);
        assert!(output.errors[0].starts_with("book search failed"));
    }
}

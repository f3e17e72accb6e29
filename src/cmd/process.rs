//! The `process` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    books::{BookSearchClient, BooksOpts},
    drivers::LlmOpts,
    ocr::ocr_engine_for_model,
    prelude::*,
    prompt::ChatPrompt,
    queues::process::{DEFAULT_BOOK_THRESHOLD, ProcessState, create_process_work_queue},
    ui::{ProgressConfig, Ui},
};

use super::{IoOpts, StreamOpts, run_work_queue, summarize::SummaryOpts};

/// Command line arguments for `process`.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    #[clap(flatten)]
    pub io_opts: IoOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub summary_opts: SummaryOpts,

    /// The OCR engine for records with a `path`. Use "tesseract" for the
    /// `tesseract` CLI, or the name of a vision-capable LLM.
    #[clap(long, default_value = "tesseract")]
    pub ocr_model: String,

    /// A custom OCR prompt for LLM OCR, in TOML or JSON. The image is
    /// available as `{{image_data_url}}`.
    #[clap(long = "ocr-prompt", value_name = "PROMPT_FILE")]
    pub ocr_prompt_path: Option<PathBuf>,

    /// Only search for books when detection confidence is at least this high.
    #[clap(long, default_value_t = DEFAULT_BOOK_THRESHOLD)]
    pub book_threshold: f64,

    /// Never search for books. Summarize the text as-is.
    #[clap(long)]
    pub skip_book_search: bool,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,

    #[clap(flatten)]
    pub books_opts: BooksOpts,
}

/// Run the `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(ui: &Ui, opts: &ProcessOpts) -> Result<()> {
    if !(0.0..=1.0).contains(&opts.book_threshold) {
        return Err(anyhow!("--book-threshold must be between 0.0 and 1.0"));
    }

    let ocr_prompt = ChatPrompt::load_optional(opts.ocr_prompt_path.as_deref()).await?;
    let ocr = ocr_engine_for_model(&opts.ocr_model, ocr_prompt, opts.llm_opts.clone())?;
    let books = if opts.skip_book_search {
        None
    } else {
        Some(BookSearchClient::new(&opts.books_opts)?)
    };
    let state = ProcessState {
        ocr,
        books,
        summarizer: opts.summary_opts.to_summarizer(&opts.llm_opts).await?,
        default_mode: opts.summary_opts.mode,
        book_threshold: opts.book_threshold,
    };

    run_work_queue(
        ui,
        &opts.io_opts,
        &opts.stream_opts,
        &ProgressConfig {
            emoji: "📖",
            msg: "Processing prints",
            done_msg: "Processed prints",
        },
        create_process_work_queue(opts.stream_opts.job_count, Arc::new(state))?,
    )
    .await
}

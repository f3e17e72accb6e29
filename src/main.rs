use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod book_cover;
mod books;
mod cmd;
mod cpu_limit;
mod data_url;
mod drivers;
mod ocr;
mod prelude;
mod prompt;
mod queues;
mod rate_limit;
mod retry;
mod summary;
mod ui;

/// Summarize photographed print: OCR, book-cover detection, book lookup and
/// LLM summaries.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the LLM server URL. Works with
    LiteLLM, Ollama and other OpenAI-compatible gateways.
  - OPENAI_API_KEY: The LLM API key to use.
  - GOOGLE_BOOKS_API_BASE (optional): Override the Google Books API URL.
  - GOOGLE_BOOKS_API_KEY (optional): A Google Books API key.
  - RUST_LOG (optional): Log filter, like "debug" or "print_summarizer=trace".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Classify OCR text as book covers. Records need a `text` field.
    Detect(cmd::detect::DetectOpts),
    /// Look up books on Google Books. Records need a `title` field, and may
    /// have an `author`.
    Search(cmd::search::SearchOpts),
    /// Summarize text. Records need a `text` field, and may have a `mode`.
    Summarize(cmd::summarize::SummarizeOpts),
    /// Run the full pipeline. Records need a `text` or an image `path`.
    Process(cmd::process::ProcessOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Detect(opts) => opts.io_opts.output_path.is_none(),
            Cmd::Search(opts) => opts.io_opts.output_path.is_none(),
            Cmd::Summarize(opts) => opts.io_opts.output_path.is_none(),
            Cmd::Process(opts) => opts.io_opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Progress bars would get mixed up with our output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Detect(opts) => cmd::detect::cmd_detect(&ui, opts).await,
        Cmd::Search(opts) => cmd::search::cmd_search(&ui, opts).await,
        Cmd::Summarize(opts) => cmd::summarize::cmd_summarize(&ui, opts).await,
        Cmd::Process(opts) => cmd::process::cmd_process(&ui, opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}

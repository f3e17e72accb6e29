//! The `summarize` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    drivers::LlmOpts,
    prelude::*,
    prompt::ChatPrompt,
    queues::summarize::create_summarize_work_queue,
    summary::{Summarizer, SummaryMode},
    ui::{ProgressConfig, Ui},
};

use super::{DEFAULT_MODEL, IoOpts, StreamOpts, run_work_queue};

/// Options for summarizing, shared with `process`.
#[derive(Debug, Args)]
pub struct SummaryOpts {
    /// The LLM model to use for summaries.
    #[clap(short = 'm', long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// The kind of summary to write. Records may override this with a `mode`
    /// field.
    #[clap(long, value_enum, default_value_t = SummaryMode::default())]
    pub mode: SummaryMode,

    /// A custom summary prompt, in TOML or JSON. The text to summarize is
    /// available as `{{text}}`.
    #[clap(long = "prompt", value_name = "PROMPT_FILE")]
    pub prompt_path: Option<PathBuf>,
}

impl SummaryOpts {
    /// Build a [`Summarizer`] from these options.
    pub async fn to_summarizer(&self, llm_opts: &LlmOpts) -> Result<Summarizer> {
        let prompt_override = ChatPrompt::load_optional(self.prompt_path.as_deref()).await?;
        Summarizer::new(self.model.clone(), llm_opts.clone(), prompt_override)
    }
}

/// Command line arguments for `summarize`.
#[derive(Debug, Args)]
pub struct SummarizeOpts {
    #[clap(flatten)]
    pub io_opts: IoOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub summary_opts: SummaryOpts,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

/// Run the `summarize` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_summarize(ui: &Ui, opts: &SummarizeOpts) -> Result<()> {
    let summarizer = opts.summary_opts.to_summarizer(&opts.llm_opts).await?;
    run_work_queue(
        ui,
        &opts.io_opts,
        &opts.stream_opts,
        &ProgressConfig {
            emoji: "📝",
            msg: "Summarizing",
            done_msg: "Summarized",
        },
        create_summarize_work_queue(
            opts.stream_opts.job_count,
            Arc::new(summarizer),
            opts.summary_opts.mode,
        )?,
    )
    .await
}

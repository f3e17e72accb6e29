//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    prelude::*,
    prompt::ChatPrompt,
    queues::{
        detect::{DetectInput, DetectOutput},
        process::{ProcessInput, ProcessOutput},
        search::{SearchInput, SearchOutput},
        summarize::{SummarizeInput, SummarizeOutput},
        work::{WorkInput, WorkOutput},
    },
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// `detect` input.
    DetectInput,
    /// `detect` output.
    DetectOutput,
    /// `search` input.
    SearchInput,
    /// `search` output.
    SearchOutput,
    /// `summarize` input.
    SummarizeInput,
    /// `summarize` output.
    SummarizeOutput,
    /// `process` input.
    ProcessInput,
    /// `process` output.
    ProcessOutput,
    /// Prompt files for `--prompt` and `--ocr-prompt`.
    ChatPrompt,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::DetectInput => schema_for!(WorkInput<DetectInput>),
        SchemaType::DetectOutput => schema_for!(WorkOutput<DetectOutput>),
        SchemaType::SearchInput => schema_for!(WorkInput<SearchInput>),
        SchemaType::SearchOutput => schema_for!(WorkOutput<SearchOutput>),
        SchemaType::SummarizeInput => schema_for!(WorkInput<SummarizeInput>),
        SchemaType::SummarizeOutput => schema_for!(WorkOutput<SummarizeOutput>),
        SchemaType::ProcessInput => schema_for!(WorkInput<ProcessInput>),
        SchemaType::ProcessOutput => schema_for!(WorkOutput<ProcessOutput>),
        SchemaType::ChatPrompt => schema_for!(ChatPrompt),
    };

    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.write_all(b"\n").await.context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}

//! Command-line entry points.

use clap::Args;
use futures::{Stream as _, StreamExt as _};
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{BoxedStream, JoinWorker},
    prelude::*,
    queues::work::{WorkInput, WorkOutput, WorkQueue},
    ui::{ProgressConfig, Ui},
};

pub mod detect;
pub mod process;
pub mod schema;
pub mod search;
pub mod summarize;

/// Default model for summaries.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Where to read records from, and where to write them.
#[derive(Debug, Clone, Args)]
pub struct IoOpts {
    /// Input file, in JSONL or CSV format. Defaults to standard input.
    #[clap(value_name = "INPUT")]
    pub input_path: Option<PathBuf>,

    /// Output file, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Common options for subcommands that process data streams.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// Max number of records to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }
}

/// Read records, run them through `queue`, and write the results in input
/// order.
pub async fn run_work_queue<InputData, OutputData>(
    ui: &Ui,
    io_opts: &IoOpts,
    stream_opts: &StreamOpts,
    progress_config: &ProgressConfig<'_>,
    (queue, worker): (WorkQueue<InputData, OutputData>, JoinWorker),
) -> Result<()>
where
    InputData: DeserializeOwned + Send + 'static,
    OutputData: Serialize + Send + 'static,
{
    // Open up our input stream and convert to records.
    let input = WorkInput::<InputData>::read_stream(ui.clone(), io_opts.input_path.as_deref())
        .await?;
    let input = stream_opts.apply_stream_input_opts(input);
    let pb = ui.new_from_size_hint(progress_config, input.size_hint());

    // Resolve our records concurrently, keeping them in order.
    let futures = queue.handle().process_stream(input);
    let output = pb.wrap_stream(futures.buffered(stream_opts.job_count)).boxed();
    WorkOutput::write_stream(ui, io_opts.output_path.as_deref(), output, stream_opts).await?;

    // Wait for our work queue's background task to exit.
    drop(queue);
    worker.join().await
}

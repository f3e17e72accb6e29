//! The `detect` subcommand.

use clap::Args;

use crate::{
    prelude::*,
    queues::detect::create_detect_work_queue,
    ui::{ProgressConfig, Ui},
};

use super::{IoOpts, StreamOpts, run_work_queue};

/// Command line arguments for `detect`.
#[derive(Debug, Args)]
pub struct DetectOpts {
    #[clap(flatten)]
    pub io_opts: IoOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

/// Run the `detect` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_detect(ui: &Ui, opts: &DetectOpts) -> Result<()> {
    run_work_queue(
        ui,
        &opts.io_opts,
        &opts.stream_opts,
        &ProgressConfig {
            emoji: "🔍",
            msg: "Detecting book covers",
            done_msg: "Detected book covers",
        },
        create_detect_work_queue(opts.stream_opts.job_count)?,
    )
    .await
}

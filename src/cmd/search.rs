//! The `search` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    books::{BookSearchClient, BooksOpts},
    prelude::*,
    queues::search::create_search_work_queue,
    ui::{ProgressConfig, Ui},
};

use super::{IoOpts, StreamOpts, run_work_queue};

/// Command line arguments for `search`.
#[derive(Debug, Args)]
pub struct SearchOpts {
    #[clap(flatten)]
    pub io_opts: IoOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub books_opts: BooksOpts,
}

/// Run the `search` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_search(ui: &Ui, opts: &SearchOpts) -> Result<()> {
    let client = Arc::new(BookSearchClient::new(&opts.books_opts)?);
    run_work_queue(
        ui,
        &opts.io_opts,
        &opts.stream_opts,
        &ProgressConfig {
            emoji: "📚",
            msg: "Searching for books",
            done_msg: "Searched for books",
        },
        create_search_work_queue(opts.stream_opts.job_count, client)?,
    )
    .await
}

//! Summarization as a work queue.

use std::sync::Arc;

use futures::FutureExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::JoinWorker,
    prelude::*,
    retry::error_to_string,
    summary::{Summarizer, Summary, SummaryMode},
};

use super::work::{WorkInput, WorkOutput, WorkQueue};

/// An input record for `summarize`.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct SummarizeInput {
    /// The text to summarize. Must be at least 50 characters.
    #[serde(default)]
    pub text: String,

    /// Overrides `--mode` for this record.
    #[serde(default)]
    pub mode: Option<SummaryMode>,
}

/// An output record for `summarize`.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct SummarizeOutput {
    /// The summary. If this is present, the request succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

/// Make a [`WorkQueue`] that summarizes text.
pub fn create_summarize_work_queue(
    concurrency_limit: usize,
    summarizer: Arc<Summarizer>,
    default_mode: SummaryMode,
) -> Result<(WorkQueue<SummarizeInput, SummarizeOutput>, JoinWorker)> {
    let work_fn = move |input| {
        let summarizer = summarizer.clone();
        run_summarize(summarizer, default_mode, input).boxed()
    };
    WorkQueue::new(concurrency_limit, Arc::new(work_fn))
}

/// Summarize a single record.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn run_summarize(
    summarizer: Arc<Summarizer>,
    default_mode: SummaryMode,
    input: WorkInput<SummarizeInput>,
) -> Result<WorkOutput<SummarizeOutput>> {
    let mode = input.data.mode.unwrap_or(default_mode);
    match summarizer.summarize(&input.data.text, mode).await {
        Ok(retried) => {
            let mut output = WorkOutput::new_ok(
                input.id,
                SummarizeOutput {
                    summary: Some(retried.value.summary),
                },
            );
            output.token_usage = retried.value.token_usage;
            output.errors = retried.retry_errors;
            Ok(output)
        }
        Err(err) => {
            warn!("Summarization failed: {:#}", err);
            Ok(WorkOutput::new_failed(
                input.id,
                vec![error_to_string(&err)],
                SummarizeOutput::default(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        drivers::{DriverType, LlmOpts},
        queues::work::{WorkItemProcessor as _, WorkStatus},
    };

    use super::*;

    #[tokio::test]
    async fn test_summarize_queue() {
        let summarizer = Summarizer::new(
            "echo".to_owned(),
            LlmOpts {
                driver: DriverType::Echo,
                ..LlmOpts::default()
            },
            None,
        )
        .unwrap();
        let (queue, worker) =
            create_summarize_work_queue(2, Arc::new(summarizer), SummaryMode::Standard)
                .unwrap();
        let handle = queue.handle();

        let ok = handle
            .process_blocking(WorkInput {
                id: json!(1),
                data: SummarizeInput {
                    text: "The quick brown fox jumps over the lazy dog, again and again and again."
                        .to_owned(),
                    mode: Some(SummaryMode::Academic),
                },
            })
            .await
            .unwrap();
        let failed = handle
            .process_blocking(WorkInput {
                id: json!(2),
                data: SummarizeInput {
                    text: "Too short.".to_owned(),
                    mode: None,
                },
            })
            .await
            .unwrap();
        drop(handle);
        drop(queue);
        worker.join().await.unwrap();

        assert_eq!(ok.status, WorkStatus::Ok);
        let summary = ok.data.summary.unwrap();
        assert_eq!(summary.mode, SummaryMode::Academic);
        assert!(summary.academic_context.is_some());

        assert_eq!(failed.status, WorkStatus::Failed);
        assert!(failed.data.summary.is_none());
        assert!(failed.errors[0].contains("at least 50 characters"));
    }
}

//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! This is a strictly "in process" queue for closely-related subtasks of a
//! single batch run. It does not attempt to handle priorities or starvation.
//!
//! Normally, you will want to use [`WorkQueue`] and [`WorkQueueHandle`]. The
//! lower-level interface is [`WorkItem`] and [`WorkItemProcessor`].

use std::sync::{Arc, Mutex};

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{
        BoxedFuture, BoxedStream, JoinWorker,
        io::{read_jsonl_or_csv, write_output},
    },
    cmd::StreamOpts,
    drivers::TokenUsage,
    prelude::*,
    ui::Ui,
};

/// Input record for a [`WorkItemProcessor`].
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkInput<T>
where
    T: 'static,
{
    /// The unique ID of the work item. Any JSON value.
    pub id: Value,

    /// The input data for the work item.
    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkInput<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Convert from a JSON value to the input type.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize input")
    }

    /// Read a stream from a [`Path`] or from standard input.
    pub async fn read_stream(
        ui: Ui,
        path: Option<&Path>,
    ) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(ui, path)
            .await?
            .map(|value| Self::from_json(value?))
            .boxed())
    }
}

/// Output status of a work item.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// The work item was successful.
    Ok,

    /// The work item failed.
    Failed,
}

/// Output record from a [`WorkItemProcessor`].
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct WorkOutput<T>
where
    T: 'static,
{
    /// The unique ID of the work item.
    pub id: Value,

    /// What is the status of this work item?
    pub status: WorkStatus,

    /// How many tokens did we use?
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// Any errors that occurred during processing.
    pub errors: Vec<String>,

    /// The output data for the work item.
    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Serialize + Send + 'static,
{
    /// Create a new successful output record.
    pub fn new_ok(id: Value, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Ok,
            token_usage: None,
            errors: vec![],
            data,
        }
    }

    /// Create a new failed output record.
    pub fn new_failed(id: Value, errors: Vec<String>, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Failed,
            token_usage: None,
            errors,
            data,
        }
    }

    /// Convert from the output type to a JSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize output")
    }

    /// Write a stream of outputs to a [`Path`] or to standard output.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        stream_opts: &StreamOpts,
    ) -> Result<()> {
        let (stream, counters) = WorkOutputCounters::wrap_stream(stream);
        let output = stream
            .map(|value| {
                let value = value?;
                value.to_json()
            })
            .boxed();
        write_output(path, output).await?;
        counters.finish(ui, stream_opts)
    }
}

/// Counters for a stream of [`WorkOutput`] records.
#[derive(Clone, Debug, Default)]
pub struct WorkOutputCounters {
    /// How many records did we process?
    pub total_record_count: usize,

    /// How many records did we fail to process?
    pub failure_count: usize,

    /// How many non-fatal errors did we encounter?
    pub non_fatal_error_count: usize,

    /// How many tokens did we use?
    pub token_usage: TokenUsage,
}

impl WorkOutputCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<WorkOutput<T>>>,
    ) -> (
        BoxedStream<Result<WorkOutput<T>>>,
        Arc<Mutex<WorkOutputCounters>>,
    )
    where
        T: Send + 'static,
    {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// Is our failure rate acceptable?
    fn check_failure_rate(&self, allowed_failure_rate: f32) -> Result<()> {
        if self.total_record_count == 0 {
            return Ok(());
        }
        let failure_rate = self.failure_count as f32 / self.total_record_count as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                self.failure_count,
                self.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}

/// We actually want to put methods in `Mutex<WorkOutputCounters>`, because
/// that's the type we actually work with. To do that, we need to define an
/// extension trait with the methods we want.
pub trait WorkItemCounterExt {
    /// Update counters for a work item.
    fn update<T>(&self, item: &WorkOutput<T>);

    /// Display counter values to the user.
    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()>;
}

impl WorkItemCounterExt for Mutex<WorkOutputCounters> {
    fn update<T>(&self, item: &WorkOutput<T>) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        if item.status != WorkStatus::Ok {
            counters.failure_count += 1;
        } else if !item.errors.is_empty() {
            counters.non_fatal_error_count += item.errors.len();
        }
        if let Some(token_usage) = &item.token_usage {
            counters.token_usage += token_usage.clone();
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        if !counters.token_usage.is_zero() {
            ui.display_message(
                "📈",
                &format!(
                    "{} input tokens and {} output tokens used",
                    counters.token_usage.prompt_tokens,
                    counters.token_usage.completion_tokens,
                ),
            );
        }
        counters.check_failure_rate(stream_opts.allowed_failure_rate)?;
        if counters.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} non-fatal errors encountered",
                    counters.non_fatal_error_count
                ),
            );
        }
        if counters.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} records could not be processed", counters.failure_count),
            );
        }
        Ok(())
    }
}

/// Work items are processed by [`WorkItemProcessor`]s. They contain an input,
/// and a one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    /// The input to the work item.
    pub input: WorkInput<InputData>,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<WorkOutput<OutputData>>>,
}

/// API shared by workers.
pub trait WorkItemProcessor {
    type InputData: 'static;
    type OutputData: 'static;

    /// Process a work item. The result will be sent to `item.tx`.
    ///
    /// This should only block if our processing capacity has been maxed out.
    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()>;

    /// Process an input and return a channel that will receive the output.
    async fn submit_input(
        &self,
        input: WorkInput<Self::InputData>,
    ) -> Result<oneshot::Receiver<Result<WorkOutput<Self::OutputData>>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        self.submit_work_item(item).await?;
        Ok(rx)
    }

    /// Process an input and wait for the output.
    async fn process_blocking(
        &self,
        input: WorkInput<Self::InputData>,
    ) -> Result<WorkOutput<Self::OutputData>> {
        let rx = self.submit_input(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// An async work function.
pub type WorkFn<InputData, OutputData> = Arc<
    dyn Fn(WorkInput<InputData>) -> BoxedFuture<Result<WorkOutput<OutputData>>>
        + Send
        + Sync
        + 'static,
>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`] that implements
/// [`WorkItemProcessor`]. It can be cloned cheaply and passed around.
pub struct WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueueHandle<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Process a stream of inputs, returning a stream of futures that will
    /// yield outputs. Use [`futures::StreamExt::buffered`] to resolve them
    /// in input order.
    ///
    /// The [`WorkQueue`] enforces its own concurrency limit regardless of how
    /// many futures are buffered.
    pub fn process_stream(
        &self,
        input: BoxedStream<Result<WorkInput<InputData>>>,
    ) -> BoxedStream<BoxedFuture<Result<WorkOutput<OutputData>>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move {
                    let input = input?;
                    handle.process_blocking(input).await
                }
                .boxed()
            })
            .boxed()
    }
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<InputData, OutputData> Clone for WorkQueueHandle<InputData, OutputData> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<InputData, OutputData> WorkItemProcessor for WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    type InputData = InputData;
    type OutputData = OutputData;

    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()> {
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// Maintains a queue of work items and processes them in parallel.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed. The background worker exits once
/// the queue and all its handles have been dropped.
pub struct WorkQueue<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueue<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Up to `concurrency_limit` items may be waiting at any one time, and
    /// another `concurrency_limit` may be in progress.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<InputData, OutputData>,
    ) -> Result<(Self, JoinWorker)> {
        if concurrency_limit == 0 {
            return Err(anyhow!("--jobs must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(
                concurrency_limit,
                |item: WorkItem<InputData, OutputData>| async {
                    let result = work_fn(item.input).await;
                    if let Err(_sent_value) = item.tx.send(result) {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                },
            )
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<InputData, OutputData> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use super::*;

    /// A queue which doubles numbers, and fails on negative ones.
    fn doubling_queue(
        concurrency_limit: usize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    ) -> (WorkQueue<i64, Value>, JoinWorker) {
        let work_fn = move |input: WorkInput<i64>| {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                // Later items finish first, to check that output order is kept.
                let delay = 20u64.saturating_sub(input.data.unsigned_abs() * 2);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if input.data < 0 {
                    Ok(WorkOutput::new_failed(
                        input.id,
                        vec!["negative".to_owned()],
                        Value::Null,
                    ))
                } else {
                    Ok(WorkOutput::new_ok(input.id, json!(input.data * 2)))
                }
            }
            .boxed()
        };
        WorkQueue::new(concurrency_limit, Arc::new(work_fn)).unwrap()
    }

    #[tokio::test]
    async fn test_process_stream_keeps_order_and_limits_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (queue, worker) = doubling_queue(2, in_flight, max_in_flight.clone());

        let inputs = (0..8)
            .map(|n| Ok(WorkInput { id: json!(n), data: n }))
            .collect::<Vec<Result<_>>>();
        let outputs = queue
            .handle()
            .process_stream(stream::iter(inputs).boxed())
            .buffered(8)
            .collect::<Vec<_>>()
            .await;
        drop(queue);
        worker.join().await.unwrap();

        let values = outputs
            .into_iter()
            .map(|output| output.unwrap().data)
            .collect::<Vec<_>>();
        assert_eq!(values, (0..8).map(|n| json!(n * 2)).collect::<Vec<_>>());
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_counters_and_failure_rate() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (queue, worker) = doubling_queue(4, in_flight, max_in_flight);

        let inputs = [1, -1, 2, 3]
            .into_iter()
            .map(|n| Ok(WorkInput { id: json!(n), data: n }))
            .collect::<Vec<Result<_>>>();
        let outputs = queue
            .handle()
            .process_stream(stream::iter(inputs).boxed())
            .buffered(4)
            .boxed();
        let (outputs, counters) = WorkOutputCounters::wrap_stream(outputs);
        let outputs = outputs.collect::<Vec<_>>().await;
        drop(queue);
        worker.join().await.unwrap();

        assert_eq!(outputs.len(), 4);
        let counters = counters.lock().unwrap().clone();
        assert_eq!(counters.total_record_count, 4);
        assert_eq!(counters.failure_count, 1);
        assert!(counters.check_failure_rate(0.25).is_ok());
        assert!(counters.check_failure_rate(0.01).is_err());
        assert!(WorkOutputCounters::default().check_failure_rate(0.0).is_ok());
    }

    #[test]
    fn test_output_json() {
        let mut output = WorkOutput::new_ok(json!("a"), json!({ "answer": 42 }));
        output.token_usage = Some(TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
        });
        assert_eq!(
            output.to_json().unwrap(),
            json!({
                "id": "a",
                "status": "ok",
                "token_usage": { "prompt_tokens": 3, "completion_tokens": 4 },
                "errors": [],
                "answer": 42,
            })
        );
    }

    #[test]
    fn test_zero_jobs_is_an_error() {
        let work_fn: WorkFn<i64, Value> =
            Arc::new(|input| async move { Ok(WorkOutput::new_ok(input.id, Value::Null)) }.boxed());
        assert!(WorkQueue::new(0, work_fn).is_err());
    }
}

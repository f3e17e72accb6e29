//! Book-cover detection as a work queue.

use std::sync::Arc;

use futures::FutureExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::JoinWorker,
    book_cover::{BookCoverDetection, clean_author_name, clean_book_title, detect_book_cover},
    prelude::*,
};

use super::work::{WorkInput, WorkOutput, WorkQueue};

/// An input record for `detect`.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct DetectInput {
    /// OCR text to classify.
    #[serde(default)]
    pub text: String,
}

/// An output record for `detect`.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct DetectOutput {
    #[serde(flatten)]
    pub detection: BookCoverDetection,

    /// `title`, cleaned up for searching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_title: Option<String>,

    /// `author`, cleaned up for searching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_author: Option<String>,
}

impl DetectOutput {
    /// Detect a book cover in `text`, and clean up what we find.
    pub fn from_text(text: &str) -> Self {
        let detection = detect_book_cover(text);
        let clean_title = detection
            .title
            .as_deref()
            .map(clean_book_title)
            .filter(|title| !title.is_empty());
        let clean_author = detection
            .author
            .as_deref()
            .map(clean_author_name)
            .filter(|author| !author.is_empty());
        Self {
            detection,
            clean_title,
            clean_author,
        }
    }
}

/// Make a [`WorkQueue`] that runs book-cover detection.
pub fn create_detect_work_queue(
    concurrency_limit: usize,
) -> Result<(WorkQueue<DetectInput, DetectOutput>, JoinWorker)> {
    let work_fn = |input: WorkInput<DetectInput>| {
        async move {
            trace!(id = %input.id, "Detecting book cover");
            Ok(WorkOutput::new_ok(
                input.id,
                DetectOutput::from_text(&input.data.text),
            ))
        }
        .boxed()
    };
    WorkQueue::new(concurrency_limit, Arc::new(work_fn))
}

#[cfg(test)]
mod tests {
    use crate::queues::work::{WorkItemProcessor as _, WorkStatus};

    use super::*;

    #[test]
    fn test_from_text_cleans_title_and_author() {
        let output =
            DetectOutput::from_text("\"The Left Hand of  Darkness\"\nby Ursula K. Le Guin");
        assert!(output.detection.is_book_cover);
        assert_eq!(
            output.detection.title.as_deref(),
            Some("\"The Left Hand of  Darkness\"")
        );
        assert_eq!(output.clean_title.as_deref(), Some("The Left Hand of Darkness"));
        assert_eq!(output.clean_author.as_deref(), Some("Ursula K. Le Guin"));
    }

    #[tokio::test]
    async fn test_detect_queue() {
        let (queue, worker) = create_detect_work_queue(2).unwrap();
        let output = queue
            .handle()
            .process_blocking(WorkInput {
                id: json!("cover-1"),
                data: DetectInput {
                    text: "THE GREAT GATSBY\nby F. Scott Fitzgerald\nA Novel".to_owned(),
                },
            })
            .await
            .unwrap();
        drop(queue);
        worker.join().await.unwrap();

        assert_eq!(output.status, WorkStatus::Ok);
        let json = output.to_json().unwrap();
        assert_eq!(json["id"], "cover-1");
        assert_eq!(json["is_book_cover"], true);
        assert_eq!(json["title"], "THE GREAT GATSBY");
        assert_eq!(json["clean_author"], "F. Scott Fitzgerald");
        assert_eq!(json["confidence"], 1.0);
    }
}

//! Book searches as a work queue.

use std::sync::Arc;

use futures::FutureExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::JoinWorker,
    book_cover::{clean_author_name, clean_book_title},
    books::{BookInfo, BookSearchClient},
    prelude::*,
    retry::error_to_string,
};

use super::work::{WorkInput, WorkOutput, WorkQueue};

/// An input record for `search`.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct SearchInput {
    /// The book title. Quotes and extra whitespace are cleaned up.
    #[serde(default)]
    pub title: String,

    /// The author, if known.
    #[serde(default)]
    pub author: Option<String>,
}

/// An output record for `search`. If the search succeeded but `book` is
/// missing, nothing matched.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct SearchOutput {
    /// The query we sent to Google Books.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,

    /// The most relevant book.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<BookInfo>,

    /// A text snippet from the search results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_content: Option<String>,
}

/// Make a [`WorkQueue`] that searches for books.
pub fn create_search_work_queue(
    concurrency_limit: usize,
    client: Arc<BookSearchClient>,
) -> Result<(WorkQueue<SearchInput, SearchOutput>, JoinWorker)> {
    let work_fn = move |input| {
        let client = client.clone();
        run_search(client, input).boxed()
    };
    WorkQueue::new(concurrency_limit, Arc::new(work_fn))
}

/// Search for a single book.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn run_search(
    client: Arc<BookSearchClient>,
    input: WorkInput<SearchInput>,
) -> Result<WorkOutput<SearchOutput>> {
    let title = clean_book_title(&input.data.title);
    let author = input
        .data
        .author
        .as_deref()
        .map(clean_author_name)
        .filter(|author| !author.is_empty());

    match client.search(&title, author.as_deref()).await {
        Ok(retried) => {
            let search = retried.value;
            let (book, additional_content) = match search.found {
                Some(found) => (Some(found.book), found.additional_content),
                None => (None, None),
            };
            let mut output = WorkOutput::new_ok(
                input.id,
                SearchOutput {
                    search_query: Some(search.search_query),
                    book,
                    additional_content,
                },
            );
            output.errors = retried.retry_errors;
            Ok(output)
        }
        Err(err) => {
            warn!("Book search failed: {:#}", err);
            Ok(WorkOutput::new_failed(
                input.id,
                vec![error_to_string(&err)],
                SearchOutput::default(),
            ))
        }
    }
}

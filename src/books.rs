//! Looking up books in the Google Books API.
//!
//! When a photo looks like a book cover, the cover itself rarely has enough
//! text to summarize. So we look the book up, and summarize its published
//! description instead.

use std::time::Duration;

use clap::Args;
use leaky_bucket::RateLimiter;
use schemars::JsonSchema;

use crate::{
    prelude::*,
    rate_limit::RateLimit,
    retry::{Retried, retry_result_ok, retry_with_backoff, try_fatal, try_potentially_transient},
};

/// How many results to ask for. We only use the first, but asking for a few
/// seems to improve Google's relevance ranking.
const MAX_RESULTS: &str = "5";

/// Options for talking to the Google Books API.
#[derive(Args, Clone, Debug)]
pub struct BooksOpts {
    /// Base URL of the Google Books API.
    #[clap(
        long,
        env = "GOOGLE_BOOKS_API_BASE",
        default_value = "https://www.googleapis.com/books/v1"
    )]
    pub books_api_base: String,

    /// Google Books API key. Optional, but anonymous requests get a small
    /// quota.
    #[clap(long, env = "GOOGLE_BOOKS_API_KEY", hide_env_values = true)]
    pub books_api_key: Option<String>,

    /// A rate limit for book searches, like "1/s" or "100/m".
    #[clap(long)]
    pub books_rate_limit: Option<RateLimit>,
}

/// Build a Google Books query for a title and optional author.
pub fn build_search_query(title: &str, author: Option<&str>) -> String {
    let mut query = format!("intitle:\"{}\"", title);
    if let Some(author) = author.filter(|author| !author.is_empty()) {
        query.push_str(&format!(" inauthor:\"{}\"", author));
    }
    query
}

/// The parts of a `GET /volumes` response that we use.
#[derive(Debug, Deserialize)]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    #[serde(default)]
    id: String,
    #[serde(default)]
    volume_info: VolumeInfo,
    search_info: Option<SearchInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    title: Option<String>,
    authors: Option<Vec<String>>,
    published_date: Option<String>,
    publisher: Option<String>,
    description: Option<String>,
    page_count: Option<u32>,
    categories: Option<Vec<String>>,
    average_rating: Option<f64>,
    ratings_count: Option<u64>,
    image_links: Option<ImageLinks>,
    preview_link: Option<String>,
    info_link: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageLinks {
    thumbnail: Option<String>,
    small_thumbnail: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchInfo {
    text_snippet: Option<String>,
}

/// Information about a book, with placeholders for anything Google didn't
/// know.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct BookInfo {
    /// Google Books volume ID.
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub published_date: String,
    pub publisher: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub categories: Vec<String>,
    /// Average rating out of 5.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratings_count: Option<u64>,
    /// Cover image URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_link: Option<String>,
    pub language: String,
}

/// Treat empty strings and lists like missing ones.
fn non_empty<T: IsEmpty>(value: Option<T>) -> Option<T> {
    value.filter(|value| !value.is_empty())
}

trait IsEmpty {
    fn is_empty(&self) -> bool;
}

impl IsEmpty for String {
    fn is_empty(&self) -> bool {
        self.trim().is_empty()
    }
}

impl<T> IsEmpty for Vec<T> {
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

impl From<Volume> for BookInfo {
    fn from(volume: Volume) -> Self {
        let info = volume.volume_info;
        let (thumbnail, small_thumbnail) = match info.image_links {
            Some(links) => (links.thumbnail, links.small_thumbnail),
            None => (None, None),
        };
        BookInfo {
            id: volume.id,
            title: non_empty(info.title).unwrap_or_else(|| "Unknown Title".to_owned()),
            authors: non_empty(info.authors)
                .unwrap_or_else(|| vec!["Unknown Author".to_owned()]),
            published_date: non_empty(info.published_date)
                .unwrap_or_else(|| "Unknown".to_owned()),
            publisher: non_empty(info.publisher)
                .unwrap_or_else(|| "Unknown Publisher".to_owned()),
            description: non_empty(info.description)
                .unwrap_or_else(|| "No description available".to_owned()),
            page_count: info.page_count.filter(|&count| count > 0),
            categories: non_empty(info.categories)
                .unwrap_or_else(|| vec!["General".to_owned()]),
            average_rating: info.average_rating.filter(|&rating| rating > 0.0),
            ratings_count: info.ratings_count,
            thumbnail: non_empty(thumbnail).or(non_empty(small_thumbnail)),
            preview_link: non_empty(info.preview_link),
            info_link: non_empty(info.info_link),
            language: non_empty(info.language).unwrap_or_else(|| "en".to_owned()),
        }
    }
}

/// A successful book search.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct BookMatch {
    /// The most relevant book.
    pub book: BookInfo,

    /// A text snippet from the search results, if Google had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_content: Option<String>,
}

impl BookMatch {
    /// A plain-text digest of everything we know about the book, for
    /// summarizing.
    pub fn to_summary_text(&self) -> String {
        let book = &self.book;
        let mut text = format!(
            "Book Title: {}\nAuthor: {}\nPublished: {} by {}\n\nDescription: {}\n\n",
            book.title,
            book.authors.join(", "),
            book.published_date,
            book.publisher,
            book.description,
        );
        if let Some(additional_content) = &self.additional_content {
            text.push_str(additional_content.trim());
            text.push_str("\n\n");
        }
        text.push_str(&format!("Categories: {}\n", book.categories.join(", ")));
        match book.page_count {
            Some(page_count) => text.push_str(&format!("Page Count: {}", page_count)),
            None => text.push_str("Page Count: Unknown"),
        }
        if let Some(rating) = book.average_rating {
            text.push_str(&format!(
                "\nRating: {}/5 ({} reviews)",
                rating,
                book.ratings_count.unwrap_or(0)
            ));
        }
        text
    }
}

/// The result of [`BookSearchClient::search`].
#[derive(Debug)]
pub struct BookSearch {
    /// The query we tried first.
    pub search_query: String,

    /// The book we found, if any.
    pub found: Option<BookMatch>,
}

/// A Google Books API client.
#[derive(Debug)]
pub struct BookSearchClient {
    http: reqwest::Client,
    volumes_url: String,
    api_key: Option<String>,
    rate_limiter: Option<RateLimiter>,
}

impl BookSearchClient {
    /// Create a new client.
    pub fn new(opts: &BooksOpts) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            volumes_url: format!("{}/volumes", opts.books_api_base.trim_end_matches('/')),
            api_key: opts.books_api_key.clone().filter(|key| !key.is_empty()),
            rate_limiter: opts.books_rate_limit.as_ref().map(RateLimit::to_rate_limiter),
        })
    }

    /// Search for a book by title and author.
    ///
    /// If nothing matches both, we try again with just the title, as a plain
    /// search. Not finding anything is not an error.
    #[instrument(level = "debug", skip(self))]
    pub async fn search(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<Retried<BookSearch>> {
        let title = title.trim();
        if title.is_empty() {
            return Err(anyhow!("book title is required"));
        }
        let search_query = build_search_query(title, author);

        let mut retry_errors = vec![];
        let mut response = self.query_volumes(&search_query).await?;
        retry_errors.append(&mut response.retry_errors);
        if response.value.items.is_empty() {
            debug!(%search_query, "No results, trying a broader search");
            response = self.query_volumes(title).await?;
            retry_errors.append(&mut response.retry_errors);
        }

        let found = response.value.items.into_iter().next().map(|volume| {
            let additional_content = volume
                .search_info
                .as_ref()
                .and_then(|info| non_empty(info.text_snippet.clone()));
            BookMatch {
                book: BookInfo::from(volume),
                additional_content,
            }
        });
        match &found {
            Some(found) => info!(
                title = %found.book.title,
                authors = %found.book.authors.join(", "),
                "Found book"
            ),
            None => info!(%search_query, "Book not found"),
        }
        Ok(Retried {
            value: BookSearch {
                search_query,
                found,
            },
            retry_errors,
        })
    }

    /// Run a single `GET /volumes` query, with retries.
    async fn query_volumes(&self, query: &str) -> Result<Retried<VolumesResponse>> {
        retry_with_backoff(|| async {
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.acquire_one().await;
            }
            let mut params = vec![
                ("q", query),
                ("maxResults", MAX_RESULTS),
                ("orderBy", "relevance"),
            ];
            if let Some(api_key) = &self.api_key {
                params.push(("key", api_key.as_str()));
            }
            let response = try_potentially_transient!(
                self.http.get(&self.volumes_url).query(&params).send().await
            );
            let response = try_potentially_transient!(response.error_for_status());
            let volumes = try_fatal!(
                response
                    .json::<VolumesResponse>()
                    .await
                    .context("Failed to parse Google Books response")
            );
            retry_result_ok(volumes)
        })
        .await
        .with_context(|| format!("Google Books search failed for {:?}", query))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn test_build_search_query() {
        assert_eq!(build_search_query("Dune", None), "intitle:\"Dune\"");
        assert_eq!(
            build_search_query("Dune", Some("Frank Herbert")),
            "intitle:\"Dune\" inauthor:\"Frank Herbert\""
        );
        assert_eq!(build_search_query("Dune", Some("")), "intitle:\"Dune\"");
    }

    fn volume(value: Value) -> Volume {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_book_info_defaults() {
        let book = BookInfo::from(volume(json!({ "id": "abc" })));
        assert_eq!(
            book,
            BookInfo {
                id: "abc".to_owned(),
                title: "Unknown Title".to_owned(),
                authors: vec!["Unknown Author".to_owned()],
                published_date: "Unknown".to_owned(),
                publisher: "Unknown Publisher".to_owned(),
                description: "No description available".to_owned(),
                page_count: None,
                categories: vec!["General".to_owned()],
                average_rating: None,
                ratings_count: None,
                thumbnail: None,
                preview_link: None,
                info_link: None,
                language: "en".to_owned(),
            }
        );
    }

    #[test]
    fn test_book_info_from_volume() {
        let book = BookInfo::from(volume(json!({
            "id": "B1",
            "volumeInfo": {
                "title": "Dune",
                "authors": ["Frank Herbert"],
                "publishedDate": "1965",
                "publisher": "Chilton Books",
                "description": "Desert planet.",
                "pageCount": 412,
                "categories": ["Fiction"],
                "averageRating": 4.5,
                "ratingsCount": 120,
                "imageLinks": { "smallThumbnail": "http://example.com/small.jpg" },
                "infoLink": "http://example.com/info",
                "language": "en"
            },
            "searchInfo": { "textSnippet": "A classic." }
        })));
        assert_eq!(book.title, "Dune");
        assert_eq!(book.authors, vec!["Frank Herbert"]);
        assert_eq!(book.page_count, Some(412));
        assert_eq!(book.average_rating, Some(4.5));
        assert_eq!(book.thumbnail.as_deref(), Some("http://example.com/small.jpg"));
        assert_eq!(book.preview_link, None);
    }

    fn dune_match() -> BookMatch {
        BookMatch {
            book: BookInfo {
                id: "B1".to_owned(),
                title: "Dune".to_owned(),
                authors: vec!["Frank Herbert".to_owned(), "Someone Else".to_owned()],
                published_date: "1965".to_owned(),
                publisher: "Chilton Books".to_owned(),
                description: "Desert planet.".to_owned(),
                page_count: Some(412),
                categories: vec!["Fiction".to_owned()],
                average_rating: Some(4.5),
                ratings_count: Some(120),
                thumbnail: None,
                preview_link: None,
                info_link: None,
                language: "en".to_owned(),
            },
            additional_content: Some("A classic.".to_owned()),
        }
    }

    #[test]
    fn test_to_summary_text() {
        assert_eq!(
            dune_match().to_summary_text(),
            "Book Title: Dune\n\
             Author: Frank Herbert, Someone Else\n\
             Published: 1965 by Chilton Books\n\
             \n\
             Description: Desert planet.\n\
             \n\
             A classic.\n\
             \n\
             Categories: Fiction\n\
             Page Count: 412\n\
             Rating: 4.5/5 (120 reviews)"
        );

        let mut book_match = dune_match();
        book_match.additional_content = None;
        book_match.book.average_rating = None;
        book_match.book.page_count = None;
        let text = book_match.to_summary_text();
        assert!(text.contains("Description: Desert planet.\n\nCategories: Fiction\n"));
        assert!(text.ends_with("Page Count: Unknown"));
        assert!(!text.contains("Rating"));
    }

    /// A tiny HTTP server which answers requests with canned JSON bodies, in
    /// order, and remembers the request lines it saw.
    pub(crate) async fn fake_books_api(bodies: Vec<Value>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(vec![]));
        let seen = requests.clone();
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0; 8192];
                let mut len = 0;
                while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf[len..]).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    len += n;
                }
                let request = String::from_utf8_lossy(&buf[..len]);
                let request_line = request.lines().next().unwrap_or_default().to_owned();
                seen.lock().unwrap().push(request_line);
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{}", addr), requests)
    }

    fn client_for(api_base: String) -> BookSearchClient {
        BookSearchClient::new(&BooksOpts {
            books_api_base: api_base,
            books_api_key: Some("KEY".to_owned()),
            books_rate_limit: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_falls_back_to_title() {
        let (api_base, requests) = fake_books_api(vec![
            json!({ "totalItems": 0 }),
            json!({ "items": [{ "id": "B1", "volumeInfo": { "title": "Dune" } }] }),
        ])
        .await;
        let search = client_for(api_base)
            .search("Dune", Some("Frank Herbert"))
            .await
            .unwrap()
            .value;
        assert_eq!(search.search_query, "intitle:\"Dune\" inauthor:\"Frank Herbert\"");
        assert_eq!(search.found.unwrap().book.title, "Dune");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("GET /volumes?q=intitle%3A%22Dune%22"));
        assert!(requests[0].contains("maxResults=5"));
        assert!(requests[0].contains("orderBy=relevance"));
        assert!(requests[0].contains("key=KEY"));
        assert!(requests[1].starts_with("GET /volumes?q=Dune&"));
    }

    #[tokio::test]
    async fn test_search_not_found() {
        let (api_base, _requests) =
            fake_books_api(vec![json!({ "totalItems": 0 }), json!({ "items": [] })]).await;
        let search = client_for(api_base).search("Nothing", None).await.unwrap();
        assert!(search.value.found.is_none());
    }

    #[tokio::test]
    async fn test_search_requires_title() {
        let client = client_for("http://127.0.0.1:9".to_owned());
        let err = client.search("   ", None).await.unwrap_err();
        assert!(err.to_string().contains("book title is required"));
    }
}

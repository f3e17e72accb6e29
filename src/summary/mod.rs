//! Summaries and key takeaways, written by an LLM.

use std::{fmt, sync::LazyLock};

use clap::ValueEnum;
use regex::Regex;
use schemars::JsonSchema;

use crate::{
    async_utils::io::JsonObject,
    drivers::{LlmClient, LlmOpts, TokenUsage},
    prelude::*,
    prompt::ChatPrompt,
    retry::Retried,
};

/// Anything shorter than this isn't worth summarizing.
pub const MIN_TEXT_CHARS: usize = 50;

/// Longer inputs are truncated, to keep costs and latency reasonable.
const MAX_TEXT_CHARS: usize = 8000;

/// Default sampling temperature.
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Placeholder used when we can't find takeaways in a response.
const NO_TAKEAWAYS: &str = "Unable to extract specific takeaways from this content.";

const STANDARD_PROMPT: &str = include_str!("standard_prompt.toml");
const ACADEMIC_PROMPT: &str = include_str!("academic_prompt.toml");

/// Splits a response on its takeaways heading, when the model didn't use
/// `## ` headings.
static TAKEAWAYS_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:10 key takeaways|key takeaways|takeaways):?")
        .expect("invalid TAKEAWAYS_HEADING regex")
});

static SUMMARY_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)summary:?").expect("invalid SUMMARY_LABEL regex")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("invalid WHITESPACE regex"));

/// What kind of summary do we want?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum SummaryMode {
    /// Simple, engaging language for a general audience.
    #[default]
    Standard,

    /// A longer, scholarly analysis, with academic context.
    Academic,
}

impl SummaryMode {
    /// Default completion token limit for this mode.
    fn default_max_completion_tokens(self) -> u32 {
        match self {
            SummaryMode::Standard => 2200,
            SummaryMode::Academic => 3000,
        }
    }

    /// Our built-in prompt for this mode.
    fn default_prompt(self) -> ChatPrompt {
        let toml_str = match self {
            SummaryMode::Standard => STANDARD_PROMPT,
            SummaryMode::Academic => ACADEMIC_PROMPT,
        };
        ChatPrompt::from_toml_str(toml_str).expect("built-in summary prompt should parse")
    }
}

impl fmt::Display for SummaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryMode::Standard => write!(f, "standard"),
            SummaryMode::Academic => write!(f, "academic"),
        }
    }
}

/// Tidy up text before we send it to the LLM.
///
/// Returns an error if there isn't enough text to summarize.
pub fn preprocess_text(text: &str) -> Result<String> {
    let text = text.trim();
    if text.chars().count() < MIN_TEXT_CHARS {
        return Err(anyhow!(
            "text must be at least {} characters long",
            MIN_TEXT_CHARS
        ));
    }
    let mut text = WHITESPACE.replace_all(text, " ").into_owned();
    if text.chars().count() > MAX_TEXT_CHARS {
        text = text.chars().take(MAX_TEXT_CHARS).collect();
        text.push_str("...");
    }
    Ok(text)
}

/// Count whitespace-separated words.
fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Word counts for a [`Summary`].
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct WordCount {
    pub summary: usize,
    pub takeaways: usize,
    /// Words in the preprocessed input text.
    pub original: usize,
}

/// A summary, as returned to the user.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct Summary {
    pub mode: SummaryMode,
    pub summary: String,
    /// Key takeaways, normally as a numbered Markdown list.
    pub takeaways: String,
    /// How the text fits into its field. Academic mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub academic_context: Option<String>,
    pub word_count: WordCount,
}

/// The sections we found in an LLM response.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedResponse {
    pub summary: String,
    pub takeaways: String,
    pub academic_context: Option<String>,
}

/// Pull the sections out of an LLM response. Models don't always follow our
/// requested format, so this never fails.
pub fn parse_summary_response(content: &str) -> ParsedResponse {
    let content = content.trim();
    let mut parsed = ParsedResponse::default();
    for section in content.split("## ") {
        let section = section.trim();
        if let Some(rest) = section.strip_prefix("SUMMARY") {
            parsed.summary = rest.trim().to_owned();
        } else if let Some(rest) = section.strip_prefix("10 KEY TAKEAWAYS") {
            parsed.takeaways = rest.trim().to_owned();
        } else if let Some(rest) = section.strip_prefix("ACADEMIC CONTEXT") {
            let rest = rest.trim();
            if !rest.is_empty() {
                parsed.academic_context = Some(rest.to_owned());
            }
        }
    }

    if parsed.summary.is_empty() || parsed.takeaways.is_empty() {
        // Takeaways stop at the next heading match, if there is one.
        let parts = TAKEAWAYS_HEADING.split(content).collect::<Vec<_>>();
        if let [summary, takeaways, ..] = parts.as_slice() {
            parsed.summary = SUMMARY_LABEL.replace(summary, "").trim().to_owned();
            parsed.takeaways = takeaways.trim().to_owned();
        } else {
            parsed.summary = content.to_owned();
            parsed.takeaways = NO_TAKEAWAYS.to_owned();
        }
    }
    parsed
}

/// A [`Summary`] and what it cost us.
#[derive(Debug)]
pub struct Summarized {
    pub summary: Summary,
    pub token_usage: Option<TokenUsage>,
}

/// Summarizes text using an LLM.
#[derive(Debug)]
pub struct Summarizer {
    llm: LlmClient,
    llm_opts: LlmOpts,
    /// A user-supplied prompt, used for every mode.
    prompt_override: Option<ChatPrompt>,
    standard_prompt: ChatPrompt,
    academic_prompt: ChatPrompt,
}

impl Summarizer {
    /// Create a new summarizer.
    pub fn new(
        model: String,
        llm_opts: LlmOpts,
        prompt_override: Option<ChatPrompt>,
    ) -> Result<Self> {
        Ok(Self {
            llm: LlmClient::new(model, llm_opts.clone())?,
            llm_opts,
            prompt_override,
            standard_prompt: SummaryMode::Standard.default_prompt(),
            academic_prompt: SummaryMode::Academic.default_prompt(),
        })
    }

    fn prompt_for(&self, mode: SummaryMode) -> &ChatPrompt {
        match (&self.prompt_override, mode) {
            (Some(prompt), _) => prompt,
            (None, SummaryMode::Standard) => &self.standard_prompt,
            (None, SummaryMode::Academic) => &self.academic_prompt,
        }
    }

    /// Summarize `text`.
    #[instrument(level = "debug", skip(self, text), fields(model = %self.llm.model()))]
    pub async fn summarize(
        &self,
        text: &str,
        mode: SummaryMode,
    ) -> Result<Retried<Summarized>> {
        let text = preprocess_text(text)?;

        let mut bindings = JsonObject::new();
        bindings.insert("text".to_owned(), Value::String(text.clone()));
        let prompt = self.prompt_for(mode).render(&bindings)?;

        let llm_opts = self
            .llm_opts
            .with_defaults(mode.default_max_completion_tokens(), DEFAULT_TEMPERATURE);
        let response = self.llm.chat(&prompt, Some(&llm_opts)).await?;
        let content = response.value.text.trim();
        if content.is_empty() {
            return Err(anyhow!("LLM returned an empty summary"));
        }

        let parsed = parse_summary_response(content);
        let word_count = WordCount {
            summary: count_words(&parsed.summary),
            takeaways: count_words(&parsed.takeaways),
            original: count_words(&text),
        };
        Ok(Retried {
            value: Summarized {
                summary: Summary {
                    mode,
                    summary: parsed.summary,
                    takeaways: parsed.takeaways,
                    academic_context: parsed.academic_context,
                    word_count,
                },
                token_usage: response.value.token_usage,
            },
            retry_errors: response.retry_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::drivers::DriverType;

    use super::*;

    const LONG_TEXT: &str = "Artificial intelligence systems can analyze vast amounts of data, \
        recognize patterns, and make decisions with minimal human intervention.";

    #[test]
    fn test_preprocess_text() {
        assert_eq!(
            preprocess_text(&format!("  {}\n\n\t  more   words ", LONG_TEXT)).unwrap(),
            format!("{} more words", LONG_TEXT)
        );
        assert!(preprocess_text("Too short.").is_err());
        assert!(preprocess_text(&format!("{:60}", "x")).is_err());
    }

    #[test]
    fn test_preprocess_text_truncates() {
        let text = "word ".repeat(3000);
        let processed = preprocess_text(&text).unwrap();
        assert_eq!(processed.chars().count(), MAX_TEXT_CHARS + 3);
        assert!(processed.ends_with("..."));
    }

    #[test]
    fn test_built_in_prompts_parse() {
        let mut bindings = JsonObject::new();
        bindings.insert("text".to_owned(), json!("Hello"));
        for mode in [SummaryMode::Standard, SummaryMode::Academic] {
            let prompt = mode.default_prompt().render(&bindings).unwrap();
            assert!(prompt.last_user_text().unwrap().contains("\nHello\n"));
        }
    }

    #[test]
    fn test_parse_sections() {
        let parsed = parse_summary_response(
            "## SUMMARY\nA short book.\n\n## 10 KEY TAKEAWAYS\n1. One\n2. Two\n\n## ACADEMIC CONTEXT\nModernism.",
        );
        assert_eq!(
            parsed,
            ParsedResponse {
                summary: "A short book.".to_owned(),
                takeaways: "1. One\n2. Two".to_owned(),
                academic_context: Some("Modernism.".to_owned()),
            }
        );
    }

    #[test]
    fn test_parse_fallback_split() {
        let parsed =
            parse_summary_response("Summary: It was good.\n\nKey Takeaways:\n1. Read it.");
        assert_eq!(parsed.summary, "It was good.");
        assert_eq!(parsed.takeaways, "1. Read it.");
        assert_eq!(parsed.academic_context, None);
    }

    #[test]
    fn test_parse_fallback_takeaways_end_at_next_heading() {
        let parsed = parse_summary_response(
            "In short: it was good.\nTakeaways: 1. Read it.\nMore takeaways: 2. Again.",
        );
        assert_eq!(parsed.summary, "In short: it was good.");
        assert_eq!(parsed.takeaways, "1. Read it.\nMore");
    }

    #[test]
    fn test_parse_unstructured() {
        let parsed = parse_summary_response("  Just a paragraph.  ");
        assert_eq!(parsed.summary, "Just a paragraph.");
        assert_eq!(parsed.takeaways, NO_TAKEAWAYS);
    }

    #[tokio::test]
    async fn test_summarize_with_echo_driver() {
        let llm_opts = LlmOpts {
            driver: DriverType::Echo,
            ..LlmOpts::default()
        };
        let summarizer = Summarizer::new("echo".to_owned(), llm_opts, None).unwrap();

        let summarized = summarizer
            .summarize(LONG_TEXT, SummaryMode::Academic)
            .await
            .unwrap()
            .value;
        let summary = summarized.summary;
        assert_eq!(summary.mode, SummaryMode::Academic);
        assert!(summary.summary.starts_with("[Write a thorough academic summary"));
        assert!(summary.takeaways.starts_with("[Extract exactly 10 key takeaways."));
        assert!(summary.academic_context.is_some());
        assert_eq!(summary.word_count.original, count_words(LONG_TEXT));
        assert_eq!(summarized.token_usage, None);

        let err = summarizer
            .summarize("short", SummaryMode::Standard)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least 50 characters"));
    }
}

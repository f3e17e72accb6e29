//! Book-cover detection for OCR output.
//!
//! A photo of a book cover produces a handful of short, prominent lines (a
//! title, an author, maybe a tagline or a publisher), while a photo of a page
//! produces long lines of running prose. [`detect_book_cover`] scores a block
//! of OCR text on lexical and structural signals, and picks out a title and an
//! author suitable for a bibliographic search.
//!
//! The weights and the threshold below were tuned by hand against real OCR
//! output. Changing them silently changes which photos get looked up as books.

use std::{cmp::Reverse, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

/// Texts scoring strictly above this are classified as book covers.
pub const BOOK_COVER_THRESHOLD: f64 = 0.2;

/// Added once for each indicator category found anywhere in the text.
const INDICATOR_WEIGHT: f64 = 0.15;

/// Added when we find a title candidate.
const TITLE_WEIGHT: f64 = 0.2;

/// Added when a line looks like "by Jane Doe" or "Jane Doe, Author".
const EXPLICIT_AUTHOR_WEIGHT: f64 = 0.25;

/// Added when no explicit author line exists, but a line is shaped like a
/// personal name.
const NAME_SHAPED_AUTHOR_WEIGHT: f64 = 0.15;

/// Added when we have both a title and an author.
const TITLE_AND_AUTHOR_WEIGHT: f64 = 0.2;

/// Added when the number of significant lines is in [`FEW_LINES_RANGE`].
const FEW_LINES_WEIGHT: f64 = 0.1;

/// Covers have a few short lines. Pages of prose have many long ones.
const FEW_LINES_RANGE: std::ops::RangeInclusive<usize> = 2..=8;

/// Significant lines must be strictly longer than this, in characters.
const MIN_SIGNIFICANT_LINE_LEN: usize = 3;

/// Significant lines must be strictly shorter than this, in characters.
const MAX_SIGNIFICANT_LINE_LEN: usize = 100;

/// Title candidates must be strictly longer than this, in characters.
const MIN_TITLE_LEN: usize = 5;

/// Lexical indicators of book covers and publishing. Each regex is one
/// category, and counts at most once per text.
static BOOK_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Genres and forms.
        r"\b(novel|story|tales?|memoir|biography|autobiography)\b",
        // Cover blurbs.
        r"\b(bestseller|award.?winning|new york times)\b",
        // Shelf categories.
        r"\b(fiction|non.?fiction|mystery|romance|thriller|fantasy|sci-fi|science fiction)\b",
        // Attribution.
        r"\b(author|writer|by)\s+[A-Za-z\s]+",
        // Publishing.
        r"\b(book|volume|edition|published|publisher|press)\b",
        // Front and back matter.
        r"\b(isbn|copyright|©)\b",
        // Structure.
        r"\b(chapter|page)\b",
        // Prices.
        r"\$([0-9]+\.)?[0-9]+",
        // Bare ISBN-10 or ISBN-13.
        r"[0-9]{10,13}",
    ]
    .into_iter()
    // Word boundaries are ASCII-only, so "novelística" still contains "novel".
    .map(|re| re.replace(r"\b", r"(?-u:\b)"))
    .map(|re| Regex::new(&format!("(?i){re}")).expect("invalid book indicator regex"))
    .collect()
});

/// Explicit author lines. The first capture group is the author.
static EXPLICIT_AUTHOR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"(?i)^by\s+(.+)$", r"(?i)^(.+)\s+(author|writer)$"]
        .into_iter()
        .map(|re| Regex::new(re).expect("invalid author regex"))
        .collect()
});

/// "Jane Doe" or "Jane Mary Doe".
static NAME_SHAPED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][a-z]+\s+[A-Z][a-z]+(\s+[A-Z][a-z]+)?$")
        .expect("invalid name regex")
});

/// "THE GREAT GATSBY".
static ALL_CAPS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z\s]+$").expect("invalid all-caps regex"));

/// "Dune", "Moby dick". Only the first letter may be upper case.
static CAPITALIZED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-z\s]*$").expect("invalid capitalized regex"));

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\x{FEFF}]+").expect("invalid whitespace regex"));

static TITLE_QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^["']|["']$"#).expect("invalid quote regex"));

static AUTHOR_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(by\s+|author:?\s*)").expect("invalid author prefix regex")
});

static AUTHOR_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(author|writer)$").expect("invalid author suffix regex")
});

static AUTHOR_DISALLOWED_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9_\s.-]").expect("invalid author character regex")
});

/// How book-cover-like a block of text looks.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct BookCoverDetection {
    /// Does this text look like a book cover?
    pub is_book_cover: bool,

    /// Our best guess at the title, taken from `extracted_lines`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Our best guess at the author, taken from `extracted_lines`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Heuristic score between 0.0 and 1.0.
    pub confidence: f64,

    /// The significant lines we considered, in their original order.
    pub extracted_lines: Vec<String>,
}

/// Classify `text` as a book cover or not, and extract a title and author.
///
/// This never fails. Empty or garbage input simply gets a low score.
pub fn detect_book_cover(text: &str) -> BookCoverDetection {
    let extracted_lines = significant_lines(text);

    let mut confidence = score_indicators(text);

    let title = pick_title(&extracted_lines);
    if title.is_some() {
        confidence += TITLE_WEIGHT;
    }

    let author = match pick_explicit_author(&extracted_lines) {
        Some(author) => {
            confidence += EXPLICIT_AUTHOR_WEIGHT;
            Some(author)
        }
        None => {
            let author = pick_name_shaped_author(&extracted_lines);
            if author.is_some() {
                confidence += NAME_SHAPED_AUTHOR_WEIGHT;
            }
            author
        }
    };

    if title.is_some() && author.is_some() {
        confidence += TITLE_AND_AUTHOR_WEIGHT;
    }
    if FEW_LINES_RANGE.contains(&extracted_lines.len()) {
        confidence += FEW_LINES_WEIGHT;
    }

    let confidence = confidence.clamp(0.0, 1.0);
    BookCoverDetection {
        is_book_cover: confidence > BOOK_COVER_THRESHOLD,
        title: title.map(str::to_owned),
        author: author.map(str::to_owned),
        confidence,
        extracted_lines,
    }
}

/// Whitespace, plus the byte-order mark some OCR tools put at the start.
fn is_blank(c: char) -> bool {
    c.is_whitespace() || c == '\u{feff}'
}

/// Trimmed, non-empty lines of a plausible length which contain letters.
fn significant_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.trim_matches(is_blank))
        .filter(|line| {
            let len = line.chars().count();
            len > MIN_SIGNIFICANT_LINE_LEN
                && len < MAX_SIGNIFICANT_LINE_LEN
                && !line.chars().all(|c| c.is_ascii_digit())
                && line.chars().any(|c| c.is_ascii_alphabetic())
        })
        .map(str::to_owned)
        .collect()
}

/// Score the lexical indicators, counting each category at most once.
fn score_indicators(text: &str) -> f64 {
    let text = text.to_lowercase();
    let matched = BOOK_INDICATORS
        .iter()
        .filter(|re| re.is_match(&text))
        .count();
    matched as f64 * INDICATOR_WEIGHT
}

/// How much does a line look like a title?
fn prominence(line: &str) -> u8 {
    let mut score = 0;
    if ALL_CAPS_LINE.is_match(line) {
        score += 2;
    }
    if CAPITALIZED_LINE.is_match(line) {
        score += 1;
    }
    score
}

/// Pick the most prominent line, preferring longer lines, and then earlier
/// lines.
fn pick_title(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .filter(|line| line.chars().count() > MIN_TITLE_LEN)
        // `min_by_key` keeps the first of several equal keys.
        .min_by_key(|line| (Reverse(prominence(line)), Reverse(line.chars().count())))
        .map(String::as_str)
}

/// Find the first line with an explicit author pattern, and return the
/// matched name.
fn pick_explicit_author(lines: &[String]) -> Option<&str> {
    lines.iter().find_map(|line| {
        EXPLICIT_AUTHOR_PATTERNS.iter().find_map(|re| {
            re.captures(line)
                .and_then(|caps| caps.get(1))
                .map(|name| name.as_str())
        })
    })
}

/// Find the first line which looks like a personal name.
fn pick_name_shaped_author(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .find(|line| NAME_SHAPED_LINE.is_match(line))
        .map(String::as_str)
}

/// Clean up a detected title before searching for it.
///
/// Strips one pair of surrounding quotes and normalizes whitespace.
pub fn clean_book_title(title: &str) -> String {
    until_fixed_point(title, |title| {
        let title = TITLE_QUOTES.replace_all(title.trim_matches(is_blank), "");
        let title = WHITESPACE_RUN.replace_all(&title, " ");
        title.trim_matches(is_blank).to_owned()
    })
}

/// Clean up a detected author before searching for it.
///
/// Removes "by" and "author:" prefixes, "author" and "writer" suffixes, and
/// anything but ASCII letters, digits, underscores, whitespace, periods and
/// hyphens. Accented letters are dropped too.
pub fn clean_author_name(author: &str) -> String {
    until_fixed_point(author, |author| {
        let author = AUTHOR_PREFIX.replace(author, "");
        let author = AUTHOR_SUFFIX.replace(&author, "");
        let author = AUTHOR_DISALLOWED_CHARS.replace_all(&author, "");
        let author = WHITESPACE_RUN.replace_all(&author, " ");
        author.trim_matches(is_blank).to_owned()
    })
}

/// Apply `pass` until the output stops changing.
///
/// A single pass can expose a new prefix or quote (`"by by Jane"`), so we
/// repeat. Passes never make the string longer, so this terminates.
fn until_fixed_point(input: &str, pass: impl Fn(&str) -> String) -> String {
    let mut current = pass(input);
    loop {
        let next = pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

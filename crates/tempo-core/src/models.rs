use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Value reported when no extraction strategy located the target element.
pub const NOT_AVAILABLE: &str = "N/A";

/// Length of the upstream site's internal identifiers.
pub const SUBJECT_ID_LEN: usize = 22;

/// What a scrape task extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeKind {
    /// Monthly-listener count on an artist page.
    ArtistListeners,
    /// Play count on a track page.
    TrackPlaycount,
}

impl ScrapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeKind::ArtistListeners => "artist-listeners",
            ScrapeKind::TrackPlaycount => "track-playcount",
        }
    }

    /// Path segment of the subject's page on the target site.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ScrapeKind::ArtistListeners => "artist",
            ScrapeKind::TrackPlaycount => "track",
        }
    }

    /// Human-readable name of the extracted figure.
    pub fn label(&self) -> &'static str {
        match self {
            ScrapeKind::ArtistListeners => "monthly listeners",
            ScrapeKind::TrackPlaycount => "play count",
        }
    }

    /// Page URL for `subject` below `base_url`.
    pub fn page_url(&self, base_url: &str, subject: &SubjectId) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.path_segment(),
            subject
        )
    }
}

impl fmt::Display for ScrapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScrapeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "artist-listeners" => Ok(ScrapeKind::ArtistListeners),
            "track-playcount" => Ok(ScrapeKind::TrackPlaycount),
            _ => Err(format!("Unknown scrape kind: {}", s)),
        }
    }
}

/// A validated upstream identifier: exactly 22 ASCII alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        if raw.len() != SUBJECT_ID_LEN || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidIdentifier(format!(
                "expected {SUBJECT_ID_LEN} alphanumeric characters, got {:?}",
                raw.chars().take(40).collect::<String>()
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SubjectId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Cache key: `kind:subjectId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: ScrapeKind, subject: &SubjectId) -> Self {
        Self(format!("{}:{}", kind.as_str(), subject))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one scrape. `value` is [`NOT_AVAILABLE`] when the figure could
/// not be located on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub kind: ScrapeKind,
    pub subject_id: SubjectId,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn new(kind: ScrapeKind, subject_id: SubjectId, value: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id,
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn not_available(kind: ScrapeKind, subject_id: SubjectId) -> Self {
        Self::new(kind, subject_id, NOT_AVAILABLE)
    }

    pub fn is_available(&self) -> bool {
        self.value != NOT_AVAILABLE
    }
}

/// How an extraction strategy finds its element on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// CSS selector; the first match's text is read.
    Css(String),
    /// The first element whose own text contains this needle.
    TextContains(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => write!(f, "css({selector})"),
            Locator::TextContains(needle) => write!(f, "text({needle})"),
        }
    }
}

/// One independent attempt at locating the target element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionStrategy {
    pub name: &'static str,
    pub locator: Locator,
}

impl ExtractionStrategy {
    pub fn css(name: &'static str, selector: &str) -> Self {
        Self {
            name,
            locator: Locator::Css(selector.to_string()),
        }
    }

    pub fn text_contains(name: &'static str, needle: &str) -> Self {
        Self {
            name,
            locator: Locator::TextContains(needle.to_string()),
        }
    }
}

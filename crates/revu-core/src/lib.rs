//! Core domain model for REVU: raw captures, the canonical unified schema,
//! and the language-standardized derivative.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-core";

/// Review platform a raw capture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Maps,
    ConsumerPlatform,
}

impl Source {
    /// Stable prefix baked into `unified_id`. Never change these: they key
    /// every derived record.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Source::Maps => "maps",
            Source::ConsumerPlatform => "consumer",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Maps => "maps",
            Source::ConsumerPlatform => "consumer_platform",
        }
    }

    pub const ALL: [Source; 2] = [Source::Maps, Source::ConsumerPlatform];
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "maps" => Ok(Source::Maps),
            "consumer" | "consumer_platform" => Ok(Source::ConsumerPlatform),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a watermark belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unify,
    Standardize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Unify => f.write_str("unify"),
            Stage::Standardize => f.write_str("standardize"),
        }
    }
}

/// ISO-639-1-ish language code, lowercased and trimmed on construction so
/// `"FR "` and `"fr"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_lowercase())
    }

    pub fn english() -> Self {
        Self("en".to_string())
    }

    pub fn is_english(&self) -> bool {
        self.0 == "en"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic canonical id for a logical review. Re-unifying the same
/// capture always lands on the same key, which is what makes the whole
/// pipeline idempotent.
pub fn unified_id(source: Source, native_id: &str) -> String {
    format!("{}_{}", source.id_prefix(), native_id)
}

/// A source-specific payload exactly as scraped. Immutable once written;
/// the pipeline only ever reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReviewRecord {
    /// Identity of this individual capture (one logical review can be
    /// captured many times across re-scrapes).
    pub capture_id: Uuid,
    pub establishment_id: String,
    pub source: Source,
    /// The platform's own review identifier; store key together with `source`.
    pub native_id: String,
    pub captured_at: DateTime<Utc>,
    /// Schema-flexible platform payload; normalizers deserialize this into a
    /// typed shape and fail loudly on drift.
    pub payload: serde_json::Value,
}

/// One normalized capture, before merge. Candidates sharing a `unified_id`
/// describe the same logical review seen across re-scrapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedReviewCandidate {
    pub unified_id: String,
    pub establishment_id: String,
    pub source: Source,
    pub native_id: String,
    pub capture_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub author: Option<String>,
    pub rating: Option<f64>,
    pub title: Option<String>,
    pub review_text: Option<String>,
    pub review_language: Option<LanguageCode>,
    pub response_from_owner_text: Option<String>,
    /// Review creation time as reported by the platform, normalized UTC-naive.
    pub created_at: NaiveDateTime,
}

/// Canonical merged review. At most one per (source, native_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedReview {
    pub unified_id: String,
    pub establishment_id: String,
    pub source: Source,
    pub native_id: String,
    pub author: Option<String>,
    pub rating: Option<f64>,
    pub title: Option<String>,
    pub review_text: Option<String>,
    pub review_language: Option<LanguageCode>,
    pub response_from_owner_text: Option<String>,
    pub created_at: NaiveDateTime,
    /// Capture ids folded into this record, sorted. Back-reference only, not
    /// an ownership link.
    pub raw_ref: Vec<Uuid>,
    /// When the merge engine last derived this record; the standardize-stage
    /// cursor runs over this field.
    pub unified_at: DateTime<Utc>,
}

impl UnifiedReview {
    /// Equality ignoring the processing timestamp, so re-deriving an
    /// unchanged record counts as zero writes.
    pub fn content_eq(&self, other: &UnifiedReview) -> bool {
        self.unified_id == other.unified_id
            && self.establishment_id == other.establishment_id
            && self.source == other.source
            && self.native_id == other.native_id
            && self.author == other.author
            && self.rating == other.rating
            && self.title == other.title
            && self.review_text == other.review_text
            && self.review_language == other.review_language
            && self.response_from_owner_text == other.response_from_owner_text
            && self.created_at == other.created_at
            && self.raw_ref == other.raw_ref
    }
}

/// English-normalized derivative of exactly one `UnifiedReview`, keyed 1:1 by
/// `unified_id`. The unified input is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedReview {
    pub unified_id: String,
    pub establishment_id: String,
    pub source: Source,
    pub author: Option<String>,
    pub rating: Option<f64>,
    pub title: Option<String>,
    pub review_text: Option<String>,
    /// Resolved body language (declared or detected). A non-English code next
    /// to untranslated text marks a partial translation for operators.
    pub review_language: Option<LanguageCode>,
    pub response_from_owner_text: Option<String>,
    pub response_from_owner_language: Option<LanguageCode>,
    pub created_at: NaiveDateTime,
    pub standardized_at: DateTime<Utc>,
}

/// How the merge engine resolves duplicate captures of one logical review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Per field: any non-null beats null, longer beats shorter, ties go to
    /// the most recent capture. Assumes later scrapes augment earlier ones.
    MostFilled,
    /// Whole record from the newest capture, no per-field mixing.
    Latest,
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "most_filled" => Ok(MergeStrategy::MostFilled),
            "latest" => Ok(MergeStrategy::Latest),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

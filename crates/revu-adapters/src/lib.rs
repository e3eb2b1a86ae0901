//! Per-source normalizers: typed payload decoding + mapping into the
//! canonical unified candidate shape.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use revu_core::{unified_id, LanguageCode, RawReviewRecord, Source, UnifiedReviewCandidate};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-adapters";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload does not match the {platform} schema: {reason}")]
    Payload { platform: Source, reason: String },
    #[error("unparsable timestamp {raw:?}")]
    Timestamp { raw: String },
    #[error("record has no usable timestamp")]
    MissingTimestamp,
    #[error("rating {value} outside the 1.0..=5.0 scale")]
    RatingOutOfRange { value: f64 },
}

/// Pure mapping from one source's raw payload to a merge candidate. Total
/// over payload variants seen in production; anything else is a
/// `NormalizeError`, never a guessed default.
pub trait SourceNormalizer: Send + Sync {
    fn source(&self) -> Source;

    fn normalize(&self, raw: &RawReviewRecord) -> Result<UnifiedReviewCandidate, NormalizeError>;
}

pub fn normalizer_for_source(source: Source) -> Box<dyn SourceNormalizer> {
    match source {
        Source::Maps => Box::new(MapsNormalizer),
        Source::ConsumerPlatform => Box::new(ConsumerNormalizer),
    }
}

/// Maps review as captured upstream. Unknown keys land in `extra` so schema
/// drift shows up in stored payloads instead of being dropped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapsReviewPayload {
    pub review_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub name: Option<String>,
    pub stars: Option<f64>,
    pub rating: Option<f64>,
    pub text: Option<String>,
    pub published_at_date: Option<String>,
    pub response_from_owner_text: Option<String>,
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Consumer-platform review as captured upstream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerReviewPayload {
    pub review_id: Option<String>,
    pub review_url: Option<String>,
    pub rating_value: Option<f64>,
    pub review_headline: Option<String>,
    pub review_body: Option<String>,
    pub date_published: Option<String>,
    pub review_language: Option<String>,
    pub response_from_owner_text: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy)]
pub struct MapsNormalizer;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerNormalizer;

impl SourceNormalizer for MapsNormalizer {
    fn source(&self) -> Source {
        Source::Maps
    }

    fn normalize(&self, raw: &RawReviewRecord) -> Result<UnifiedReviewCandidate, NormalizeError> {
        let payload: MapsReviewPayload = decode_payload(Source::Maps, &raw.payload)?;

        let native_id = match trimmed(payload.review_id.as_deref()) {
            Some(id) => id,
            // Captures sometimes arrive without a review id; derive a stable
            // one from the fields that identify the review in practice.
            None => derive_native_id(&[
                payload.reviewer_id.as_deref().unwrap_or("unknown"),
                payload.published_at_date.as_deref().unwrap_or("unknown"),
                &raw.establishment_id,
                &payload
                    .text
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(50)
                    .collect::<String>(),
            ]),
        };

        let created_at = parse_timestamp(payload.published_at_date.as_deref())?;
        let rating = align_rating(payload.rating.or(payload.stars))?;

        Ok(UnifiedReviewCandidate {
            unified_id: unified_id(Source::Maps, &native_id),
            establishment_id: raw.establishment_id.clone(),
            source: Source::Maps,
            native_id,
            capture_id: raw.capture_id,
            captured_at: raw.captured_at,
            author: clean_text(payload.name),
            rating,
            // No title concept on the maps platform.
            title: None,
            review_text: clean_text(payload.text),
            review_language: declared_language(payload.language),
            response_from_owner_text: clean_text(payload.response_from_owner_text),
            created_at,
        })
    }
}

impl SourceNormalizer for ConsumerNormalizer {
    fn source(&self) -> Source {
        Source::ConsumerPlatform
    }

    fn normalize(&self, raw: &RawReviewRecord) -> Result<UnifiedReviewCandidate, NormalizeError> {
        let payload: ConsumerReviewPayload = decode_payload(Source::ConsumerPlatform, &raw.payload)?;

        let native_id = match trimmed(payload.review_id.as_deref()) {
            Some(id) => id,
            None => match trimmed(payload.review_url.as_deref()) {
                // The review URL is unique per review on this platform.
                Some(url) => url,
                None => derive_native_id(&[
                    &raw.establishment_id,
                    payload.date_published.as_deref().unwrap_or("unknown"),
                    payload.review_body.as_deref().unwrap_or(""),
                ]),
            },
        };

        let created_at = parse_timestamp(payload.date_published.as_deref())?;
        let rating = align_rating(payload.rating_value)?;

        Ok(UnifiedReviewCandidate {
            unified_id: unified_id(Source::ConsumerPlatform, &native_id),
            establishment_id: raw.establishment_id.clone(),
            source: Source::ConsumerPlatform,
            native_id,
            capture_id: raw.capture_id,
            captured_at: raw.captured_at,
            author: None,
            rating,
            title: clean_text(payload.review_headline),
            review_text: clean_text(payload.review_body),
            review_language: declared_language(payload.review_language),
            response_from_owner_text: clean_text(payload.response_from_owner_text),
            created_at,
        })
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    source: Source,
    payload: &JsonValue,
) -> Result<T, NormalizeError> {
    serde_json::from_value(payload.clone()).map_err(|e| NormalizeError::Payload {
        platform: source,
        reason: e.to_string(),
    })
}

/// Stable fallback id when the platform omits its own. Same inputs always
/// derive the same id, so re-captures dedup instead of multiplying.
pub fn derive_native_id(parts: &[&str]) -> String {
    let joined = parts.join("\u{1f}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, joined.as_bytes())
        .simple()
        .to_string()
}

/// UTC-naive creation time from the formats the platforms actually emit.
/// No timestamp at all, or one we cannot parse, is a skip-this-record error;
/// inventing "now" would corrupt watermark ordering.
fn parse_timestamp(raw: Option<&str>) -> Result<NaiveDateTime, NormalizeError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(NormalizeError::MissingTimestamp);
    };
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(NormalizeError::Timestamp {
        raw: raw.to_string(),
    })
}

/// Both platforms score on 1..=5 already; anything outside that is payload
/// corruption, not a scale to convert.
fn align_rating(value: Option<f64>) -> Result<Option<f64>, NormalizeError> {
    match value {
        None => Ok(None),
        Some(v) if (1.0..=5.0).contains(&v) => Ok(Some(v)),
        Some(v) => Err(NormalizeError::RatingOutOfRange { value: v }),
    }
}

/// Whitespace-trim a text field while preserving the absent/known-empty
/// distinction: a missing key stays `None`, a present empty string stays
/// `Some("")`.
fn clean_text(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string())
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn declared_language(value: Option<String>) -> Option<LanguageCode> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(LanguageCode::new)
}

//! Pipeline orchestration: the watermark-driven unify and standardize stages,
//! the merge engine, and the translation cache in front of the external
//! language services.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use revu_adapters::normalizer_for_source;
use revu_core::{
    LanguageCode, MergeStrategy, RawReviewRecord, Source, Stage, StandardizedReview,
    UnifiedReview, UnifiedReviewCandidate,
};
use revu_storage::{
    cache_key, HttpClient, HttpClientConfig, HttpError, ReviewStore, StoreError, StoreStats,
    TokenBucketConfig, TranslationCacheEntry,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub merge_strategy: MergeStrategy,
    /// Fields shorter than this are never sent for detection; too short to
    /// detect reliably and not worth an API call.
    pub min_detect_chars: usize,
    pub detect_url: String,
    pub translate_url: String,
    pub api_key_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Ceiling on language-service calls per second; unset means unthrottled.
    pub rate_limit_per_sec: Option<u32>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("REVU_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            batch_size: std::env::var("REVU_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            merge_strategy: std::env::var("REVU_MERGE_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MergeStrategy::MostFilled),
            min_detect_chars: std::env::var("REVU_MIN_DETECT_CHARS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            detect_url: std::env::var("REVU_DETECT_URL")
                .unwrap_or_else(|_| "http://localhost:5000/detect".to_string()),
            translate_url: std::env::var("REVU_TRANSLATE_URL")
                .unwrap_or_else(|_| "http://localhost:5000/translate".to_string()),
            api_key_file: std::env::var("REVU_API_KEY_FILE").ok().map(PathBuf::from),
            user_agent: std::env::var("REVU_USER_AGENT")
                .unwrap_or_else(|_| "revu-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("REVU_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            rate_limit_per_sec: std::env::var("REVU_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
        }
    }

    /// Key material lives in a file, never in the environment directly.
    pub fn api_key(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.api_key_file else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading api key file {}: {e}", path.display()))?;
        Ok(Some(raw.trim().to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The language dependency is unreachable or rejects our credentials.
    /// Aborts the stage; the watermark is untouched so the next run retries
    /// from the same point.
    #[error("language service unavailable: {0}")]
    LanguageUnavailable(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Suppresses per-record logging only. Never changes which records are
    /// processed.
    pub quick: bool,
    /// Drop derived collections and watermarks first, then backfill.
    pub rebuild: bool,
}

#[derive(Debug, Clone, Default)]
pub enum Scope {
    #[default]
    All,
    Establishments(Vec<String>),
}

impl Scope {
    /// An explicit subset bypasses the watermark for scope but each pair
    /// still runs from its own cursor position.
    async fn resolve(&self, store: &dyn ReviewStore) -> Result<Vec<String>, StoreError> {
        match self {
            Scope::All => store.establishment_ids().await,
            Scope::Establishments(ids) => Ok(ids.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifyCounts {
    pub processed: usize,
    pub merged: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifySummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub merged: usize,
    pub skipped: usize,
    pub per_source: BTreeMap<Source, UnifyCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StandardizeCounts {
    pub processed: usize,
    pub translated: usize,
    pub passthrough: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StandardizeSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub translated: usize,
    pub passthrough: usize,
    pub failed: usize,
    pub per_source: BTreeMap<Source, StandardizeCounts>,
}

/// Watermark cursor per (establishment, source, stage). Advancing happens
/// only after the corresponding batch has durably committed.
pub struct WatermarkTracker {
    store: Arc<dyn ReviewStore>,
}

impl WatermarkTracker {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    pub async fn unprocessed_raw(
        &self,
        establishment_id: &str,
        source: Source,
    ) -> Result<Vec<RawReviewRecord>, StoreError> {
        let cursor = self
            .store
            .watermark(establishment_id, source, Stage::Unify)
            .await?;
        self.store.raw_after(establishment_id, source, cursor).await
    }

    pub async fn unprocessed_unified(
        &self,
        establishment_id: &str,
        source: Source,
    ) -> Result<Vec<UnifiedReview>, StoreError> {
        let cursor = self
            .store
            .watermark(establishment_id, source, Stage::Standardize)
            .await?;
        self.store
            .unified_after(establishment_id, source, cursor)
            .await
    }

    pub async fn advance(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
        boundary: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .advance_watermark(establishment_id, source, stage, boundary)
            .await
    }
}

/// Resolve duplicate captures of one logical review into the canonical
/// record. Candidates are totally ordered by (captured_at, capture_id) before
/// folding, so any permutation or grouping of the input multiset yields the
/// same output.
pub fn merge(
    strategy: MergeStrategy,
    mut candidates: Vec<UnifiedReviewCandidate>,
    unified_at: DateTime<Utc>,
) -> Option<UnifiedReview> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        a.captured_at
            .cmp(&b.captured_at)
            .then_with(|| a.capture_id.cmp(&b.capture_id))
    });

    let mut raw_ref: Vec<Uuid> = candidates.iter().map(|c| c.capture_id).collect();
    raw_ref.sort();
    raw_ref.dedup();

    let merged = match strategy {
        MergeStrategy::Latest => {
            let last = candidates.last().cloned()?;
            UnifiedReview {
                unified_id: last.unified_id,
                establishment_id: last.establishment_id,
                source: last.source,
                native_id: last.native_id,
                author: last.author,
                rating: last.rating,
                title: last.title,
                review_text: last.review_text,
                review_language: last.review_language,
                response_from_owner_text: last.response_from_owner_text,
                created_at: last.created_at,
                raw_ref,
                unified_at,
            }
        }
        MergeStrategy::MostFilled => {
            let mut iter = candidates.into_iter();
            let first = iter.next()?;
            let mut acc = UnifiedReview {
                unified_id: first.unified_id,
                establishment_id: first.establishment_id,
                source: first.source,
                native_id: first.native_id,
                author: first.author,
                rating: first.rating,
                title: first.title,
                review_text: first.review_text,
                review_language: first.review_language,
                response_from_owner_text: first.response_from_owner_text,
                created_at: first.created_at,
                raw_ref,
                unified_at,
            };
            for next in iter {
                fill_text(&mut acc.author, next.author);
                fill_value(&mut acc.rating, next.rating);
                fill_text(&mut acc.title, next.title);
                fill_text(&mut acc.review_text, next.review_text);
                fill_value(&mut acc.review_language, next.review_language);
                fill_text(
                    &mut acc.response_from_owner_text,
                    next.response_from_owner_text,
                );
                // Platforms occasionally backfill the creation time; the
                // newest capture's value wins.
                acc.created_at = next.created_at;
            }
            acc
        }
    };
    Some(merged)
}

/// Non-null beats null, longer beats shorter; ties go to the most recent
/// capture (candidates arrive oldest first).
fn fill_text(slot: &mut Option<String>, incoming: Option<String>) {
    if let Some(new) = incoming {
        match slot {
            Some(old) if new.len() < old.len() => {}
            _ => *slot = Some(new),
        }
    }
}

fn fill_value<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

#[derive(Debug, Error)]
pub enum LanguageError {
    /// Auth rejection or unreachable service. Fatal for the stage.
    #[error("language service unavailable: {0}")]
    Unavailable(String),
    /// Field-local failure (quota, timeout, malformed response). The field
    /// falls back to passthrough; siblings keep going.
    #[error("language call failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
pub trait LanguageService: Send + Sync {
    async fn detect(&self, run_id: Uuid, text: &str) -> Result<LanguageCode, LanguageError>;

    async fn translate(
        &self,
        run_id: Uuid,
        text: &str,
        target: &LanguageCode,
    ) -> Result<String, LanguageError>;
}

/// LibreTranslate-compatible REST client.
pub struct RestLanguageService {
    http: HttpClient,
    detect_url: String,
    translate_url: String,
    api_key: Option<String>,
}

impl RestLanguageService {
    pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: config
                .rate_limit_per_sec
                .map(|per_sec| per_sec.max(1))
                .map(|per_sec| TokenBucketConfig {
                    capacity: per_sec,
                    refill_every: Duration::from_millis(1000 / u64::from(per_sec)),
                }),
            ..Default::default()
        })?;
        Ok(Self {
            http,
            detect_url: config.detect_url.clone(),
            translate_url: config.translate_url.clone(),
            api_key: config.api_key()?,
        })
    }

    fn with_key(&self, mut body: serde_json::Value) -> serde_json::Value {
        if let (Some(key), Some(map)) = (&self.api_key, body.as_object_mut()) {
            map.insert("api_key".to_string(), serde_json::Value::String(key.clone()));
        }
        body
    }
}

fn classify_http_error(err: HttpError) -> LanguageError {
    match err {
        HttpError::Unauthorized { status, url } => {
            LanguageError::Unavailable(format!("rejected with {status} by {url}"))
        }
        HttpError::Request(e) if e.is_connect() => LanguageError::Unavailable(e.to_string()),
        other => LanguageError::Failed(other.to_string()),
    }
}

#[async_trait::async_trait]
impl LanguageService for RestLanguageService {
    async fn detect(&self, run_id: Uuid, text: &str) -> Result<LanguageCode, LanguageError> {
        let body = self.with_key(serde_json::json!({ "q": text }));
        let response = self
            .http
            .post_json(run_id, &self.detect_url, &body)
            .await
            .map_err(classify_http_error)?;
        response
            .get(0)
            .and_then(|v| v.get("language"))
            .and_then(|v| v.as_str())
            .map(LanguageCode::new)
            .ok_or_else(|| LanguageError::Failed("malformed detect response".to_string()))
    }

    async fn translate(
        &self,
        run_id: Uuid,
        text: &str,
        target: &LanguageCode,
    ) -> Result<String, LanguageError> {
        let body = self.with_key(serde_json::json!({
            "q": text,
            "source": "auto",
            "target": target.as_str(),
            "format": "text",
        }));
        let response = self
            .http
            .post_json(run_id, &self.translate_url, &body)
            .await
            .map_err(classify_http_error)?;
        response
            .get("translatedText")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| LanguageError::Failed("malformed translate response".to_string()))
    }
}

/// Content-addressed memo in front of the translation call. Lookup always
/// happens before issuing the external call; a miss populates the cache in
/// the same logical step.
pub struct TranslationCache {
    store: Arc<dyn ReviewStore>,
}

impl TranslationCache {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(
        &self,
        text: &str,
        target: &LanguageCode,
    ) -> Result<Option<String>, StoreError> {
        let key = cache_key(text, target);
        Ok(self.store.cache_lookup(&key).await?.map(|e| e.translated))
    }

    pub async fn store(
        &self,
        text: &str,
        target: &LanguageCode,
        translated: &str,
    ) -> Result<(), StoreError> {
        self.store
            .cache_store(TranslationCacheEntry {
                key: cache_key(text, target),
                source_text: text.trim().to_string(),
                target_lang: target.clone(),
                translated: translated.to_string(),
                created_at: Utc::now(),
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardizeOutcome {
    pub translated_fields: usize,
    pub failed_fields: usize,
}

/// Drives one unified review through detect → translate-or-passthrough and
/// produces its standardized derivative. The unified input is never mutated.
pub struct Standardizer {
    service: Arc<dyn LanguageService>,
    cache: TranslationCache,
    min_detect_chars: usize,
}

impl Standardizer {
    pub fn new(
        service: Arc<dyn LanguageService>,
        cache: TranslationCache,
        min_detect_chars: usize,
    ) -> Self {
        Self {
            service,
            cache,
            min_detect_chars,
        }
    }

    fn detectable(&self, text: Option<&str>) -> Option<String> {
        text.map(str::trim)
            .filter(|t| t.chars().count() >= self.min_detect_chars)
            .map(ToString::to_string)
    }

    async fn translate_cached(&self, run_id: Uuid, text: &str) -> Result<String, LanguageError> {
        let target = LanguageCode::english();
        if let Some(hit) = self
            .cache
            .lookup(text, &target)
            .await
            .map_err(|e| LanguageError::Unavailable(e.to_string()))?
        {
            return Ok(hit);
        }
        let translated = self.service.translate(run_id, text, &target).await?;
        self.cache
            .store(text, &target, &translated)
            .await
            .map_err(|e| LanguageError::Unavailable(e.to_string()))?;
        Ok(translated)
    }

    /// Body language: the maps platform translates everything server-side, so
    /// only an explicitly declared non-English code is trusted there. The
    /// consumer platform declares per-review language; live detection is the
    /// fallback.
    async fn resolve_body_language(
        &self,
        run_id: Uuid,
        review: &UnifiedReview,
        outcome: &mut StandardizeOutcome,
    ) -> Result<Option<LanguageCode>, LanguageError> {
        if let Some(declared) = &review.review_language {
            return Ok(Some(declared.clone()));
        }
        if review.source == Source::Maps {
            return Ok(None);
        }
        let sample = self
            .detectable(review.review_text.as_deref())
            .or_else(|| self.detectable(review.title.as_deref()));
        let Some(sample) = sample else {
            return Ok(None);
        };
        match self.service.detect(run_id, &sample).await {
            Ok(code) => Ok(Some(code)),
            Err(LanguageError::Failed(reason)) => {
                warn!(unified_id = %review.unified_id, %reason, "language detection failed");
                outcome.failed_fields += 1;
                Ok(None)
            }
            Err(fatal) => Err(fatal),
        }
    }

    pub async fn standardize(
        &self,
        run_id: Uuid,
        review: &UnifiedReview,
    ) -> Result<(StandardizedReview, StandardizeOutcome), LanguageError> {
        let mut outcome = StandardizeOutcome::default();

        let mut title = review.title.clone();
        let mut review_text = review.review_text.clone();
        let mut body_language = self
            .resolve_body_language(run_id, review, &mut outcome)
            .await?;

        if let Some(language) = body_language.clone().filter(|l| !l.is_english()) {
            let mut body_fully_translated = true;
            for field in [&mut title, &mut review_text] {
                let Some(original) = field.as_deref().map(str::trim).filter(|t| !t.is_empty())
                else {
                    continue;
                };
                match self.translate_cached(run_id, original).await {
                    Ok(translated) => {
                        *field = Some(translated);
                        outcome.translated_fields += 1;
                    }
                    Err(LanguageError::Failed(reason)) => {
                        warn!(
                            unified_id = %review.unified_id,
                            language = %language,
                            %reason,
                            "translation failed, keeping original text"
                        );
                        outcome.failed_fields += 1;
                        body_fully_translated = false;
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            // A non-English code left next to untranslated text is how a
            // partial translation stays visible for re-runs.
            if body_fully_translated {
                body_language = Some(LanguageCode::english());
            }
        }

        let mut response_text = review.response_from_owner_text.clone();
        let mut response_language: Option<LanguageCode> = None;
        if let Some(sample) = self.detectable(review.response_from_owner_text.as_deref()) {
            match self.service.detect(run_id, &sample).await {
                Ok(code) => {
                    response_language = Some(code.clone());
                    if !code.is_english() {
                        match self.translate_cached(run_id, &sample).await {
                            Ok(translated) => {
                                response_text = Some(translated);
                                response_language = Some(LanguageCode::english());
                                outcome.translated_fields += 1;
                            }
                            Err(LanguageError::Failed(reason)) => {
                                warn!(
                                    unified_id = %review.unified_id,
                                    %reason,
                                    "owner response translation failed, keeping original"
                                );
                                outcome.failed_fields += 1;
                            }
                            Err(fatal) => return Err(fatal),
                        }
                    }
                }
                Err(LanguageError::Failed(reason)) => {
                    warn!(
                        unified_id = %review.unified_id,
                        %reason,
                        "owner response detection failed"
                    );
                    outcome.failed_fields += 1;
                }
                Err(fatal) => return Err(fatal),
            }
        }

        let standardized = StandardizedReview {
            unified_id: review.unified_id.clone(),
            establishment_id: review.establishment_id.clone(),
            source: review.source,
            author: review.author.clone(),
            rating: review.rating,
            title,
            review_text,
            review_language: body_language,
            response_from_owner_text: response_text,
            response_from_owner_language: response_language,
            created_at: review.created_at,
            standardized_at: Utc::now(),
        };
        Ok((standardized, outcome))
    }
}

/// One group of candidates sharing a `unified_id`, with the earliest capture
/// time of the run's new captures so batch boundaries never advance the
/// watermark past uncommitted work.
struct CandidateGroup {
    source: Source,
    native_id: String,
    first_new_capture: DateTime<Utc>,
    max_new_capture: DateTime<Utc>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ReviewStore>,
    tracker: WatermarkTracker,
    standardizer: Standardizer,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ReviewStore>,
        language: Arc<dyn LanguageService>,
    ) -> Self {
        let tracker = WatermarkTracker::new(store.clone());
        let standardizer = Standardizer::new(
            language,
            TranslationCache::new(store.clone()),
            config.min_detect_chars,
        );
        Self {
            config,
            store,
            tracker,
            standardizer,
        }
    }

    pub async fn unify(
        &self,
        scope: &Scope,
        opts: RunOptions,
    ) -> Result<UnifySummary, PipelineError> {
        let run_id = Uuid::new_v4();
        if opts.rebuild {
            info!(%run_id, "rebuild requested, dropping derived collections");
            // Standardized records derive from unified ones; both go.
            self.store.reset_stage(Stage::Standardize).await?;
            self.store.reset_stage(Stage::Unify).await?;
        }

        let mut summary = UnifySummary {
            run_id,
            processed: 0,
            merged: 0,
            skipped: 0,
            per_source: BTreeMap::new(),
        };

        for establishment_id in scope.resolve(self.store.as_ref()).await? {
            for source in Source::ALL {
                let counts = self
                    .unify_pair(run_id, &establishment_id, source, opts)
                    .await?;
                summary.processed += counts.processed;
                summary.merged += counts.merged;
                summary.skipped += counts.skipped;
                let entry = summary.per_source.entry(source).or_default();
                entry.processed += counts.processed;
                entry.merged += counts.merged;
                entry.skipped += counts.skipped;
            }
        }

        info!(
            %run_id,
            processed = summary.processed,
            merged = summary.merged,
            skipped = summary.skipped,
            "unify stage finished"
        );
        Ok(summary)
    }

    async fn unify_pair(
        &self,
        run_id: Uuid,
        establishment_id: &str,
        source: Source,
        opts: RunOptions,
    ) -> Result<UnifyCounts, PipelineError> {
        let raws = self.tracker.unprocessed_raw(establishment_id, source).await?;
        let mut counts = UnifyCounts {
            processed: raws.len(),
            ..Default::default()
        };
        if raws.is_empty() {
            return Ok(counts);
        }

        let normalizer = normalizer_for_source(source);
        // Earliest capture time of a record that failed to parse. The
        // watermark never advances past it, so the record stays unprocessed
        // for a future retry instead of being silently dropped.
        let mut failure_floor: Option<DateTime<Utc>> = None;
        let mut groups: Vec<CandidateGroup> = Vec::new();
        let mut index: BTreeMap<String, usize> = BTreeMap::new();

        for raw in &raws {
            match normalizer.normalize(raw) {
                Ok(candidate) => {
                    if !opts.quick {
                        debug!(
                            %run_id,
                            unified_id = %candidate.unified_id,
                            captured_at = %raw.captured_at,
                            "normalized capture"
                        );
                    }
                    match index.get(&candidate.unified_id) {
                        Some(&i) => {
                            let group = &mut groups[i];
                            group.max_new_capture = group.max_new_capture.max(raw.captured_at);
                        }
                        None => {
                            index.insert(candidate.unified_id.clone(), groups.len());
                            groups.push(CandidateGroup {
                                source,
                                native_id: candidate.native_id.clone(),
                                first_new_capture: raw.captured_at,
                                max_new_capture: raw.captured_at,
                            });
                        }
                    }
                }
                Err(reason) => {
                    warn!(
                        %run_id,
                        capture_id = %raw.capture_id,
                        %source,
                        %reason,
                        "skipping malformed raw capture"
                    );
                    counts.skipped += 1;
                    failure_floor = Some(match failure_floor {
                        Some(floor) => floor.min(raw.captured_at),
                        None => raw.captured_at,
                    });
                }
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let unified_at = Utc::now();
        let mut offset = 0;
        while offset < groups.len() {
            let chunk = &groups[offset..(offset + batch_size).min(groups.len())];
            let mut batch = Vec::with_capacity(chunk.len());
            let mut chunk_max: Option<DateTime<Utc>> = None;

            for group in chunk {
                // Re-merge the full capture history, not just this run's
                // captures, so grouping across runs never changes the result.
                let history = self.store.raw_for_key(group.source, &group.native_id).await?;
                let candidates: Vec<UnifiedReviewCandidate> = history
                    .iter()
                    .filter_map(|r| normalizer.normalize(r).ok())
                    .collect();
                if let Some(merged) = merge(self.config.merge_strategy, candidates, unified_at) {
                    batch.push(merged);
                }
                chunk_max = Some(match chunk_max {
                    Some(m) => m.max(group.max_new_capture),
                    None => group.max_new_capture,
                });
            }

            counts.merged += self.store.upsert_unified(batch).await?;

            // Advance only to a point every earlier capture has committed
            // behind: stay below the next pending group and below the
            // earliest parse failure.
            if let Some(mut boundary) = chunk_max {
                if let Some(next) = groups.get(offset + chunk.len()) {
                    boundary =
                        boundary.min(next.first_new_capture - chrono::Duration::microseconds(1));
                }
                if let Some(floor) = failure_floor {
                    boundary = boundary.min(floor - chrono::Duration::microseconds(1));
                }
                self.tracker
                    .advance(establishment_id, source, Stage::Unify, boundary)
                    .await?;
            }

            offset += chunk.len();
        }

        Ok(counts)
    }

    pub async fn standardize(
        &self,
        scope: &Scope,
        opts: RunOptions,
    ) -> Result<StandardizeSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        if opts.rebuild {
            info!(%run_id, "rebuild requested, dropping standardized collection");
            self.store.reset_stage(Stage::Standardize).await?;
        }

        let mut summary = StandardizeSummary {
            run_id,
            processed: 0,
            translated: 0,
            passthrough: 0,
            failed: 0,
            per_source: BTreeMap::new(),
        };

        for establishment_id in scope.resolve(self.store.as_ref()).await? {
            for source in Source::ALL {
                let counts = self
                    .standardize_pair(run_id, &establishment_id, source, opts)
                    .await?;
                summary.processed += counts.processed;
                summary.translated += counts.translated;
                summary.passthrough += counts.passthrough;
                summary.failed += counts.failed;
                let entry = summary.per_source.entry(source).or_default();
                entry.processed += counts.processed;
                entry.translated += counts.translated;
                entry.passthrough += counts.passthrough;
                entry.failed += counts.failed;
            }
        }

        info!(
            %run_id,
            processed = summary.processed,
            translated = summary.translated,
            passthrough = summary.passthrough,
            failed = summary.failed,
            "standardize stage finished"
        );
        Ok(summary)
    }

    async fn standardize_pair(
        &self,
        run_id: Uuid,
        establishment_id: &str,
        source: Source,
        opts: RunOptions,
    ) -> Result<StandardizeCounts, PipelineError> {
        let pending = self
            .tracker
            .unprocessed_unified(establishment_id, source)
            .await?;
        let mut counts = StandardizeCounts::default();
        if pending.is_empty() {
            return Ok(counts);
        }

        let batch_size = self.config.batch_size.max(1);
        let mut offset = 0;
        while offset < pending.len() {
            let batch = &pending[offset..(offset + batch_size).min(pending.len())];
            let mut standardized = Vec::with_capacity(batch.len());
            for review in batch {
                let (record, outcome) = self
                    .standardizer
                    .standardize(run_id, review)
                    .await
                    .map_err(|e| match e {
                        LanguageError::Unavailable(reason) => {
                            PipelineError::LanguageUnavailable(reason)
                        }
                        LanguageError::Failed(reason) => {
                            // Field-level failures are handled inside the
                            // standardizer; anything surfacing here is fatal.
                            PipelineError::LanguageUnavailable(reason)
                        }
                    })?;
                if !opts.quick {
                    debug!(
                        %run_id,
                        unified_id = %review.unified_id,
                        translated_fields = outcome.translated_fields,
                        failed_fields = outcome.failed_fields,
                        "standardized review"
                    );
                }
                counts.processed += 1;
                if outcome.translated_fields > 0 {
                    counts.translated += 1;
                } else {
                    counts.passthrough += 1;
                }
                if outcome.failed_fields > 0 {
                    counts.failed += 1;
                }
                standardized.push(record);
            }

            self.store.upsert_standardized(standardized).await?;
            if let Some(last) = batch.last() {
                // Records from one unify run share a unified_at; the cursor
                // fetch is strictly-greater, so never move past a timestamp
                // while records bearing it are still pending.
                let mut boundary = last.unified_at;
                if let Some(next) = pending.get(offset + batch.len()) {
                    boundary =
                        boundary.min(next.unified_at - chrono::Duration::microseconds(1));
                }
                self.tracker
                    .advance(establishment_id, source, Stage::Standardize, boundary)
                    .await?;
            }

            offset += batch.len();
        }

        Ok(counts)
    }

    /// unify then standardize, one call.
    pub async fn full_pipeline(
        &self,
        scope: &Scope,
        opts: RunOptions,
    ) -> Result<(UnifySummary, StandardizeSummary), PipelineError> {
        let unify = self.unify(scope, opts).await?;
        // The rebuild already happened in the unify stage.
        let standardize = self
            .standardize(
                scope,
                RunOptions {
                    rebuild: false,
                    ..opts
                },
            )
            .await?;
        Ok((unify, standardize))
    }

    pub async fn stats(&self) -> Result<StoreStats, PipelineError> {
        Ok(self.store.stats().await?)
    }

    /// Mark a raw key permanently bad so the watermark can move past it.
    pub async fn quarantine(&self, source: Source, native_id: &str) -> Result<(), PipelineError> {
        warn!(%source, native_id, "quarantining raw key");
        Ok(self.store.quarantine(source, native_id).await?)
    }
}

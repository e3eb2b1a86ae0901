//! Durable store abstraction for REVU: raw captures, unified and standardized
//! reviews, per-(establishment, source, stage) watermarks, and the
//! content-addressed translation cache. Also hosts the retrying HTTP client
//! the language service speaks through.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use revu_core::{
    LanguageCode, RawReviewRecord, Source, Stage, StandardizedReview, UnifiedReview,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached or written. Fatal for the current
    /// stage; watermarks stay where they were.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt store data: {0}")]
    Data(String),
}

/// Cached translation of one exact source string into one target language.
/// Append-only: a source string's correct translation does not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationCacheEntry {
    pub key: String,
    pub source_text: String,
    pub target_lang: LanguageCode,
    pub translated: String,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed cache key: exact string match after trimming, no fuzzy
/// folding (fuzzy matching risks incorrect substitutions).
pub fn cache_key(text: &str, target: &LanguageCode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub raw_captures: usize,
    pub unified: usize,
    pub standardized: usize,
    pub avg_rating: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub establishments: usize,
    pub raw_total: usize,
    pub unified_total: usize,
    pub standardized_total: usize,
    pub per_source: BTreeMap<Source, SourceStats>,
    pub response_language_breakdown: BTreeMap<String, usize>,
    pub cache_entries: usize,
    pub unify_backlog: usize,
    pub standardize_backlog: usize,
}

/// Persistence contract the pipeline is written against. Everything is
/// upsert-by-key, which is what turns duplicate concurrent runs into double
/// work instead of corruption.
#[async_trait::async_trait]
pub trait ReviewStore: Send + Sync {
    /// Raw captures are written by the out-of-scope scraping adapters; tests
    /// seed through the same door.
    async fn insert_raw(&self, records: Vec<RawReviewRecord>) -> Result<usize, StoreError>;

    /// Captures for one (establishment, source) pair strictly newer than
    /// `after`, oldest first. `None` means full backfill. Quarantined keys
    /// are excluded.
    async fn raw_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawReviewRecord>, StoreError>;

    /// Every capture of one logical review, oldest first.
    async fn raw_for_key(
        &self,
        source: Source,
        native_id: &str,
    ) -> Result<Vec<RawReviewRecord>, StoreError>;

    /// Upsert by `unified_id`; returns how many rows actually changed.
    /// Re-deriving an identical record keeps its `unified_at` and counts zero.
    async fn upsert_unified(&self, batch: Vec<UnifiedReview>) -> Result<usize, StoreError>;

    /// Unified records for one pair with `unified_at` strictly newer than
    /// `after`, oldest first.
    async fn unified_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<UnifiedReview>, StoreError>;

    /// Upsert by `unified_id`; returns how many rows actually changed.
    async fn upsert_standardized(
        &self,
        batch: Vec<StandardizedReview>,
    ) -> Result<usize, StoreError>;

    async fn standardized(
        &self,
        unified_id: &str,
    ) -> Result<Option<StandardizedReview>, StoreError>;

    async fn watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Monotonic: a boundary at or before the stored one is ignored.
    async fn advance_watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
        boundary: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Full rebuild: drop the stage's derived collection and clear its
    /// watermarks so the next run backfills from scratch.
    async fn reset_stage(&self, stage: Stage) -> Result<(), StoreError>;

    /// Mark one raw key permanently bad; `raw_after` skips it from then on.
    async fn quarantine(&self, source: Source, native_id: &str) -> Result<(), StoreError>;

    async fn cache_lookup(&self, key: &str) -> Result<Option<TranslationCacheEntry>, StoreError>;

    /// Overwrite-on-conflict: a benign race between two workers translating
    /// the same text just rewrites an equivalent entry.
    async fn cache_store(&self, entry: TranslationCacheEntry) -> Result<(), StoreError>;

    async fn establishment_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

fn raw_key(source: Source, native_id: &str, capture_id: Uuid) -> String {
    format!("{}:{}:{}", source.id_prefix(), native_id, capture_id)
}

fn pair_key(source: Source, native_id: &str) -> String {
    format!("{}:{}", source.id_prefix(), native_id)
}

fn watermark_key(establishment_id: &str, source: Source, stage: Stage) -> String {
    format!("{}:{}:{}", establishment_id, source.id_prefix(), stage)
}

/// All collections in one serializable snapshot. Both store implementations
/// operate on this; the file-backed one persists it after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collections {
    raw: BTreeMap<String, RawReviewRecord>,
    unified: BTreeMap<String, UnifiedReview>,
    standardized: BTreeMap<String, StandardizedReview>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
    translation_cache: BTreeMap<String, TranslationCacheEntry>,
    quarantined: BTreeSet<String>,
}

impl Collections {
    fn insert_raw(&mut self, records: Vec<RawReviewRecord>) -> usize {
        let mut inserted = 0;
        for record in records {
            let key = raw_key(record.source, &record.native_id, record.capture_id);
            if self.raw.insert(key, record).is_none() {
                inserted += 1;
            }
        }
        inserted
    }

    fn raw_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Vec<RawReviewRecord> {
        let mut out: Vec<RawReviewRecord> = self
            .raw
            .values()
            .filter(|r| r.establishment_id == establishment_id && r.source == source)
            .filter(|r| !self.quarantined.contains(&pair_key(r.source, &r.native_id)))
            .filter(|r| after.map_or(true, |boundary| r.captured_at > boundary))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then(a.capture_id.cmp(&b.capture_id))
        });
        out
    }

    fn raw_for_key(&self, source: Source, native_id: &str) -> Vec<RawReviewRecord> {
        let mut out: Vec<RawReviewRecord> = self
            .raw
            .values()
            .filter(|r| r.source == source && r.native_id == native_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then(a.capture_id.cmp(&b.capture_id))
        });
        out
    }

    fn upsert_unified(&mut self, batch: Vec<UnifiedReview>) -> usize {
        let mut changed = 0;
        for review in batch {
            match self.unified.get(&review.unified_id) {
                Some(existing) if existing.content_eq(&review) => {}
                _ => {
                    self.unified.insert(review.unified_id.clone(), review);
                    changed += 1;
                }
            }
        }
        changed
    }

    fn unified_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Vec<UnifiedReview> {
        let mut out: Vec<UnifiedReview> = self
            .unified
            .values()
            .filter(|r| r.establishment_id == establishment_id && r.source == source)
            .filter(|r| after.map_or(true, |boundary| r.unified_at > boundary))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.unified_at
                .cmp(&b.unified_at)
                .then(a.unified_id.cmp(&b.unified_id))
        });
        out
    }

    fn upsert_standardized(&mut self, batch: Vec<StandardizedReview>) -> usize {
        let mut changed = 0;
        for review in batch {
            match self.standardized.get(&review.unified_id) {
                Some(existing) if existing == &review => {}
                _ => {
                    self.standardized.insert(review.unified_id.clone(), review);
                    changed += 1;
                }
            }
        }
        changed
    }

    fn advance_watermark(
        &mut self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
        boundary: DateTime<Utc>,
    ) {
        let key = watermark_key(establishment_id, source, stage);
        match self.watermarks.get(&key) {
            Some(current) if *current >= boundary => {}
            _ => {
                self.watermarks.insert(key, boundary);
            }
        }
    }

    fn reset_stage(&mut self, stage: Stage) {
        match stage {
            Stage::Unify => self.unified.clear(),
            Stage::Standardize => self.standardized.clear(),
        }
        let suffix = format!(":{stage}");
        self.watermarks.retain(|key, _| !key.ends_with(&suffix));
    }

    fn establishment_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .raw
            .values()
            .map(|r| r.establishment_id.clone())
            .collect();
        ids.extend(self.unified.values().map(|r| r.establishment_id.clone()));
        ids.into_iter().collect()
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            establishments: self.establishment_ids().len(),
            raw_total: self.raw.len(),
            unified_total: self.unified.len(),
            standardized_total: self.standardized.len(),
            cache_entries: self.translation_cache.len(),
            ..StoreStats::default()
        };

        for source in Source::ALL {
            let mut entry = SourceStats::default();
            entry.raw_captures = self.raw.values().filter(|r| r.source == source).count();
            let ratings: Vec<f64> = self
                .unified
                .values()
                .filter(|r| r.source == source)
                .inspect(|_| entry.unified += 1)
                .filter_map(|r| r.rating)
                .collect();
            if !ratings.is_empty() {
                entry.avg_rating = Some(ratings.iter().sum::<f64>() / ratings.len() as f64);
            }
            entry.standardized = self
                .standardized
                .values()
                .filter(|r| r.source == source)
                .count();
            stats.per_source.insert(source, entry);
        }

        for review in self.standardized.values() {
            if let Some(lang) = &review.response_from_owner_language {
                *stats
                    .response_language_breakdown
                    .entry(lang.as_str().to_string())
                    .or_default() += 1;
            }
        }

        stats.unify_backlog = self
            .raw
            .values()
            .filter(|r| !self.quarantined.contains(&pair_key(r.source, &r.native_id)))
            .filter(|r| {
                let key = watermark_key(&r.establishment_id, r.source, Stage::Unify);
                self.watermarks
                    .get(&key)
                    .map_or(true, |boundary| r.captured_at > *boundary)
            })
            .count();
        stats.standardize_backlog = self
            .unified
            .keys()
            .filter(|id| !self.standardized.contains_key(*id))
            .count();

        stats
    }
}

/// In-memory store for tests and dependency injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ReviewStore for MemoryStore {
    async fn insert_raw(&self, records: Vec<RawReviewRecord>) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.insert_raw(records))
    }

    async fn raw_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawReviewRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .raw_after(establishment_id, source, after))
    }

    async fn raw_for_key(
        &self,
        source: Source,
        native_id: &str,
    ) -> Result<Vec<RawReviewRecord>, StoreError> {
        Ok(self.state.lock().await.raw_for_key(source, native_id))
    }

    async fn upsert_unified(&self, batch: Vec<UnifiedReview>) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.upsert_unified(batch))
    }

    async fn upsert_standardized(
        &self,
        batch: Vec<StandardizedReview>,
    ) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.upsert_standardized(batch))
    }

    async fn advance_watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
        boundary: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .advance_watermark(establishment_id, source, stage, boundary);
        Ok(())
    }

    async fn reset_stage(&self, stage: Stage) -> Result<(), StoreError> {
        self.state.lock().await.reset_stage(stage);
        Ok(())
    }

    async fn quarantine(&self, source: Source, native_id: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .quarantined
            .insert(pair_key(source, native_id));
        Ok(())
    }

    async fn cache_store(&self, entry: TranslationCacheEntry) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .translation_cache
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn unified_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<UnifiedReview>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .unified_after(establishment_id, source, after))
    }

    async fn watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .watermarks
            .get(&watermark_key(establishment_id, source, stage))
            .copied())
    }

    async fn cache_lookup(&self, key: &str) -> Result<Option<TranslationCacheEntry>, StoreError> {
        Ok(self.state.lock().await.translation_cache.get(key).cloned())
    }

    async fn standardized(
        &self,
        unified_id: &str,
    ) -> Result<Option<StandardizedReview>, StoreError> {
        Ok(self.state.lock().await.standardized.get(unified_id).cloned())
    }

    async fn establishment_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.establishment_ids())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.state.lock().await.stats())
    }
}

/// Durable store: one JSON snapshot rewritten through a temp file + atomic
/// rename after every mutation, so a crash can never leave a torn file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Collections>,
}

impl JsonFileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Unavailable(format!("creating {}: {e}", root.display())))?;
        let path = root.join("revu-store.json");
        let state = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Data(format!("parsing {}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Collections::default(),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &Collections) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| StoreError::Data(format!("serializing store: {e}")))?;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Unavailable("store path has no parent".into()))?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let write = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &self.path).await.with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })?;
            Ok::<_, anyhow::Error>(())
        };

        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Unavailable(err.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReviewStore for JsonFileStore {
    async fn insert_raw(&self, records: Vec<RawReviewRecord>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let inserted = state.insert_raw(records);
        self.persist(&state).await?;
        Ok(inserted)
    }

    async fn upsert_unified(&self, batch: Vec<UnifiedReview>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let changed = state.upsert_unified(batch);
        self.persist(&state).await?;
        Ok(changed)
    }

    async fn upsert_standardized(
        &self,
        batch: Vec<StandardizedReview>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let changed = state.upsert_standardized(batch);
        self.persist(&state).await?;
        Ok(changed)
    }

    async fn advance_watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
        boundary: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.advance_watermark(establishment_id, source, stage, boundary);
        self.persist(&state).await
    }

    async fn reset_stage(&self, stage: Stage) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.reset_stage(stage);
        self.persist(&state).await
    }

    async fn quarantine(&self, source: Source, native_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.quarantined.insert(pair_key(source, native_id));
        self.persist(&state).await
    }

    async fn cache_store(&self, entry: TranslationCacheEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.translation_cache.insert(entry.key.clone(), entry);
        self.persist(&state).await
    }

    async fn raw_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawReviewRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .raw_after(establishment_id, source, after))
    }

    async fn raw_for_key(
        &self,
        source: Source,
        native_id: &str,
    ) -> Result<Vec<RawReviewRecord>, StoreError> {
        Ok(self.state.lock().await.raw_for_key(source, native_id))
    }

    async fn unified_after(
        &self,
        establishment_id: &str,
        source: Source,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<UnifiedReview>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .unified_after(establishment_id, source, after))
    }

    async fn watermark(
        &self,
        establishment_id: &str,
        source: Source,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .watermarks
            .get(&watermark_key(establishment_id, source, stage))
            .copied())
    }

    async fn cache_lookup(&self, key: &str) -> Result<Option<TranslationCacheEntry>, StoreError> {
        Ok(self.state.lock().await.translation_cache.get(key).cloned())
    }

    async fn standardized(
        &self,
        unified_id: &str,
    ) -> Result<Option<StandardizedReview>, StoreError> {
        Ok(self.state.lock().await.standardized.get(unified_id).cloned())
    }

    async fn establishment_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.establishment_ids())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.state.lock().await.stats())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    /// 401/403: the dependency rejects us outright; no point retrying
    /// anything else this run.
    #[error("unauthorized ({status}) for {url}")]
    Unauthorized { status: u16, url: String },
}

/// Retrying POST-JSON client for the external language services. One shared
/// concurrency limit and an optional token bucket keep call burstiness down.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, HttpError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("language_api_call", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(HttpError::Unauthorized {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        Err(HttpError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn raw(native_id: &str, hour: u32) -> RawReviewRecord {
        RawReviewRecord {
            capture_id: Uuid::new_v4(),
            establishment_id: "est-1".into(),
            source: Source::Maps,
            native_id: native_id.into(),
            captured_at: ts(hour),
            payload: serde_json::json!({"text": "hi"}),
        }
    }

    fn unified(native_id: &str, text: &str) -> UnifiedReview {
        UnifiedReview {
            unified_id: revu_core::unified_id(Source::Maps, native_id),
            establishment_id: "est-1".into(),
            source: Source::Maps,
            native_id: native_id.into(),
            author: None,
            rating: Some(4.0),
            title: None,
            review_text: Some(text.into()),
            review_language: None,
            response_from_owner_text: None,
            created_at: ts(9).naive_utc(),
            raw_ref: vec![],
            unified_at: ts(10),
        }
    }

    #[test]
    fn cache_key_trims_but_preserves_case_sensitivity_of_content() {
        let en = LanguageCode::english();
        assert_eq!(cache_key(" Bonjour ", &en), cache_key("Bonjour", &en));
        assert_ne!(cache_key("Bonjour", &en), cache_key("bonjour", &en));
        assert_ne!(
            cache_key("Bonjour", &en),
            cache_key("Bonjour", &LanguageCode::new("de"))
        );
    }

    #[tokio::test]
    async fn upsert_unified_counts_only_content_changes() {
        let store = MemoryStore::new();
        let first = unified("r1", "Great");
        assert_eq!(store.upsert_unified(vec![first.clone()]).await.unwrap(), 1);

        // Same content, newer processing timestamp: no write.
        let mut rederived = first.clone();
        rederived.unified_at = ts(11);
        assert_eq!(store.upsert_unified(vec![rederived]).await.unwrap(), 0);
        let kept = store
            .unified_after("est-1", Source::Maps, None)
            .await
            .unwrap();
        assert_eq!(kept[0].unified_at, ts(10));

        let changed = unified("r1", "Great place");
        assert_eq!(store.upsert_unified(vec![changed]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watermark_never_regresses() {
        let store = MemoryStore::new();
        store
            .advance_watermark("est-1", Source::Maps, Stage::Unify, ts(12))
            .await
            .unwrap();
        store
            .advance_watermark("est-1", Source::Maps, Stage::Unify, ts(9))
            .await
            .unwrap();
        assert_eq!(
            store.watermark("est-1", Source::Maps, Stage::Unify).await.unwrap(),
            Some(ts(12))
        );
    }

    #[tokio::test]
    async fn raw_after_respects_boundary_and_quarantine() {
        let store = MemoryStore::new();
        store
            .insert_raw(vec![raw("a", 8), raw("b", 10), raw("bad", 11)])
            .await
            .unwrap();
        store.quarantine(Source::Maps, "bad").await.unwrap();

        let all = store.raw_after("est-1", Source::Maps, None).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.native_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let newer = store
            .raw_after("est-1", Source::Maps, Some(ts(8)))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].native_id, "b");
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.insert_raw(vec![raw("r1", 9)]).await.unwrap();
            store.upsert_unified(vec![unified("r1", "Great")]).await.unwrap();
            store
                .advance_watermark("est-1", Source::Maps, Stage::Unify, ts(9))
                .await
                .unwrap();
            store
                .cache_store(TranslationCacheEntry {
                    key: cache_key("Bonjour", &LanguageCode::english()),
                    source_text: "Bonjour".into(),
                    target_lang: LanguageCode::english(),
                    translated: "Hello".into(),
                    created_at: ts(9),
                })
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.raw_after("est-1", Source::Maps, None).await.unwrap().len(),
            1
        );
        assert_eq!(
            reopened
                .unified_after("est-1", Source::Maps, None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            reopened
                .watermark("est-1", Source::Maps, Stage::Unify)
                .await
                .unwrap(),
            Some(ts(9))
        );
        assert!(reopened
            .cache_lookup(&cache_key("Bonjour", &LanguageCode::english()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn reset_stage_drops_derived_collection_and_watermarks() {
        let store = MemoryStore::new();
        store.upsert_unified(vec![unified("r1", "Great")]).await.unwrap();
        store
            .advance_watermark("est-1", Source::Maps, Stage::Unify, ts(9))
            .await
            .unwrap();
        store
            .advance_watermark("est-1", Source::Maps, Stage::Standardize, ts(9))
            .await
            .unwrap();

        store.reset_stage(Stage::Unify).await.unwrap();
        assert!(store
            .unified_after("est-1", Source::Maps, None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.watermark("est-1", Source::Maps, Stage::Unify).await.unwrap(),
            None
        );
        // Other stage untouched.
        assert_eq!(
            store
                .watermark("est-1", Source::Maps, Stage::Standardize)
                .await
                .unwrap(),
            Some(ts(9))
        );
    }

    #[test]
    fn retry_delay_doubles_from_the_default_base_and_caps() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        // shift overflow saturates at the cap instead of wrapping
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_blocks_until_the_next_refill() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(100));
        let start = Instant::now();

        bucket.take().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}

//! Two-layer response cache: exact hash lookups over a bounded LRU map,
//! with a similarity layer for near-duplicate prompts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::similarity::{dice_coefficient, hash_key, normalize, HolographicEncoder};
use crate::clock::{system_clock, ClockFn};
use crate::persist::KvStore;

/// Similarity backend for the fuzzy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncodingStrategy {
    /// Bigram Dice coefficient over normalized text
    #[default]
    Bigram,
    /// Holographic trigram vectors with semantic seeds
    Holographic,
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum retained entries before LRU eviction
    pub max_entries: usize,
    /// Entry time-to-live in milliseconds, enforced at read time
    pub ttl_ms: u64,
    /// Minimum similarity for a fuzzy hit
    pub similarity_threshold: f64,
    /// Write entries through to the configured store
    pub persist: bool,
    /// Fuzzy matching backend
    pub encoding_strategy: EncodingStrategy,
    /// Seed terms for the holographic backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_seeds: Option<HashMap<String, u64>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl_ms: 3_600_000,
            similarity_threshold: 0.85,
            persist: false,
            encoding_strategy: EncodingStrategy::Bigram,
            semantic_seeds: None,
        }
    }
}

/// A cached model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hash of (normalized prompt, model)
    pub key: String,
    /// Normalized prompt text used for keying and similarity
    pub normalized_prompt: String,
    /// Original prompt as submitted
    pub prompt: String,
    /// Cached response text
    pub response: String,
    /// Model that produced the response
    pub model: String,
    /// Input tokens of the original call
    pub input_tokens: u64,
    /// Output tokens of the original call
    pub output_tokens: u64,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// Number of hits
    pub access_count: u64,
    /// When the entry was last accessed
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }

    /// Copy-on-read hit update: a fresh entry object replaces the slot so a
    /// concurrent reader never observes a torn access count.
    fn touched(&self, now: DateTime<Utc>) -> Self {
        let mut updated = self.clone();
        updated.access_count += 1;
        updated.last_accessed = now;
        updated
    }
}

/// How a lookup matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// A successful cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub match_type: MatchType,
    pub similarity: f64,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Holographic vectors by entry key; empty under the bigram strategy
    vectors: HashMap<String, Vec<f32>>,
}

/// Bounded two-layer response cache.
pub struct ResponseCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
    encoder: Option<HolographicEncoder>,
    store: Option<Arc<dyn KvStore>>,
    counters: Mutex<(u64, u64)>,
    clock: ClockFn,
}

impl ResponseCache {
    /// Create a cache from validated configuration.
    pub fn new(config: CacheConfig) -> Self {
        let encoder = match config.encoding_strategy {
            EncodingStrategy::Bigram => None,
            EncodingStrategy::Holographic => {
                Some(HolographicEncoder::new(config.semantic_seeds.clone()))
            }
        };
        Self {
            config,
            inner: RwLock::new(CacheInner::default()),
            encoder,
            store: None,
            counters: Mutex::new((0, 0)),
            clock: system_clock(),
        }
    }

    /// Attach a persistent store for write-through and re-hydration.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    fn ttl(&self) -> Duration {
        Duration::milliseconds(self.config.ttl_ms as i64)
    }

    fn record(&self, hit: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if hit {
            counters.0 += 1;
        } else {
            counters.1 += 1;
        }
    }

    /// Look up a prompt for a model.
    ///
    /// Tries, in order: exact memory hit, exact persistent hit (re-hydrating
    /// the memory layer), then the similarity layer scoped to the same
    /// model. Expired entries encountered along the way are reaped.
    pub async fn lookup(&self, prompt: &str, model: &str) -> Option<CacheHit> {
        let normalized = normalize(prompt);
        let key = hash_key(&normalized, model);
        let now = (self.clock)();
        let ttl = self.ttl();

        // Exact memory layer
        {
            let mut inner = self.inner.write().await;
            if let Some(entry) = inner.entries.get(&key) {
                if entry.is_expired(ttl, now) {
                    inner.entries.remove(&key);
                    inner.vectors.remove(&key);
                } else {
                    let updated = entry.touched(now);
                    inner.entries.insert(key.clone(), updated.clone());
                    self.record(true);
                    return Some(CacheHit {
                        entry: updated,
                        match_type: MatchType::Exact,
                        similarity: 1.0,
                    });
                }
            }
        }

        // Exact persistent layer, re-hydrating memory on hit
        if let Some(store) = &self.store {
            let store_key = format!("cache:{key}");
            if let Ok(Some(json)) = store.get(&store_key).await {
                if let Ok(entry) = serde_json::from_str::<CacheEntry>(&json) {
                    if !entry.is_expired(ttl, now) {
                        let updated = entry.touched(now);
                        let mut inner = self.inner.write().await;
                        if let Some(encoder) = &self.encoder {
                            inner
                                .vectors
                                .insert(key.clone(), encoder.encode(&updated.normalized_prompt));
                        }
                        inner.entries.insert(key.clone(), updated.clone());
                        self.evict_over_cap(&mut inner);
                        self.record(true);
                        return Some(CacheHit {
                            entry: updated,
                            match_type: MatchType::Exact,
                            similarity: 1.0,
                        });
                    }
                    let _ = store.delete(&store_key).await;
                }
            }
        }

        // Similarity layer over the memory entries of the same model
        let fuzzy = self.fuzzy_lookup(&normalized, model, now, ttl).await;
        self.record(fuzzy.is_some());
        fuzzy
    }

    async fn fuzzy_lookup(
        &self,
        normalized: &str,
        model: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<CacheHit> {
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(ttl, now))
            .map(|e| e.key.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            inner.vectors.remove(&key);
        }

        let (best_key, best_score) = match &self.encoder {
            Some(encoder) => {
                let query = encoder.encode(normalized);
                let mut best: Option<(String, f64)> = None;
                for (key, vector) in &inner.vectors {
                    let score = HolographicEncoder::similarity(&query, vector);
                    if best.as_ref().map_or(true, |(_, s)| score > *s) {
                        best = Some((key.clone(), score));
                    }
                }
                // Reconcile the vector match back to a live entry of the
                // same model before accepting it.
                let (key, score) = best?;
                let entry = inner.entries.get(&key)?;
                if entry.model != model {
                    return None;
                }
                (key, score)
            }
            None => {
                let mut best: Option<(String, f64)> = None;
                for entry in inner.entries.values().filter(|e| e.model == model) {
                    let score = dice_coefficient(normalized, &entry.normalized_prompt);
                    if best.as_ref().map_or(true, |(_, s)| score > *s) {
                        best = Some((entry.key.clone(), score));
                    }
                }
                best?
            }
        };

        if best_score < self.config.similarity_threshold {
            return None;
        }

        let entry = inner.entries.get(&best_key)?;
        let updated = entry.touched(now);
        inner.entries.insert(best_key, updated.clone());
        Some(CacheHit {
            entry: updated,
            match_type: MatchType::Fuzzy,
            similarity: best_score,
        })
    }

    /// Upsert a response, evicting the least-recently-accessed entry when
    /// the cap is exceeded. Persistent writes are best-effort.
    pub async fn store(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let normalized = normalize(prompt);
        let key = hash_key(&normalized, model);
        let now = (self.clock)();

        let entry = CacheEntry {
            key: key.clone(),
            normalized_prompt: normalized.clone(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            created_at: now,
            access_count: 0,
            last_accessed: now,
        };

        {
            let mut inner = self.inner.write().await;
            if let Some(encoder) = &self.encoder {
                inner.vectors.insert(key.clone(), encoder.encode(&normalized));
            }
            inner.entries.insert(key.clone(), entry.clone());
            self.evict_over_cap(&mut inner);
        }

        if self.config.persist {
            if let Some(store) = &self.store {
                match serde_json::to_string(&entry) {
                    Ok(json) => {
                        if let Err(err) = store.set(&format!("cache:{key}"), &json).await {
                            tracing::debug!(%err, "cache persist failed");
                        }
                    }
                    Err(err) => tracing::debug!(%err, "cache entry serialize failed"),
                }
            }
        }
    }

    fn evict_over_cap(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.config.max_entries {
            let Some(oldest) = inner
                .entries
                .values()
                .min_by_key(|e| e.last_accessed)
                .map(|e| e.key.clone())
            else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.vectors.remove(&oldest);
        }
    }

    /// Number of live in-memory entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Whether the memory layer is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Drop all in-memory entries.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.vectors.clear();
    }

    /// Hit/miss counters plus the live entry count.
    pub async fn stats(&self) -> CacheStats {
        let entry_count = self.inner.read().await.entries.len();
        let (hits, misses) = *self.counters.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits,
            misses,
            entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::ManualClock;
    use crate::persist::MemoryStore;
    use pretty_assertions::assert_eq;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_store_then_exact_lookup() {
        let cache = cache();
        cache
            .store(
                "How do I configure my database connection?",
                "Use a connection string.",
                "gpt-4o",
                10,
                20,
            )
            .await;

        let hit = cache
            .lookup("How do I configure my database connection?", "gpt-4o")
            .await
            .expect("expected a hit");
        assert_eq!(hit.match_type, MatchType::Exact);
        assert!(hit.similarity >= 0.8);
        assert_eq!(hit.entry.response, "Use a connection string.");
        assert_eq!(hit.entry.access_count, 1);
    }

    #[tokio::test]
    async fn test_model_scoping_prevents_cross_contamination() {
        let cache = cache();
        cache.store("What is TypeScript?", "A language.", "gpt-4o", 5, 5).await;

        assert!(cache.lookup("What is TypeScript?", "gpt-4o-mini").await.is_none());
        assert!(cache.lookup("What is TypeScript?", "gpt-4o").await.is_some());
    }

    #[tokio::test]
    async fn test_fuzzy_lookup_over_normalized_text() {
        let cache = cache();
        cache
            .store(
                "How do I configure my database connection?",
                "Use a connection string.",
                "gpt-4o",
                10,
                20,
            )
            .await;

        // The plural drops it below exact-key equality but well above the
        // similarity threshold.
        let hit = cache
            .lookup("How do I configure my database connections?", "gpt-4o")
            .await
            .expect("expected fuzzy hit");
        assert_eq!(hit.match_type, MatchType::Fuzzy);
        assert!(hit.similarity >= 0.85);
        assert!(hit.similarity < 1.0);
        assert_eq!(hit.entry.response, "Use a connection string.");
    }

    #[tokio::test]
    async fn test_unrelated_prompt_misses() {
        let cache = cache();
        cache.store("What is TypeScript?", "A language.", "gpt-4o", 5, 5).await;
        assert!(cache.lookup("Tell me a joke about cats", "gpt-4o").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reaps_at_read() {
        let clock = ManualClock::new();
        let cache = ResponseCache::new(CacheConfig {
            ttl_ms: 1_000,
            ..CacheConfig::default()
        })
        .with_clock(clock.clock_fn());

        cache.store("hello there", "hi", "gpt-4o", 1, 1).await;
        assert!(cache.lookup("hello there", "gpt-4o").await.is_some());

        clock.advance(chrono::Duration::milliseconds(1_001));
        assert!(cache.lookup("hello there", "gpt-4o").await.is_none());
        // Reaped on encounter
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_cap() {
        let clock = ManualClock::new();
        let cache = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        })
        .with_clock(clock.clock_fn());

        cache.store("first prompt", "r1", "gpt-4o", 1, 1).await;
        clock.advance(chrono::Duration::seconds(1));
        cache.store("second prompt", "r2", "gpt-4o", 1, 1).await;
        clock.advance(chrono::Duration::seconds(1));

        // Touch the first so the second becomes least-recently-accessed.
        assert!(cache.lookup("first prompt", "gpt-4o").await.is_some());
        clock.advance(chrono::Duration::seconds(1));

        cache.store("third prompt", "r3", "gpt-4o", 1, 1).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.lookup("second prompt", "gpt-4o").await.is_none());
        assert!(cache.lookup("first prompt", "gpt-4o").await.is_some());
        assert!(cache.lookup("third prompt", "gpt-4o").await.is_some());
    }

    #[tokio::test]
    async fn test_access_counts_are_monotonic() {
        let cache = cache();
        cache.store("hello world", "hi", "gpt-4o", 1, 1).await;

        let mut last = 0;
        for _ in 0..5 {
            let hit = cache.lookup("hello world", "gpt-4o").await.unwrap();
            assert!(hit.entry.access_count > last);
            last = hit.entry.access_count;
        }
    }

    #[tokio::test]
    async fn test_persistent_rehydration() {
        let store = Arc::new(MemoryStore::new());

        {
            let cache = ResponseCache::new(CacheConfig {
                persist: true,
                ..CacheConfig::default()
            })
            .with_store(Arc::clone(&store) as Arc<dyn KvStore>);
            cache.store("persisted prompt", "saved", "gpt-4o", 3, 4).await;
        }

        // A fresh cache with an empty memory layer finds the entry in the
        // store and re-hydrates memory.
        let cache = ResponseCache::new(CacheConfig {
            persist: true,
            ..CacheConfig::default()
        })
        .with_store(Arc::clone(&store) as Arc<dyn KvStore>);

        let hit = cache.lookup("persisted prompt", "gpt-4o").await.unwrap();
        assert_eq!(hit.entry.response, "saved");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_holographic_strategy_end_to_end() {
        let cache = ResponseCache::new(CacheConfig {
            encoding_strategy: EncodingStrategy::Holographic,
            similarity_threshold: 0.8,
            ..CacheConfig::default()
        });

        cache
            .store(
                "How do I configure my database connection?",
                "Use a connection string.",
                "gpt-4o",
                10,
                20,
            )
            .await;

        let hit = cache
            .lookup("How do I configure my database connections?", "gpt-4o")
            .await
            .expect("expected holographic hit");
        assert_eq!(hit.match_type, MatchType::Fuzzy);
        assert!(hit.similarity >= 0.8);

        // Vector matches never cross models.
        assert!(cache
            .lookup("How do I configure my database connections?", "gpt-4o-mini")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = cache();
        cache.store("alpha beta gamma", "r", "gpt-4o", 1, 1).await;
        cache.lookup("alpha beta gamma", "gpt-4o").await;
        cache.lookup("totally different text", "gpt-4o").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}

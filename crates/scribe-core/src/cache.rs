//! TTL cache for search results with oldest-first eviction, transparent
//! compression of large payloads and optional persistence.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use parking_lot::Mutex;
use scribe_compress::{decompress_any, Codec, Compressed, Compressor, GzipCompressor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::kv::KvStore;

/// Key used for the persisted cache image in the durable store.
pub const PERSIST_KEY: &str = "scribe.query_cache";
const PERSIST_VERSION: u32 = 1;

/// Deterministic key for `(query, exclusion tags)`; tag order and duplicates
/// do not matter.
pub fn cache_key(query: &str, exclude_tags: &[String]) -> String {
    let tags: BTreeSet<&str> = exclude_tags.iter().map(String::as_str).collect();
    json!([query, tags]).to_string()
}

#[derive(Debug, Clone)]
enum Payload {
    Raw(Value),
    Compressed(Compressed),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Payload,
    inserted_at_ms: u64,
    /// Insertion order; breaks ties between entries set in the same millisecond.
    seq: u64,
    /// Bytes held in memory for this entry.
    size: usize,
    /// Serialized size before compression.
    original_size: usize,
}

impl CacheEntry {
    fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Compressed(_))
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    next_seq: u64,
}

impl CacheState {
    fn insert(&mut self, key: String, mut entry: CacheEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, entry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub compressed: usize,
    pub memory_bytes: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PersistedPayload {
    Raw {
        value: Value,
    },
    Compressed {
        codec: Codec,
        data: String,
        original_len: usize,
    },
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    inserted_at_ms: u64,
    #[serde(default)]
    seq: u64,
    original_size: usize,
    payload: PersistedPayload,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<PersistedEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct QueryCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    compressor: Arc<dyn Compressor>,
    kv: Option<Arc<dyn KvStore>>,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            compressor: Arc::new(GzipCompressor::default()),
            kv: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.inserted_at_ms) > self.config.max_age_ms
    }

    pub fn get(&self, query: &str, exclude_tags: &[String]) -> Option<Value> {
        let key = cache_key(query, exclude_tags);
        let now = self.clock.now_ms();
        let payload = {
            let mut state = self.state.lock();
            let expired = match state.entries.get(&key) {
                None => {
                    state.misses += 1;
                    return None;
                }
                Some(entry) => self.is_expired(entry, now),
            };
            if expired {
                state.entries.remove(&key);
                state.evictions += 1;
                state.misses += 1;
                debug!(%key, "cache entry expired");
                return None;
            }
            state.hits += 1;
            state.entries.get(&key).map(|entry| entry.payload.clone())?
        };
        match payload {
            Payload::Raw(value) => Some(value),
            Payload::Compressed(blob) => match inflate(&blob) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(%key, error = %err, "dropping undecodable cache entry");
                    let mut state = self.state.lock();
                    state.entries.remove(&key);
                    state.hits = state.hits.saturating_sub(1);
                    state.misses += 1;
                    None
                }
            },
        }
    }

    pub fn set(&self, query: &str, exclude_tags: &[String], value: Value) {
        let key = cache_key(query, exclude_tags);
        let serialized = value.to_string().into_bytes();
        let original_size = serialized.len();
        let entry = if original_size > self.config.compression_threshold {
            match self.compressor.compress(&serialized) {
                Ok(blob) => CacheEntry {
                    size: blob.payload.len(),
                    payload: Payload::Compressed(blob),
                    inserted_at_ms: self.clock.now_ms(),
                    seq: 0,
                    original_size,
                },
                Err(err) => {
                    warn!(%key, error = %err, "compression failed; caching raw");
                    raw_entry(value, original_size, self.clock.now_ms())
                }
            }
        } else {
            raw_entry(value, original_size, self.clock.now_ms())
        };
        debug!(
            %key,
            size = entry.size,
            compressed = entry.is_compressed(),
            "cache set"
        );
        self.state.lock().insert(key, entry);
        self.maintain();
    }

    /// Drop expired entries, then evict oldest-inserted entries until the
    /// cache fits `max_size`.
    pub fn maintain(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !self.is_expired(entry, now));
        let expired = before - state.entries.len();
        state.evictions += expired as u64;

        let mut evicted = 0u64;
        while state.entries.len() > self.config.max_size {
            let oldest = state
                .entries
                .iter()
                .min_by(|a, b| {
                    (a.1.inserted_at_ms, a.1.seq).cmp(&(b.1.inserted_at_ms, b.1.seq))
                })
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        state.evictions += evicted;
        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, size = state.entries.len(), "cache maintained");
        }
    }

    pub fn invalidate(&self, query: &str, exclude_tags: &[String]) -> bool {
        let key = cache_key(query, exclude_tags);
        self.state.lock().entries.remove(&key).is_some()
    }

    /// Drop every entry; counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        if dropped > 0 {
            debug!(dropped, "cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            compressed: state.entries.values().filter(|e| e.is_compressed()).count(),
            memory_bytes: state
                .entries
                .iter()
                .map(|(key, entry)| key.len() + entry.size)
                .sum(),
        }
    }

    /// Write entries and counters to the durable store. `false` when no store
    /// is configured.
    pub async fn persist(&self) -> Result<bool> {
        let Some(kv) = self.kv.clone() else {
            return Ok(false);
        };
        let image = {
            let state = self.state.lock();
            PersistedCache {
                version: PERSIST_VERSION,
                entries: state
                    .entries
                    .iter()
                    .map(|(key, entry)| PersistedEntry {
                        key: key.clone(),
                        inserted_at_ms: entry.inserted_at_ms,
                        seq: entry.seq,
                        original_size: entry.original_size,
                        payload: match &entry.payload {
                            Payload::Raw(value) => PersistedPayload::Raw {
                                value: value.clone(),
                            },
                            Payload::Compressed(blob) => PersistedPayload::Compressed {
                                codec: blob.codec,
                                data: B64.encode(&blob.payload),
                                original_len: blob.original_len,
                            },
                        },
                    })
                    .collect(),
                hits: state.hits,
                misses: state.misses,
                evictions: state.evictions,
            }
        };
        let bytes = serde_json::to_vec(&image).context("serialize cache image")?;
        kv.write(PERSIST_KEY, &bytes)
            .await
            .context("write cache image")?;
        debug!(entries = image.entries.len(), bytes = bytes.len(), "cache persisted");
        Ok(true)
    }

    /// Replace the in-memory state with the persisted image. `false` when no
    /// store is configured or nothing was persisted yet.
    pub async fn restore(&self) -> Result<bool> {
        let Some(kv) = self.kv.clone() else {
            return Ok(false);
        };
        let Some(bytes) = kv.read(PERSIST_KEY).await.context("read cache image")? else {
            return Ok(false);
        };
        let image: PersistedCache =
            serde_json::from_slice(&bytes).context("parse cache image")?;
        if image.version != PERSIST_VERSION {
            warn!(version = image.version, "ignoring cache image with unknown version");
            return Ok(false);
        }
        let mut items = image.entries;
        items.sort_by_key(|item| (item.inserted_at_ms, item.seq));
        let mut fresh = CacheState {
            hits: image.hits,
            misses: image.misses,
            evictions: image.evictions,
            ..CacheState::default()
        };
        for item in items {
            let entry = match item.payload {
                PersistedPayload::Raw { value } => CacheEntry {
                    size: item.original_size,
                    payload: Payload::Raw(value),
                    inserted_at_ms: item.inserted_at_ms,
                    seq: 0,
                    original_size: item.original_size,
                },
                PersistedPayload::Compressed {
                    codec,
                    data,
                    original_len,
                } => {
                    let payload = B64
                        .decode(data.as_bytes())
                        .with_context(|| format!("decode cache entry {}", item.key))?;
                    CacheEntry {
                        size: payload.len(),
                        payload: Payload::Compressed(Compressed {
                            codec,
                            payload: payload.into(),
                            original_len,
                        }),
                        inserted_at_ms: item.inserted_at_ms,
                        seq: 0,
                        original_size: item.original_size,
                    }
                }
            };
            fresh.insert(item.key, entry);
        }
        *self.state.lock() = fresh;
        self.maintain();
        debug!(entries = self.len(), "cache restored");
        Ok(true)
    }
}

fn raw_entry(value: Value, size: usize, now: u64) -> CacheEntry {
    CacheEntry {
        payload: Payload::Raw(value),
        inserted_at_ms: now,
        seq: 0,
        size,
        original_size: size,
    }
}

fn inflate(blob: &Compressed) -> Result<Value> {
    let bytes = decompress_any(blob)?;
    Ok(serde_json::from_slice(&bytes)?)
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Operations cache: fingerprint+fold keyed store of fitted artifacts
//!
//! The cache is the only shared mutable resource across concurrent
//! candidate evaluators. The index and eviction bookkeeping sit behind one
//! exclusive lock; artifacts themselves are immutable once inserted and are
//! handed out as [`Arc`] clones, so a retrieved artifact stays valid for the
//! reader even if eviction removes the entry a moment later.
//!
//! `put` is insert-or-ignore: the first writer for a key wins and every
//! later writer gets the winning artifact back. Fitted artifacts for an
//! identical structure+fold are assumed equivalent, so concurrent duplicate
//! computation is wasted work, never a correctness violation.
//!
//! The cache can be persisted between runs as a stream of length-prefixed,
//! CRC-guarded bincode records. Loading tolerates corrupt or truncated
//! records: they are logged and treated as misses, never as a run failure.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pipeline::FittedOperation;

/// File magic for the persisted cache format.
const MAGIC: &[u8; 8] = b"DEVCACH1";

/// Per-record framing overhead: CRC32 (4 bytes) + length (8 bytes).
const RECORD_HEADER_BYTES: usize = 12;

/// Upper bound on a single persisted record. A declared length beyond this
/// means the length field itself is corrupt, so the rest of the file cannot
/// be framed reliably.
const MAX_RECORD_BYTES: u64 = 64 * 1024 * 1024;

/// Key of one cached fit: the structural fingerprint of the (sub)pipeline a
/// node depends on, scoped to one cross-validation fold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    fingerprint: String,
    fold: Option<u32>,
}

impl CacheKey {
    /// Key from a precomputed fingerprint.
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, fold: Option<u32>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            fold,
        }
    }

    /// Key derived from a descriptive id
    /// (see [`Graph::node_descriptive_id`](crate::graph::Graph::node_descriptive_id)).
    ///
    /// The id is hashed so keys stay fixed-size no matter how deep the
    /// pipeline is; BLAKE3 keeps the derivation deterministic across runs.
    #[must_use]
    pub fn for_descriptive_id(descriptive_id: &str, fold: Option<u32>) -> Self {
        Self {
            fingerprint: blake3::hash(descriptive_id.as_bytes()).to_hex().to_string(),
            fold,
        }
    }

    /// The structural fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The fold this entry is scoped to.
    #[must_use]
    pub fn fold(&self) -> Option<u32> {
        self.fold
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned an artifact.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries evicted to stay within the byte budget.
    pub evictions: u64,
}

impl CacheStats {
    /// Share of lookups served from the cache, in `[0.0, 1.0]`. Zero when no
    /// lookups happened yet.
    #[must_use]
    pub fn effectiveness_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Why a persisted record was rejected during load. Recovered locally as a
/// cache miss; never surfaced to the caller.
#[derive(Debug, thiserror::Error)]
enum CacheCorruptionError {
    #[error("record checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("record is truncated ({available} of {declared} bytes available)")]
    Truncated { declared: u64, available: u64 },
    #[error("record length {declared} exceeds the {MAX_RECORD_BYTES}-byte limit")]
    Oversized { declared: u64 },
    #[error("record failed to decode: {0}")]
    Decode(#[from] bincode::Error),
}

impl CacheCorruptionError {
    /// Whether framing is still trustworthy past this record. A checksum or
    /// decode failure is local to one record; a truncated or implausible
    /// length means the rest of the file cannot be walked.
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Decode(_))
    }
}

struct CacheIndex {
    entries: LruCache<CacheKey, Arc<FittedOperation>>,
    total_bytes: u64,
}

/// Concurrent fingerprint+fold → fitted-artifact store with LRU eviction
/// over a cumulative byte budget.
///
/// # Example
///
/// ```rust
/// use dashevolve::{CacheKey, FittedOperation, OperationsCache};
///
/// let cache = OperationsCache::new();
/// let key = CacheKey::new("fp", Some(0));
///
/// assert!(cache.get(&key).is_none());
/// cache.put(key.clone(), FittedOperation::new("rf", vec![1, 2, 3]));
/// assert!(cache.contains(&key));
/// ```
pub struct OperationsCache {
    index: Mutex<CacheIndex>,
    max_bytes: Option<u64>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl OperationsCache {
    /// Cache without a byte budget: entries live for the whole run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: Mutex::new(CacheIndex {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache with a cumulative byte budget; least-recently-used entries are
    /// evicted once the budget is exceeded.
    ///
    /// A single artifact larger than the whole budget is still admitted (as
    /// the only entry) - refusing it would disable caching for exactly the
    /// fits that are most expensive to repeat.
    ///
    /// # Panics
    ///
    /// Panics if `max_bytes` is 0.
    // Panicking constructor with documented behavior; use try_with_max_bytes() for the fallible version
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self::try_with_max_bytes(max_bytes).expect("max_bytes must be greater than 0")
    }

    /// Fallible variant of [`OperationsCache::with_max_bytes`].
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `max_bytes` is 0.
    pub fn try_with_max_bytes(max_bytes: u64) -> Result<Self> {
        if max_bytes == 0 {
            return Err(Error::configuration(
                "operations cache byte budget must be greater than 0",
            ));
        }
        let mut cache = Self::new();
        cache.max_bytes = Some(max_bytes);
        Ok(cache)
    }

    /// Look up a cached artifact. Refreshes the entry's recency on hit.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<FittedOperation>> {
        let mut index = self.index.lock();
        match index.entries.get(key) {
            Some(artifact) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = key.fingerprint(), fold = ?key.fold(), "cache hit");
                Some(Arc::clone(artifact))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = key.fingerprint(), fold = ?key.fold(), "cache miss");
                None
            }
        }
    }

    /// Existence probe without touching recency or counters.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().entries.peek(key).is_some()
    }

    /// Insert-or-ignore: when an equal key is already present the existing
    /// entry wins and is returned; otherwise `artifact` is inserted. Either
    /// way the caller gets the artifact every evaluator will observe for
    /// this key.
    pub fn put(&self, key: CacheKey, artifact: FittedOperation) -> Arc<FittedOperation> {
        let mut index = self.index.lock();
        if let Some(existing) = index.entries.peek(&key) {
            debug!(fingerprint = key.fingerprint(), fold = ?key.fold(), "cache put ignored: first writer wins");
            return Arc::clone(existing);
        }
        let artifact = Arc::new(artifact);
        index.total_bytes += artifact.weight();
        index.entries.push(key, Arc::clone(&artifact));
        if let Some(max_bytes) = self.max_bytes {
            while index.total_bytes > max_bytes && index.entries.len() > 1 {
                match index.entries.pop_lru() {
                    Some((evicted_key, evicted)) => {
                        index.total_bytes -= evicted.weight();
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(fingerprint = evicted_key.fingerprint(), "cache evicted LRU entry");
                    }
                    None => break,
                }
            }
        }
        artifact
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.lock().entries.is_empty()
    }

    /// Cumulative weight of the cached artifacts, in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    /// Snapshot of the hit/miss/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Persist every entry to `path`, atomically (temp file + rename).
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] on filesystem failures, [`Error::Serialization`] when a
    /// record cannot be encoded.
    pub fn save(&self, path: &Path) -> Result<usize> {
        // Oldest first, so sequential puts on load rebuild the recency order.
        let records: Vec<(CacheKey, FittedOperation)> = {
            let index = self.index.lock();
            index
                .entries
                .iter()
                .map(|(key, artifact)| (key.clone(), (**artifact).clone()))
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect()
        };
        let mut buffer = MAGIC.to_vec();
        for record in &records {
            let bytes = bincode::serialize(record).map_err(|err| {
                Error::serialization(format!("cache record for '{}': {err}", record.0.fingerprint()))
            })?;
            buffer.extend_from_slice(&crc32fast::hash(&bytes).to_le_bytes());
            buffer.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            buffer.extend_from_slice(&bytes);
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buffer)?;
        fs::rename(&tmp, path)?;
        debug!(records = records.len(), path = %path.display(), "cache saved");
        Ok(records.len())
    }

    /// Load persisted entries from `path`, merging them with
    /// first-writer-wins semantics. Unreadable, corrupt, or truncated
    /// records are logged and skipped - a damaged cache degrades to misses,
    /// it never aborts the run. Returns the number of records loaded.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] only when the file exists but cannot be read at all.
    pub fn load(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let data = fs::read(path)?;
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            warn!(path = %path.display(), "cache file has an unrecognized header; starting cold");
            return Ok(0);
        }
        let mut offset = MAGIC.len();
        let mut loaded = 0usize;
        while offset < data.len() {
            match Self::read_record(&data, &mut offset) {
                Ok((key, artifact)) => {
                    self.put(key, artifact);
                    loaded += 1;
                }
                Err(err) if err.is_recoverable() => {
                    warn!(%err, "skipping corrupt cache record");
                }
                Err(err) => {
                    warn!(%err, "stopping cache load early");
                    break;
                }
            }
        }
        debug!(records = loaded, path = %path.display(), "cache loaded");
        Ok(loaded)
    }

    /// Decode one framed record at `*offset`, advancing the offset past the
    /// record whenever the declared length is plausible (so a bad record can
    /// be skipped without losing the rest of the file).
    fn read_record(
        data: &[u8],
        offset: &mut usize,
    ) -> std::result::Result<(CacheKey, FittedOperation), CacheCorruptionError> {
        let remaining = data.len() - *offset;
        if remaining < RECORD_HEADER_BYTES {
            return Err(CacheCorruptionError::Truncated {
                declared: RECORD_HEADER_BYTES as u64,
                available: remaining as u64,
            });
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&data[*offset..*offset + 4]);
        let stored = u32::from_le_bytes(crc_bytes);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[*offset + 4..*offset + RECORD_HEADER_BYTES]);
        let declared = u64::from_le_bytes(len_bytes);
        if declared > MAX_RECORD_BYTES {
            return Err(CacheCorruptionError::Oversized { declared });
        }
        let body_start = *offset + RECORD_HEADER_BYTES;
        let available = (data.len() - body_start) as u64;
        if declared > available {
            return Err(CacheCorruptionError::Truncated { declared, available });
        }
        let body = &data[body_start..body_start + declared as usize];
        *offset = body_start + declared as usize;
        let computed = crc32fast::hash(body);
        if computed != stored {
            return Err(CacheCorruptionError::ChecksumMismatch { stored, computed });
        }
        Ok(bincode::deserialize(body)?)
    }
}

impl Default for OperationsCache {
    fn default() -> Self {
        Self::new()
    }
}

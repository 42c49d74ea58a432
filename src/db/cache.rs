//! Bounded LRU cache keyed by query fingerprint.
//!
//! Queries that differ only by literal values share a fingerprint, so
//! `SELECT * FROM t WHERE id = 1` and `select *  from t where id = 42` hit the
//! same entry.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 1000;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static NUMERIC_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?(?:E[+-]?\d+)?\b").unwrap());

/// Normalize `sql` and hash it.
///
/// Whitespace is collapsed, text uppercased, and quoted string and numeric
/// literals replaced with `?` before hashing with SHA-256.
pub fn fingerprint(sql: &str) -> String {
    let normalized = normalize(sql);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(sql: &str) -> String {
    let upper = sql.trim().to_uppercase();
    let collapsed = WHITESPACE.replace_all(&upper, " ");
    let no_strings = STRING_LITERAL.replace_all(&collapsed, "?");
    NUMERIC_LITERAL.replace_all(&no_strings, "?").into_owned()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

pub struct PlanCache<V> {
    entries: Mutex<LruCache<String, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> PlanCache<V> {
    /// Returns `None` for a zero capacity.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, V>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up the entry for `sql`, marking it most recently used.
    pub fn get(&self, sql: &str) -> Option<V> {
        let key = fingerprint(sql);
        let found = self.lock().get(&key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, sql: &str, value: V) {
        let key = fingerprint(sql);
        if let Some((evicted, _)) = self.lock().push(key.clone(), value) {
            if evicted != key {
                debug!(fingerprint = %evicted, "evicted plan cache entry");
            }
        }
    }

    /// Drop the entry for `sql`. Returns whether one existed.
    pub fn invalidate(&self, sql: &str) -> bool {
        let key = fingerprint(sql);
        self.lock().pop(&key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (capacity, len) = {
            let entries = self.lock();
            (entries.cap().get(), entries.len())
        };
        CacheStats {
            capacity,
            len,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

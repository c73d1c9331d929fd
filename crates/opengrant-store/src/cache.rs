//! Scope and property parse cache.
//!
//! Authorization and token rows persist their scope lists and property maps
//! as compact JSON text. Protocol engines read those fields far more often
//! than they change, so the parsed form is memoized here, keyed by
//! `(entity kind, raw JSON text)`.
//!
//! The cache is a latency optimization only: a miss re-derives the identical
//! value from the raw text, and concurrent misses for the same key may
//! recompute independently. Entries expire on a sliding TTL and are evicted
//! eagerly once the capacity bound is reached.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::StoreResult;

// =============================================================================
// Types
// =============================================================================

/// The entity kind a cached parse belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Authorization rows.
    Authorization,
    /// Token rows.
    Token,
}

/// Parsed scope list, ordered as stored.
pub type ScopeList = Arc<Vec<String>>;

/// Parsed property map.
pub type PropertyMap = Arc<BTreeMap<String, serde_json::Value>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Scopes(EntityKind, String),
    Properties(EntityKind, String),
}

#[derive(Clone)]
enum Parsed {
    Scopes(ScopeList),
    Properties(PropertyMap),
}

struct Entry {
    value: Parsed,
    /// Unix nanoseconds of the last hit; refreshed on every access.
    touched: AtomicI64,
}

impl Entry {
    fn new(value: Parsed, now: i64) -> Self {
        Self {
            value,
            touched: AtomicI64::new(now),
        }
    }
}

fn now_nanos() -> i64 {
    // Truncation is safe until year ~2262.
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

// =============================================================================
// Parse Cache
// =============================================================================

/// Memoization layer for scope-list and property-map JSON parses.
pub struct ParseCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    ttl_nanos: i64,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ParseCache {
    /// Create a cache with the given sliding TTL and capacity bound.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_nanos: i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Parse a JSON-encoded scope array, memoized.
    ///
    /// Absent or empty raw text yields an empty list without touching the
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns a `Serialization` error if the raw text is not a JSON array
    /// of strings.
    pub fn scopes(&self, kind: EntityKind, raw: Option<&str>) -> StoreResult<ScopeList> {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Ok(Arc::new(Vec::new()));
        };

        let key = CacheKey::Scopes(kind, raw.to_owned());
        if let Some(Parsed::Scopes(list)) = self.lookup(&key) {
            return Ok(list);
        }

        let parsed: Vec<String> = serde_json::from_str(raw)?;
        let list: ScopeList = Arc::new(parsed);
        self.store(key, Parsed::Scopes(Arc::clone(&list)));
        Ok(list)
    }

    /// Parse a JSON-encoded property object, memoized.
    ///
    /// Absent or empty raw text yields an empty map without touching the
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns a `Serialization` error if the raw text is not a JSON object.
    pub fn properties(&self, kind: EntityKind, raw: Option<&str>) -> StoreResult<PropertyMap> {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Ok(Arc::new(BTreeMap::new()));
        };

        let key = CacheKey::Properties(kind, raw.to_owned());
        if let Some(Parsed::Properties(map)) = self.lookup(&key) {
            return Ok(map);
        }

        let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)?;
        let map: PropertyMap = Arc::new(parsed);
        self.store(key, Parsed::Properties(Arc::clone(&map)));
        Ok(map)
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }

    /// Current cache statistics.
    pub fn stats(&self) -> ParseCacheStats {
        ParseCacheStats {
            entries: self.entries.read().expect("cache lock poisoned").len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Parsed> {
        let now = now_nanos();
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(key)?;
        if now - entry.touched.load(Ordering::Relaxed) >= self.ttl_nanos {
            // Expired; removal is left to the next insert sweep, and the
            // recompute path records the miss.
            return None;
        }
        entry.touched.store(now, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    fn store(&self, key: CacheKey, value: Parsed) {
        let now = now_nanos();
        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().expect("cache lock poisoned");

        if entries.len() >= self.capacity {
            let before = entries.len();
            entries.retain(|_, e| now - e.touched.load(Ordering::Relaxed) < self.ttl_nanos);
            if entries.len() >= self.capacity {
                // Still full of live entries; drop the stalest one.
                let stalest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.touched.load(Ordering::Relaxed))
                    .map(|(k, _)| k.clone());
                if let Some(stalest) = stalest {
                    entries.remove(&stalest);
                }
            }
            let evicted = (before - entries.len()) as u64;
            if evicted > 0 {
                self.evictions.fetch_add(evicted, Ordering::Relaxed);
                tracing::trace!(evicted, remaining = entries.len(), "parse cache swept");
            }
        }

        entries.insert(key, Entry::new(value, now));
    }
}

impl std::fmt::Debug for ParseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ParseCache")
            .field("entries", &stats.entries)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Statistics about the parse cache.
#[derive(Debug, Clone, Copy)]
pub struct ParseCacheStats {
    /// Live entries, including not-yet-swept expired ones.
    pub entries: usize,
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses, including expired entries.
    pub misses: u64,
    /// Entries removed by capacity sweeps.
    pub evictions: u64,
}

// =============================================================================
// Field Encodings
// =============================================================================

/// Encode a scope list as compact UTF-8 JSON.
///
/// An empty list clears the backing field. serde_json emits permissive
/// escaping, so non-ASCII scope names pass through unescaped.
///
/// # Errors
///
/// Returns a `Serialization` error if encoding fails.
pub fn encode_scopes(scopes: &[String]) -> StoreResult<Option<String>> {
    if scopes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(scopes)?))
}

/// Encode a property map as compact UTF-8 JSON.
///
/// An empty map clears the backing field.
///
/// # Errors
///
/// Returns a `Serialization` error if encoding fails.
pub fn encode_properties(
    properties: &BTreeMap<String, serde_json::Value>,
) -> StoreResult<Option<String>> {
    if properties.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(properties)?))
}

//! Store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration snapshot consumed by the stores.
///
/// # Example (TOML)
///
/// ```toml
/// [store]
/// disable_bulk_operations = false
/// prune_batch_size = 1000
/// cache_ttl = "1m"
/// cache_capacity = 1024
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Administratively force the transactional fallback even when the
    /// backend advertises native set-based support.
    pub disable_bulk_operations: bool,

    /// Upper bound on rows processed by one prune or revoke batch.
    pub prune_batch_size: usize,

    /// Sliding expiration for cached scope/property parses.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Capacity bound for the parse cache.
    pub cache_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            disable_bulk_operations: false,
            prune_batch_size: 1000,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1024,
        }
    }
}

impl StoreOptions {
    /// Options forcing the transactional fallback path.
    #[must_use]
    pub fn without_bulk_operations() -> Self {
        Self {
            disable_bulk_operations: true,
            ..Default::default()
        }
    }
}

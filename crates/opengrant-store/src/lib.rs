//! # opengrant-store
//!
//! Persistence and lifecycle management for OAuth2/OIDC authorizations and
//! tokens: creation, point and predicate lookup, soft revocation, hard
//! deletion with cascade, and scheduled pruning of stale records — under
//! optimistic concurrency, with two interchangeable execution strategies
//! for predicate mutations depending on what the backend supports
//! natively.
//!
//! The OAuth protocol engine itself (endpoints, grant handling) is an
//! external consumer of this crate; so is the scheduler driving `prune`.
//!
//! ## Modules
//!
//! - [`types`] - authorization and token records
//! - [`keys`] - identifier codec between external strings and native keys
//! - [`cache`] - memoized scope/property JSON parsing
//! - [`backend`] - the storage port implemented by backend crates
//! - [`store`] - the authorization and token stores
//! - [`uow`] - explicit per-request identity map
//! - [`config`] - store configuration snapshot
//! - [`error`] - error taxonomy
//!
//! ## Backends
//!
//! - `opengrant-store-memory` - in-memory backend
//! - `opengrant-store-postgres` - PostgreSQL backend
//!
//! ## Example
//!
//! ```ignore
//! use opengrant_store::{AuthorizationStore, StoreOptions, UnitOfWork};
//! use opengrant_store_memory::MemoryBackend;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let store = AuthorizationStore::new(backend, StoreOptions::default());
//!
//! let mut uow = UnitOfWork::new();
//! let mut record = store.instantiate()?;
//! record.subject = Some("alice".into());
//! let stored = store.create(&mut uow, record).await?;
//! ```

pub mod backend;
mod bulk;
pub mod cache;
pub mod config;
pub mod error;
pub mod keys;
pub mod store;
pub mod types;
pub mod uow;

pub use backend::{
    AuthorizationFilter, Capabilities, IsolationLevel, PruneSelector, StorageBackend,
    StorageSession, TokenFilter, authorization_is_prunable, token_is_prunable,
};
pub use cache::{EntityKind, ParseCache, ParseCacheStats, PropertyMap, ScopeList};
pub use config::StoreOptions;
pub use error::{StoreError, StoreResult};
pub use keys::{EntityKey, key_from_text, key_to_text, optional_key_to_text};
pub use store::{AuthorizationStore, TokenStore};
pub use types::{AuthorizationRecord, DefaultFactory, RecordFactory, TokenRecord, kinds, statuses};
pub use uow::UnitOfWork;

//! In-memory storage backend for OpenGrant Store.
//!
//! Rows live in ordered maps behind async read-write locks, so `list`
//! enumeration is stable by key without extra sorting. The backend
//! advertises full native bulk support by default — set-based operations
//! run atomically under the write lock — and can be downgraded with
//! [`MemoryBackend::with_capabilities`] to exercise the transactional
//! fallback path.
//!
//! Sessions apply their writes eagerly and treat the requested isolation
//! level as a best-effort hint: every row mutation is individually guarded
//! by its concurrency token, which is enough to uphold the store
//! invariants for an in-process backend.

mod session;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::RwLock;
use uuid::Uuid;

use opengrant_store::backend::{
    AuthorizationFilter, Capabilities, IsolationLevel, PruneSelector, StorageBackend,
    StorageSession, TokenFilter, authorization_is_prunable, token_is_prunable,
};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::{AuthorizationRecord, TokenRecord, statuses};

use session::MemorySession;

pub(crate) struct Inner {
    /// Lock order: authorizations before tokens, always.
    pub(crate) authorizations: RwLock<BTreeMap<Uuid, AuthorizationRecord<Uuid>>>,
    pub(crate) tokens: RwLock<BTreeMap<Uuid, TokenRecord<Uuid>>>,
}

/// In-memory storage backend keyed by UUID.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
    capabilities: Capabilities,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend with full native bulk support.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                authorizations: RwLock::new(BTreeMap::new()),
                tokens: RwLock::new(BTreeMap::new()),
            }),
            capabilities: Capabilities::native(),
        }
    }

    /// Override the advertised capabilities, typically to force the
    /// fallback strategy in tests.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn fresh_token() -> String {
        Uuid::new_v4().to_string()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    type Key = Uuid;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    // -------------------------------------------------------------------------
    // Authorizations
    // -------------------------------------------------------------------------

    async fn count_authorizations(
        &self,
        filter: Option<&AuthorizationFilter<Uuid>>,
    ) -> StoreResult<u64> {
        let rows = self.inner.authorizations.read().await;
        let count = match filter {
            None => rows.len(),
            Some(filter) => rows.values().filter(|r| filter.matches(r)).count(),
        };
        Ok(count as u64)
    }

    async fn insert_authorization(
        &self,
        mut record: AuthorizationRecord<Uuid>,
    ) -> StoreResult<AuthorizationRecord<Uuid>> {
        let mut rows = self.inner.authorizations.write().await;
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        } else if rows.contains_key(&record.id) {
            return Err(StoreError::backend(format!(
                "authorization {} already exists",
                record.id
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn save_authorization(
        &self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let mut rows = self.inner.authorizations.write().await;
        match rows.get_mut(&record.id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                *stored = record.clone();
                Ok(())
            }
            Some(_) => Err(StoreError::concurrency(format!(
                "authorization {} was modified concurrently",
                record.id
            ))),
            None => Err(StoreError::concurrency(format!(
                "authorization {} no longer exists",
                record.id
            ))),
        }
    }

    async fn fetch_authorization(
        &self,
        id: &Uuid,
    ) -> StoreResult<Option<AuthorizationRecord<Uuid>>> {
        Ok(self.inner.authorizations.read().await.get(id).cloned())
    }

    async fn list_authorizations(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows = self.inner.authorizations.read().await;
        Ok(rows
            .values()
            .skip(offset.unwrap_or(0))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn stream_authorizations(
        &self,
        filter: AuthorizationFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<Uuid>>> {
        let inner = Arc::clone(&self.inner);
        futures_util::stream::once(async move {
            let rows = inner.authorizations.read().await;
            let matches: Vec<_> = rows
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .map(Ok)
                .collect();
            futures_util::stream::iter(matches)
        })
        .flatten()
        .boxed()
    }

    async fn revoke_authorizations(
        &self,
        filter: &AuthorizationFilter<Uuid>,
    ) -> StoreResult<u64> {
        let mut rows = self.inner.authorizations.write().await;
        let mut affected = 0u64;
        for record in rows.values_mut() {
            if filter.matches(record) && !record.has_status(statuses::REVOKED) {
                record.status = Some(statuses::REVOKED.to_string());
                record.concurrency_token = Self::fresh_token();
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn prune_authorizations(&self, selector: &PruneSelector) -> StoreResult<u64> {
        let mut rows = self.inner.authorizations.write().await;
        let tokens = self.inner.tokens.read().await;

        let prunable: Vec<Uuid> = rows
            .values()
            .filter(|record| {
                let linked = tokens
                    .values()
                    .filter(|t| t.authorization_id == Some(record.id))
                    .count() as u64;
                authorization_is_prunable(record, linked, selector.threshold)
            })
            .take(selector.limit)
            .map(|record| record.id)
            .collect();

        for id in &prunable {
            rows.remove(id);
        }
        Ok(prunable.len() as u64)
    }

    async fn delete_authorization_cascade(
        &self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<u64> {
        let mut rows = self.inner.authorizations.write().await;
        let mut tokens = self.inner.tokens.write().await;

        match rows.get(id) {
            Some(stored) if stored.concurrency_token == expected_token => {}
            Some(_) => {
                return Err(StoreError::concurrency(format!(
                    "authorization {id} was modified concurrently"
                )));
            }
            None => {
                return Err(StoreError::concurrency(format!(
                    "authorization {id} no longer exists"
                )));
            }
        }

        rows.remove(id);
        let before = tokens.len();
        tokens.retain(|_, t| t.authorization_id != Some(*id));
        Ok((before - tokens.len()) as u64)
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    async fn count_tokens(&self, filter: Option<&TokenFilter<Uuid>>) -> StoreResult<u64> {
        let rows = self.inner.tokens.read().await;
        let count = match filter {
            None => rows.len(),
            Some(filter) => rows.values().filter(|r| filter.matches(r)).count(),
        };
        Ok(count as u64)
    }

    async fn insert_token(&self, mut record: TokenRecord<Uuid>) -> StoreResult<TokenRecord<Uuid>> {
        let mut rows = self.inner.tokens.write().await;
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        } else if rows.contains_key(&record.id) {
            return Err(StoreError::backend(format!(
                "token {} already exists",
                record.id
            )));
        }
        if let Some(reference) = &record.reference_id
            && rows
                .values()
                .any(|t| t.reference_id.as_deref() == Some(reference))
        {
            return Err(StoreError::backend(format!(
                "token reference {reference:?} already exists"
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn save_token(
        &self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let mut rows = self.inner.tokens.write().await;
        match rows.get_mut(&record.id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                *stored = record.clone();
                Ok(())
            }
            Some(_) => Err(StoreError::concurrency(format!(
                "token {} was modified concurrently",
                record.id
            ))),
            None => Err(StoreError::concurrency(format!(
                "token {} no longer exists",
                record.id
            ))),
        }
    }

    async fn delete_token(&self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        let mut rows = self.inner.tokens.write().await;
        match rows.get(id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                rows.remove(id);
                Ok(())
            }
            Some(_) => Err(StoreError::concurrency(format!(
                "token {id} was modified concurrently"
            ))),
            None => Err(StoreError::concurrency(format!(
                "token {id} no longer exists"
            ))),
        }
    }

    async fn fetch_token(&self, id: &Uuid) -> StoreResult<Option<TokenRecord<Uuid>>> {
        Ok(self.inner.tokens.read().await.get(id).cloned())
    }

    async fn fetch_token_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<Uuid>>> {
        let rows = self.inner.tokens.read().await;
        Ok(rows
            .values()
            .find(|t| t.reference_id.as_deref() == Some(reference_id))
            .cloned())
    }

    async fn list_tokens(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let rows = self.inner.tokens.read().await;
        Ok(rows
            .values()
            .skip(offset.unwrap_or(0))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn stream_tokens(
        &self,
        filter: TokenFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<Uuid>>> {
        let inner = Arc::clone(&self.inner);
        futures_util::stream::once(async move {
            let rows = inner.tokens.read().await;
            let matches: Vec<_> = rows
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .map(Ok)
                .collect();
            futures_util::stream::iter(matches)
        })
        .flatten()
        .boxed()
    }

    async fn revoke_tokens(&self, filter: &TokenFilter<Uuid>) -> StoreResult<u64> {
        let mut rows = self.inner.tokens.write().await;
        let mut affected = 0u64;
        for record in rows.values_mut() {
            if filter.matches(record) && !record.has_status(statuses::REVOKED) {
                record.status = Some(statuses::REVOKED.to_string());
                record.concurrency_token = Self::fresh_token();
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn prune_tokens(&self, selector: &PruneSelector) -> StoreResult<u64> {
        let authorizations = self.inner.authorizations.read().await;
        let mut rows = self.inner.tokens.write().await;
        let now = time::OffsetDateTime::now_utc();

        let prunable: Vec<Uuid> = rows
            .values()
            .filter(|record| {
                let authorization_invalid = record
                    .authorization_id
                    .and_then(|id| authorizations.get(&id))
                    .map(|a| !a.is_valid())
                    .unwrap_or(false);
                token_is_prunable(record, authorization_invalid, selector.threshold, now)
            })
            .take(selector.limit)
            .map(|record| record.id)
            .collect();

        for id in &prunable {
            rows.remove(id);
        }
        Ok(prunable.len() as u64)
    }

    // -------------------------------------------------------------------------
    // Transactional Fallback
    // -------------------------------------------------------------------------

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> StoreResult<Box<dyn StorageSession<Key = Uuid>>> {
        tracing::trace!(?isolation, "memory session opened");
        Ok(Box::new(MemorySession::new(Arc::clone(&self.inner))))
    }
}

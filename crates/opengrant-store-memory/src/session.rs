//! Eager-apply session for the in-memory backend.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use opengrant_store::backend::{
    AuthorizationFilter, PruneSelector, StorageSession, TokenFilter, authorization_is_prunable,
    token_is_prunable,
};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::{AuthorizationRecord, TokenRecord};

use crate::Inner;

/// Session over the shared maps.
///
/// Writes are applied eagerly under each row's concurrency token, so a
/// conflicting row simply fails its own save and leaves nothing pending;
/// `commit` is a no-op. This matches the session contract: a failed row
/// never affects the rest of the batch.
pub(crate) struct MemorySession {
    inner: Arc<Inner>,
}

impl MemorySession {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    type Key = Uuid;

    async fn load_authorizations(
        &mut self,
        filter: &AuthorizationFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows = self.inner.authorizations.read().await;
        Ok(rows
            .values()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_prunable_authorizations(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows = self.inner.authorizations.read().await;
        let tokens = self.inner.tokens.read().await;
        Ok(rows
            .values()
            .filter(|record| {
                let linked = tokens
                    .values()
                    .filter(|t| t.authorization_id == Some(record.id))
                    .count() as u64;
                authorization_is_prunable(record, linked, selector.threshold)
            })
            .take(selector.limit)
            .cloned()
            .collect())
    }

    async fn load_tokens(
        &mut self,
        filter: &TokenFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let rows = self.inner.tokens.read().await;
        Ok(rows
            .values()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_prunable_tokens(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let authorizations = self.inner.authorizations.read().await;
        let rows = self.inner.tokens.read().await;
        let now = time::OffsetDateTime::now_utc();
        Ok(rows
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
            .cloned()
            .collect())
    }

    async fn save_authorization(
        &mut self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let mut rows = self.inner.authorizations.write().await;
        match rows.get_mut(&record.id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                *stored = record.clone();
                Ok(())
            }
            _ => Err(StoreError::concurrency(format!(
                "authorization {} was modified concurrently",
                record.id
            ))),
        }
    }

    async fn save_token(
        &mut self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let mut rows = self.inner.tokens.write().await;
        match rows.get_mut(&record.id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                *stored = record.clone();
                Ok(())
            }
            _ => Err(StoreError::concurrency(format!(
                "token {} was modified concurrently",
                record.id
            ))),
        }
    }

    async fn delete_authorization(
        &mut self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<()> {
        let mut rows = self.inner.authorizations.write().await;
        match rows.get(id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                rows.remove(id);
                Ok(())
            }
            _ => Err(StoreError::concurrency(format!(
                "authorization {id} was modified concurrently"
            ))),
        }
    }

    async fn delete_token(&mut self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        let mut rows = self.inner.tokens.write().await;
        match rows.get(id) {
            Some(stored) if stored.concurrency_token == expected_token => {
                rows.remove(id);
                Ok(())
            }
            _ => Err(StoreError::concurrency(format!(
                "token {id} was modified concurrently"
            ))),
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

//! Bulk strategy tests: revoke, prune, and cascade delete through both the
//! set-based path and the transactional fallback, plus aggregate error
//! collection and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use opengrant_store::backend::{
    AuthorizationFilter, Capabilities, IsolationLevel, PruneSelector, StorageBackend,
    StorageSession, TokenFilter,
};
use opengrant_store::{
    AuthorizationRecord, AuthorizationStore, StoreError, StoreOptions, StoreResult, TokenRecord,
    TokenStore, UnitOfWork, kinds, statuses,
};
use opengrant_store_memory::MemoryBackend;

/// Both execution strategies, exercised by every equivalence test.
fn strategy_modes() -> Vec<(&'static str, Arc<MemoryBackend>, StoreOptions)> {
    vec![
        (
            "set-based",
            Arc::new(MemoryBackend::new()),
            StoreOptions::default(),
        ),
        (
            "fallback-capability",
            Arc::new(MemoryBackend::new().with_capabilities(Capabilities::fallback_only())),
            StoreOptions::default(),
        ),
        (
            "fallback-disabled",
            Arc::new(MemoryBackend::new()),
            StoreOptions::without_bulk_operations(),
        ),
    ]
}

async fn seed_authorization(
    store: &AuthorizationStore<MemoryBackend>,
    uow: &mut UnitOfWork<Uuid>,
    subject: &str,
    application_id: Option<Uuid>,
    status: &str,
    kind: &str,
    age: Duration,
) -> AuthorizationRecord<Uuid> {
    let record = AuthorizationRecord {
        subject: Some(subject.to_string()),
        application_id,
        status: Some(status.to_string()),
        kind: Some(kind.to_string()),
        creation_date: Some(OffsetDateTime::now_utc() - age),
        ..Default::default()
    };
    store.create(uow, record).await.unwrap()
}

// =============================================================================
// Revoke
// =============================================================================

#[tokio::test]
async fn test_revoke_by_subject_and_client_counts_once() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let app = Uuid::new_v4();
        let other_app = Uuid::new_v4();
        seed_authorization(
            &store,
            &mut uow,
            "alice",
            Some(app),
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;
        seed_authorization(
            &store,
            &mut uow,
            "alice",
            Some(other_app),
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;
        seed_authorization(
            &store,
            &mut uow,
            "bob",
            Some(app),
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;

        let affected = store
            .revoke("alice", Some(&app.to_string()), None, None)
            .await
            .unwrap();
        assert_eq!(affected, 1, "mode {mode}");

        // The repeat call finds nothing left to revoke.
        let repeat = store
            .revoke("alice", Some(&app.to_string()), None, None)
            .await
            .unwrap();
        assert_eq!(repeat, 0, "mode {mode}");

        // The untouched rows are still valid.
        let filter = AuthorizationFilter {
            status: Some(statuses::VALID.to_string()),
            ..Default::default()
        };
        assert_eq!(store.count_matching(&filter).await.unwrap(), 2, "mode {mode}");
    }
}

#[tokio::test]
async fn test_revoke_regenerates_concurrency_tokens() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let stored = seed_authorization(
            &store,
            &mut uow,
            "alice",
            None,
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;
        let before = stored.concurrency_token.clone();

        assert_eq!(store.revoke_by_subject("alice").await.unwrap(), 1);

        let mut fresh = UnitOfWork::new();
        let id = store.get_id(&stored).unwrap();
        let after = store.find_by_id(&mut fresh, &id).await.unwrap().unwrap();
        assert_eq!(after.status.as_deref(), Some(statuses::REVOKED), "mode {mode}");
        assert_ne!(after.concurrency_token, before, "mode {mode}");
    }
}

#[tokio::test]
async fn test_revoke_tokens_by_authorization_id() {
    for (mode, backend, options) in strategy_modes() {
        let tokens = TokenStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let authorization_id = Uuid::new_v4();
        for _ in 0..3 {
            tokens
                .create(
                    &mut uow,
                    TokenRecord {
                        status: Some(statuses::VALID.to_string()),
                        authorization_id: Some(authorization_id),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        tokens
            .create(
                &mut uow,
                TokenRecord {
                    status: Some(statuses::VALID.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let affected = tokens
            .revoke_by_authorization_id(&authorization_id.to_string())
            .await
            .unwrap();
        assert_eq!(affected, 3, "mode {mode}");

        let still_valid = TokenFilter {
            status: Some(statuses::VALID.to_string()),
            ..Default::default()
        };
        assert_eq!(tokens.count_matching(&still_valid).await.unwrap(), 1, "mode {mode}");
    }
}

// =============================================================================
// Prune
// =============================================================================

#[tokio::test]
async fn test_prune_authorizations_honors_rules() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options.clone());
        let tokens = TokenStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        // Old and revoked: pruned.
        seed_authorization(
            &store,
            &mut uow,
            "a",
            None,
            statuses::REVOKED,
            kinds::PERMANENT,
            Duration::days(30),
        )
        .await;
        // Old, valid, permanent: kept regardless of age.
        let kept_valid = seed_authorization(
            &store,
            &mut uow,
            "b",
            None,
            statuses::VALID,
            kinds::PERMANENT,
            Duration::days(365),
        )
        .await;
        // Old, valid, ad-hoc, no linked tokens: pruned.
        seed_authorization(
            &store,
            &mut uow,
            "c",
            None,
            statuses::VALID,
            kinds::AD_HOC,
            Duration::days(30),
        )
        .await;
        // Old, valid, ad-hoc, one linked token: kept.
        let kept_ad_hoc = seed_authorization(
            &store,
            &mut uow,
            "d",
            None,
            statuses::VALID,
            kinds::AD_HOC,
            Duration::days(30),
        )
        .await;
        tokens
            .create(
                &mut uow,
                TokenRecord {
                    authorization_id: Some(kept_ad_hoc.id),
                    status: Some(statuses::VALID.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Revoked but created after the threshold: kept.
        let kept_fresh = seed_authorization(
            &store,
            &mut uow,
            "e",
            None,
            statuses::REVOKED,
            kinds::PERMANENT,
            Duration::ZERO,
        )
        .await;

        let threshold = OffsetDateTime::now_utc() - Duration::days(7);
        let pruned = store
            .prune(threshold, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pruned, 2, "mode {mode}");

        let mut fresh = UnitOfWork::new();
        for kept in [&kept_valid, &kept_ad_hoc, &kept_fresh] {
            let id = store.get_id(kept).unwrap();
            assert!(
                store.find_by_id(&mut fresh, &id).await.unwrap().is_some(),
                "mode {mode}: record should have survived"
            );
        }
        assert_eq!(store.count().await.unwrap(), 3, "mode {mode}");
    }
}

#[tokio::test]
async fn test_prune_tokens_honors_rules() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options.clone());
        let tokens = TokenStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let valid_authorization = seed_authorization(
            &store,
            &mut uow,
            "a",
            None,
            statuses::VALID,
            kinds::PERMANENT,
            Duration::days(30),
        )
        .await;
        let revoked_authorization = seed_authorization(
            &store,
            &mut uow,
            "a",
            None,
            statuses::REVOKED,
            kinds::PERMANENT,
            Duration::days(30),
        )
        .await;

        let old = OffsetDateTime::now_utc() - Duration::days(30);
        let seed_token = |status: &str,
                          authorization_id: Option<Uuid>,
                          expiration: Option<OffsetDateTime>| TokenRecord {
            subject: Some("a".to_string()),
            status: Some(status.to_string()),
            authorization_id,
            creation_date: Some(old),
            expiration_date: expiration,
            ..Default::default()
        };

        // Valid, unexpired, under a valid authorization: kept.
        tokens
            .create(
                &mut uow,
                seed_token(statuses::VALID, Some(valid_authorization.id), None),
            )
            .await
            .unwrap();
        // Inactive counts as kept too.
        tokens
            .create(&mut uow, seed_token(statuses::INACTIVE, None, None))
            .await
            .unwrap();
        // Redeemed: pruned.
        tokens
            .create(&mut uow, seed_token(statuses::REDEEMED, None, None))
            .await
            .unwrap();
        // Valid but its authorization was revoked: pruned.
        tokens
            .create(
                &mut uow,
                seed_token(statuses::VALID, Some(revoked_authorization.id), None),
            )
            .await
            .unwrap();
        // Valid but expired: pruned.
        tokens
            .create(
                &mut uow,
                seed_token(
                    statuses::VALID,
                    None,
                    Some(OffsetDateTime::now_utc() - Duration::hours(1)),
                ),
            )
            .await
            .unwrap();

        let threshold = OffsetDateTime::now_utc() - Duration::days(7);
        let pruned = tokens
            .prune(threshold, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pruned, 3, "mode {mode}");
        assert_eq!(tokens.count().await.unwrap(), 2, "mode {mode}");
    }
}

#[tokio::test]
async fn test_prune_runs_multiple_batches() {
    for (mode, backend, options) in strategy_modes() {
        let mut options = options;
        options.prune_batch_size = 3;
        let tokens = TokenStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        for _ in 0..10 {
            tokens
                .create(
                    &mut uow,
                    TokenRecord {
                        status: Some(statuses::REDEEMED.to_string()),
                        creation_date: Some(OffsetDateTime::now_utc() - Duration::days(30)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let threshold = OffsetDateTime::now_utc() - Duration::days(7);
        let pruned = tokens
            .prune(threshold, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pruned, 10, "mode {mode}");
        assert_eq!(tokens.count().await.unwrap(), 0, "mode {mode}");
    }
}

#[tokio::test]
async fn test_prune_cancelled_before_start_removes_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let tokens = TokenStore::new(Arc::clone(&backend), StoreOptions::default());
    let mut uow = UnitOfWork::new();

    tokens
        .create(
            &mut uow,
            TokenRecord {
                status: Some(statuses::REDEEMED.to_string()),
                creation_date: Some(OffsetDateTime::now_utc() - Duration::days(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let threshold = OffsetDateTime::now_utc() - Duration::days(7);
    let pruned = tokens.prune(threshold, &cancellation).await.unwrap();
    assert_eq!(pruned, 0);
    assert_eq!(tokens.count().await.unwrap(), 1);
}

// =============================================================================
// Cascade Delete
// =============================================================================

#[tokio::test]
async fn test_delete_authorization_cascades_to_tokens() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options.clone());
        let tokens = TokenStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let authorization = seed_authorization(
            &store,
            &mut uow,
            "alice",
            None,
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;
        for _ in 0..4 {
            tokens
                .create(
                    &mut uow,
                    TokenRecord {
                        authorization_id: Some(authorization.id),
                        status: Some(statuses::VALID.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        // An unrelated token must survive the cascade.
        tokens
            .create(&mut uow, TokenRecord::default())
            .await
            .unwrap();

        store.delete(&mut uow, &authorization).await.unwrap();

        let id = authorization.id.to_string();
        let linked: Vec<_> = tokens
            .find_by_authorization_id(&id)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(linked.is_empty(), "mode {mode}");
        assert_eq!(tokens.count().await.unwrap(), 1, "mode {mode}");
        assert_eq!(store.count().await.unwrap(), 0, "mode {mode}");
    }
}

#[tokio::test]
async fn test_delete_with_stale_token_is_concurrency_error() {
    for (mode, backend, options) in strategy_modes() {
        let store = AuthorizationStore::new(Arc::clone(&backend), options);
        let mut uow = UnitOfWork::new();

        let mut authorization = seed_authorization(
            &store,
            &mut uow,
            "alice",
            None,
            statuses::VALID,
            kinds::PERMANENT,
            Duration::hours(1),
        )
        .await;
        authorization.concurrency_token = "stale".to_string();

        let err = store.delete(&mut uow, &authorization).await.unwrap_err();
        assert!(err.is_concurrency(), "mode {mode}");
        assert_eq!(store.count().await.unwrap(), 1, "mode {mode}");
    }
}

// =============================================================================
// Aggregate Errors
// =============================================================================

/// Backend wrapper whose sessions fail the first token save with a
/// conflict, for exercising per-row error collection on the fallback path.
struct ConflictingBackend {
    inner: Arc<MemoryBackend>,
    tripped: Arc<AtomicBool>,
}

impl ConflictingBackend {
    fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct ConflictingSession {
    inner: Box<dyn StorageSession<Key = Uuid>>,
    tripped: Arc<AtomicBool>,
}

#[async_trait]
impl StorageBackend for ConflictingBackend {
    type Key = Uuid;

    fn capabilities(&self) -> Capabilities {
        Capabilities::fallback_only()
    }

    async fn count_authorizations(
        &self,
        filter: Option<&AuthorizationFilter<Uuid>>,
    ) -> StoreResult<u64> {
        self.inner.count_authorizations(filter).await
    }

    async fn insert_authorization(
        &self,
        record: AuthorizationRecord<Uuid>,
    ) -> StoreResult<AuthorizationRecord<Uuid>> {
        self.inner.insert_authorization(record).await
    }

    async fn save_authorization(
        &self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.inner.save_authorization(record, expected_token).await
    }

    async fn fetch_authorization(
        &self,
        id: &Uuid,
    ) -> StoreResult<Option<AuthorizationRecord<Uuid>>> {
        self.inner.fetch_authorization(id).await
    }

    async fn list_authorizations(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        self.inner.list_authorizations(count, offset).await
    }

    fn stream_authorizations(
        &self,
        filter: AuthorizationFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<Uuid>>> {
        self.inner.stream_authorizations(filter)
    }

    async fn count_tokens(&self, filter: Option<&TokenFilter<Uuid>>) -> StoreResult<u64> {
        self.inner.count_tokens(filter).await
    }

    async fn insert_token(&self, record: TokenRecord<Uuid>) -> StoreResult<TokenRecord<Uuid>> {
        self.inner.insert_token(record).await
    }

    async fn save_token(
        &self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.inner.save_token(record, expected_token).await
    }

    async fn delete_token(&self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        self.inner.delete_token(id, expected_token).await
    }

    async fn fetch_token(&self, id: &Uuid) -> StoreResult<Option<TokenRecord<Uuid>>> {
        self.inner.fetch_token(id).await
    }

    async fn fetch_token_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<Uuid>>> {
        self.inner.fetch_token_by_reference(reference_id).await
    }

    async fn list_tokens(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        self.inner.list_tokens(count, offset).await
    }

    fn stream_tokens(
        &self,
        filter: TokenFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<Uuid>>> {
        self.inner.stream_tokens(filter)
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> StoreResult<Box<dyn StorageSession<Key = Uuid>>> {
        let inner = self.inner.begin(isolation).await?;
        Ok(Box::new(ConflictingSession {
            inner,
            tripped: Arc::clone(&self.tripped),
        }))
    }
}

#[async_trait]
impl StorageSession for ConflictingSession {
    type Key = Uuid;

    async fn load_authorizations(
        &mut self,
        filter: &AuthorizationFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        self.inner.load_authorizations(filter, limit).await
    }

    async fn load_prunable_authorizations(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        self.inner.load_prunable_authorizations(selector).await
    }

    async fn load_tokens(
        &mut self,
        filter: &TokenFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        self.inner.load_tokens(filter, limit).await
    }

    async fn load_prunable_tokens(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        self.inner.load_prunable_tokens(selector).await
    }

    async fn save_authorization(
        &mut self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.inner.save_authorization(record, expected_token).await
    }

    async fn save_token(
        &mut self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::concurrency(format!(
                "token {} was modified concurrently",
                record.id
            )));
        }
        self.inner.save_token(record, expected_token).await
    }

    async fn delete_authorization(
        &mut self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.inner.delete_authorization(id, expected_token).await
    }

    async fn delete_token(&mut self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        self.inner.delete_token(id, expected_token).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await
    }
}

#[tokio::test]
async fn test_fallback_revoke_collects_row_conflicts() {
    let memory = Arc::new(MemoryBackend::new());
    let backend = Arc::new(ConflictingBackend::new(Arc::clone(&memory)));
    let tokens = TokenStore::new(backend, StoreOptions::default());
    let mut uow = UnitOfWork::new();

    for _ in 0..3 {
        tokens
            .create(
                &mut uow,
                TokenRecord {
                    subject: Some("alice".to_string()),
                    status: Some(statuses::VALID.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let err = tokens.revoke_by_subject("alice").await.unwrap_err();
    match err {
        StoreError::Aggregate { succeeded, causes } => {
            // One row conflicted; the rest of the batch still went through.
            assert_eq!(succeeded, 2);
            assert_eq!(causes.len(), 1);
            assert!(causes[0].is_concurrency());
        }
        other => panic!("expected aggregate error, got {other:?}"),
    }

    let revoked = TokenFilter {
        status: Some(statuses::REVOKED.to_string()),
        ..Default::default()
    };
    let direct = TokenStore::new(memory, StoreOptions::default());
    assert_eq!(direct.count_matching(&revoked).await.unwrap(), 2);
}

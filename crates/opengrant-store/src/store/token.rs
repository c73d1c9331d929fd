//! Token store.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::backend::{StorageBackend, TokenFilter};
use crate::bulk;
use crate::cache::{EntityKind, ParseCache, PropertyMap, encode_properties};
use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::keys::{EntityKey, key_from_text, key_to_text, optional_key_to_text};
use crate::store::{LIST_PAGE, fresh_concurrency_token};
use crate::types::{DefaultFactory, RecordFactory, TokenRecord};
use crate::uow::UnitOfWork;

/// Lifecycle operations over token records.
///
/// Cheap to clone; instances share the backend, parse cache, and options.
pub struct TokenStore<B: StorageBackend> {
    backend: Arc<B>,
    cache: Arc<ParseCache>,
    options: Arc<StoreOptions>,
    factory: Arc<dyn RecordFactory<TokenRecord<B::Key>>>,
}

impl<B: StorageBackend> Clone for TokenStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            options: Arc::clone(&self.options),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<B: StorageBackend> TokenStore<B> {
    /// Create a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<B>, options: StoreOptions) -> Self {
        let cache = Arc::new(ParseCache::new(options.cache_ttl, options.cache_capacity));
        Self {
            backend,
            cache,
            options: Arc::new(options),
            factory: Arc::new(DefaultFactory),
        }
    }

    /// Replace the parse cache, typically to share one across stores.
    #[must_use]
    pub fn with_parse_cache(mut self, cache: Arc<ParseCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the record factory used by [`instantiate`](Self::instantiate).
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn RecordFactory<TokenRecord<B::Key>>>) -> Self {
        self.factory = factory;
        self
    }

    // -------------------------------------------------------------------------
    // Count
    // -------------------------------------------------------------------------

    /// Total number of token rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn count(&self) -> StoreResult<u64> {
        self.backend.count_tokens(None).await
    }

    /// Number of rows matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn count_matching(&self, filter: &TokenFilter<B::Key>) -> StoreResult<u64> {
        self.backend.count_tokens(Some(filter)).await
    }

    // -------------------------------------------------------------------------
    // Create / Update / Delete
    // -------------------------------------------------------------------------

    /// Insert a new token.
    ///
    /// Assigns the creation date and a fresh concurrency token when unset,
    /// inserts through the backend (rejections surface unmodified), and
    /// tracks the stored record in the unit of work.
    ///
    /// # Errors
    ///
    /// Returns the backend rejection unmodified on constraint violations.
    pub async fn create(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        mut record: TokenRecord<B::Key>,
    ) -> StoreResult<TokenRecord<B::Key>> {
        if record.creation_date.is_none() {
            record.creation_date = Some(OffsetDateTime::now_utc());
        }
        if record.concurrency_token.is_empty() {
            record.concurrency_token = fresh_concurrency_token();
        }

        let stored = self.backend.insert_token(record).await?;
        tracing::debug!(id = ?stored.id, "token created");
        uow.track_token(stored.clone());
        Ok(stored)
    }

    /// Persist changes to an existing token.
    ///
    /// Assigns a freshly generated concurrency token before saving. On a
    /// write conflict the record's token is restored, the unit of work
    /// stops tracking the record, and a `Concurrency` error is returned so
    /// the caller can reload and retry.
    ///
    /// # Errors
    ///
    /// `Argument` if the record has no assigned id; `Concurrency` on a
    /// stale token.
    pub async fn update(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        record: &mut TokenRecord<B::Key>,
    ) -> StoreResult<()> {
        if record.id.is_zero() {
            return Err(StoreError::argument("token has no assigned id"));
        }

        let expected = std::mem::replace(&mut record.concurrency_token, fresh_concurrency_token());
        match self.backend.save_token(record, &expected).await {
            Ok(()) => {
                uow.track_token(record.clone());
                Ok(())
            }
            Err(error) => {
                record.concurrency_token = expected;
                if error.is_concurrency() {
                    uow.evict_token(&record.id);
                }
                Err(error)
            }
        }
    }

    /// Hard-delete a token.
    ///
    /// # Errors
    ///
    /// `Argument` if the record has no assigned id; `Concurrency` on a
    /// stale token.
    pub async fn delete(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        record: &TokenRecord<B::Key>,
    ) -> StoreResult<()> {
        if record.id.is_zero() {
            return Err(StoreError::argument("token has no assigned id"));
        }

        let result = self
            .backend
            .delete_token(&record.id, &record.concurrency_token)
            .await;
        if result.is_ok() || matches!(result, Err(ref error) if error.is_concurrency()) {
            uow.evict_token(&record.id);
        }
        result
    }

    // -------------------------------------------------------------------------
    // Find
    // -------------------------------------------------------------------------

    /// Find tokens for a subject/client pair, optionally narrowed by
    /// status and kind.
    ///
    /// Every supplied filter is an exact-match AND. The returned stream is
    /// lazy, finite, and non-restartable.
    ///
    /// # Errors
    ///
    /// `Argument` if subject or client is empty or the client identifier
    /// is malformed.
    pub fn find(
        &self,
        subject: &str,
        client: &str,
        status: Option<&str>,
        kind: Option<&str>,
    ) -> StoreResult<BoxStream<'static, StoreResult<TokenRecord<B::Key>>>> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        if client.is_empty() {
            return Err(StoreError::argument("client must not be empty"));
        }

        let filter = TokenFilter {
            subject: Some(subject.to_owned()),
            application_id: Some(key_from_text(Some(client))?),
            status: status.map(str::to_owned),
            kind: kind.map(str::to_owned),
            ..Default::default()
        };
        Ok(self.backend.stream_tokens(filter))
    }

    /// Point lookup by external identifier.
    ///
    /// Consults the unit of work first, so a caller sees its own
    /// uncommitted edits; otherwise queries the backend and tracks the
    /// result.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub async fn find_by_id(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        id: &str,
    ) -> StoreResult<Option<TokenRecord<B::Key>>> {
        if id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let key: B::Key = key_from_text(Some(id))?;

        if let Some(tracked) = uow.token(&key) {
            return Ok(Some(tracked.clone()));
        }

        let fetched = self.backend.fetch_token(&key).await?;
        if let Some(record) = &fetched {
            uow.track_token(record.clone());
        }
        Ok(fetched)
    }

    /// Point lookup by reference identifier.
    ///
    /// Consults the unit of work first, then the backend.
    ///
    /// # Errors
    ///
    /// `Argument` if the reference identifier is empty.
    pub async fn find_by_reference_id(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<B::Key>>> {
        if reference_id.is_empty() {
            return Err(StoreError::argument("reference identifier must not be empty"));
        }

        if let Some(tracked) = uow.token_by_reference(reference_id) {
            return Ok(Some(tracked.clone()));
        }

        let fetched = self.backend.fetch_token_by_reference(reference_id).await?;
        if let Some(record) = &fetched {
            uow.track_token(record.clone());
        }
        Ok(fetched)
    }

    /// All tokens issued under the given authorization.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub fn find_by_authorization_id(
        &self,
        authorization_id: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<TokenRecord<B::Key>>>> {
        if authorization_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = TokenFilter {
            authorization_id: Some(key_from_text(Some(authorization_id))?),
            ..Default::default()
        };
        Ok(self.backend.stream_tokens(filter))
    }

    /// All tokens issued to the given application.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub fn find_by_application_id(
        &self,
        application_id: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<TokenRecord<B::Key>>>> {
        if application_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = TokenFilter {
            application_id: Some(key_from_text(Some(application_id))?),
            ..Default::default()
        };
        Ok(self.backend.stream_tokens(filter))
    }

    /// All tokens belonging to the given subject.
    ///
    /// # Errors
    ///
    /// `Argument` if the subject is empty.
    pub fn find_by_subject(
        &self,
        subject: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<TokenRecord<B::Key>>>> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        let filter = TokenFilter {
            subject: Some(subject.to_owned()),
            ..Default::default()
        };
        Ok(self.backend.stream_tokens(filter))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// External identifier of the record, absent until assigned.
    #[must_use]
    pub fn get_id(&self, record: &TokenRecord<B::Key>) -> Option<String> {
        key_to_text(&record.id)
    }

    /// External identifier of the linked application, absent when unset.
    #[must_use]
    pub fn get_application_id(&self, record: &TokenRecord<B::Key>) -> Option<String> {
        optional_key_to_text(record.application_id.as_ref())
    }

    /// Link the record to an application by external identifier; absent or
    /// empty text clears the link.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is malformed.
    pub fn set_application_id(
        &self,
        record: &mut TokenRecord<B::Key>,
        application_id: Option<&str>,
    ) -> StoreResult<()> {
        let key: B::Key = key_from_text(application_id)?;
        record.application_id = (!key.is_zero()).then_some(key);
        Ok(())
    }

    /// External identifier of the linked authorization, absent when unset.
    #[must_use]
    pub fn get_authorization_id(&self, record: &TokenRecord<B::Key>) -> Option<String> {
        optional_key_to_text(record.authorization_id.as_ref())
    }

    /// Link the record to an authorization by external identifier; absent
    /// or empty text clears the link.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is malformed.
    pub fn set_authorization_id(
        &self,
        record: &mut TokenRecord<B::Key>,
        authorization_id: Option<&str>,
    ) -> StoreResult<()> {
        let key: B::Key = key_from_text(authorization_id)?;
        record.authorization_id = (!key.is_zero()).then_some(key);
        Ok(())
    }

    /// Additional properties, via the parse cache.
    ///
    /// # Errors
    ///
    /// `Serialization` if the stored text is not a JSON object.
    pub fn get_properties(&self, record: &TokenRecord<B::Key>) -> StoreResult<PropertyMap> {
        self.cache
            .properties(EntityKind::Token, record.properties.as_deref())
    }

    /// Replace the property map. An empty map clears the backing field.
    ///
    /// # Errors
    ///
    /// `Serialization` if encoding fails.
    pub fn set_properties(
        &self,
        record: &mut TokenRecord<B::Key>,
        properties: &BTreeMap<String, serde_json::Value>,
    ) -> StoreResult<()> {
        record.properties = encode_properties(properties)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Instantiate / List
    // -------------------------------------------------------------------------

    /// Produce a new blank record through the registered factory.
    ///
    /// # Errors
    ///
    /// `Construction` when the factory fails.
    pub fn instantiate(&self) -> StoreResult<TokenRecord<B::Key>> {
        self.factory.instantiate()
    }

    /// Enumerate records in stable ascending id order, then skip/take.
    ///
    /// The stream pulls pages from the backend lazily; dropping it early
    /// releases the underlying resources.
    pub fn list(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<B::Key>>> {
        let backend = Arc::clone(&self.backend);
        let start = offset.unwrap_or(0);
        futures_util::stream::try_unfold((start, count), move |(position, remaining)| {
            let backend = Arc::clone(&backend);
            async move {
                if remaining == Some(0) {
                    return Ok::<_, StoreError>(None);
                }
                let take = remaining.map_or(LIST_PAGE, |r| r.min(LIST_PAGE));
                let page = backend.list_tokens(Some(take), Some(position)).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let fetched = page.len();
                let state = (position + fetched, remaining.map(|r| r - fetched));
                Ok(Some((
                    futures_util::stream::iter(page.into_iter().map(Ok::<_, StoreError>)),
                    state,
                )))
            }
        })
        .try_flatten()
        .boxed()
    }

    // -------------------------------------------------------------------------
    // Prune / Revoke
    // -------------------------------------------------------------------------

    /// Remove stale tokens created before `threshold`, in capped batches,
    /// until a batch affects no rows.
    ///
    /// A token survives while it is inactive or valid, its authorization
    /// (if any) is still valid, and it is unexpired. Cancellation is
    /// honored between batches; committed batches stay committed and their
    /// count is still returned.
    ///
    /// # Errors
    ///
    /// `Aggregate` carrying every batch failure plus the count already
    /// pruned.
    pub async fn prune(
        &self,
        threshold: OffsetDateTime,
        cancellation: &CancellationToken,
    ) -> StoreResult<u64> {
        bulk::prune_tokens(self.backend.as_ref(), &self.options, threshold, cancellation).await
    }

    /// Revoke every token matching the given subject and optional
    /// client/status/kind constraints. Returns the count changed.
    ///
    /// # Errors
    ///
    /// `Argument` on empty subject or malformed client identifier;
    /// `Aggregate` when fallback rows conflicted.
    pub async fn revoke(
        &self,
        subject: &str,
        client: Option<&str>,
        status: Option<&str>,
        kind: Option<&str>,
    ) -> StoreResult<u64> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        let application_id = match client {
            Some(client) if !client.is_empty() => Some(key_from_text(Some(client))?),
            _ => None,
        };
        let filter = TokenFilter {
            subject: Some(subject.to_owned()),
            application_id,
            status: status.map(str::to_owned),
            kind: kind.map(str::to_owned),
            ..Default::default()
        };
        bulk::revoke_tokens(self.backend.as_ref(), &self.options, &filter).await
    }

    /// Revoke every token issued under the given authorization.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub async fn revoke_by_authorization_id(&self, authorization_id: &str) -> StoreResult<u64> {
        if authorization_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = TokenFilter {
            authorization_id: Some(key_from_text(Some(authorization_id))?),
            ..Default::default()
        };
        bulk::revoke_tokens(self.backend.as_ref(), &self.options, &filter).await
    }

    /// Revoke every token issued to the given application.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub async fn revoke_by_application_id(&self, application_id: &str) -> StoreResult<u64> {
        if application_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = TokenFilter {
            application_id: Some(key_from_text(Some(application_id))?),
            ..Default::default()
        };
        bulk::revoke_tokens(self.backend.as_ref(), &self.options, &filter).await
    }

    /// Revoke every token belonging to the given subject.
    ///
    /// # Errors
    ///
    /// `Argument` if the subject is empty.
    pub async fn revoke_by_subject(&self, subject: &str) -> StoreResult<u64> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        let filter = TokenFilter {
            subject: Some(subject.to_owned()),
            ..Default::default()
        };
        bulk::revoke_tokens(self.backend.as_ref(), &self.options, &filter).await
    }
}

impl<B: StorageBackend> std::fmt::Debug for TokenStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

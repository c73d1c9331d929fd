//! Authorization store.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::backend::{AuthorizationFilter, StorageBackend};
use crate::bulk;
use crate::cache::{EntityKind, ParseCache, PropertyMap, ScopeList, encode_properties, encode_scopes};
use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::keys::{EntityKey, key_from_text, key_to_text, optional_key_to_text};
use crate::store::{LIST_PAGE, fresh_concurrency_token};
use crate::types::{AuthorizationRecord, DefaultFactory, RecordFactory};
use crate::uow::UnitOfWork;

/// Lifecycle operations over authorization records.
///
/// Cheap to clone; instances share the backend, parse cache, and options.
pub struct AuthorizationStore<B: StorageBackend> {
    backend: Arc<B>,
    cache: Arc<ParseCache>,
    options: Arc<StoreOptions>,
    factory: Arc<dyn RecordFactory<AuthorizationRecord<B::Key>>>,
}

impl<B: StorageBackend> Clone for AuthorizationStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            options: Arc::clone(&self.options),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<B: StorageBackend> AuthorizationStore<B> {
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
    pub fn with_factory(
        mut self,
        factory: Arc<dyn RecordFactory<AuthorizationRecord<B::Key>>>,
    ) -> Self {
        self.factory = factory;
        self
    }

    /// The shared parse cache.
    #[must_use]
    pub fn parse_cache(&self) -> &Arc<ParseCache> {
        &self.cache
    }

    // -------------------------------------------------------------------------
    // Count
    // -------------------------------------------------------------------------

    /// Total number of authorization rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn count(&self) -> StoreResult<u64> {
        self.backend.count_authorizations(None).await
    }

    /// Number of rows matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn count_matching(&self, filter: &AuthorizationFilter<B::Key>) -> StoreResult<u64> {
        self.backend.count_authorizations(Some(filter)).await
    }

    // -------------------------------------------------------------------------
    // Create / Update / Delete
    // -------------------------------------------------------------------------

    /// Insert a new authorization.
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
        mut record: AuthorizationRecord<B::Key>,
    ) -> StoreResult<AuthorizationRecord<B::Key>> {
        if record.creation_date.is_none() {
            record.creation_date = Some(OffsetDateTime::now_utc());
        }
        if record.concurrency_token.is_empty() {
            record.concurrency_token = fresh_concurrency_token();
        }

        let stored = self.backend.insert_authorization(record).await?;
        tracing::debug!(id = ?stored.id, "authorization created");
        uow.track_authorization(stored.clone());
        Ok(stored)
    }

    /// Persist changes to an existing authorization.
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
        record: &mut AuthorizationRecord<B::Key>,
    ) -> StoreResult<()> {
        if record.id.is_zero() {
            return Err(StoreError::argument("authorization has no assigned id"));
        }

        let expected = std::mem::replace(&mut record.concurrency_token, fresh_concurrency_token());
        match self.backend.save_authorization(record, &expected).await {
            Ok(()) => {
                uow.track_authorization(record.clone());
                Ok(())
            }
            Err(error) => {
                record.concurrency_token = expected;
                if error.is_concurrency() {
                    uow.evict_authorization(&record.id);
                }
                Err(error)
            }
        }
    }

    /// Hard-delete an authorization and every linked token.
    ///
    /// The pair is removed atomically relative to concurrent insertion of
    /// a new token for this authorization; see the bulk strategy for the
    /// two execution paths.
    ///
    /// # Errors
    ///
    /// `Argument` if the record has no assigned id; `Concurrency` on a
    /// stale token.
    pub async fn delete(
        &self,
        uow: &mut UnitOfWork<B::Key>,
        record: &AuthorizationRecord<B::Key>,
    ) -> StoreResult<()> {
        if record.id.is_zero() {
            return Err(StoreError::argument("authorization has no assigned id"));
        }

        let result = bulk::delete_authorization_cascade(
            self.backend.as_ref(),
            &self.options,
            &record.id,
            &record.concurrency_token,
        )
        .await;

        if result.is_ok() || matches!(result, Err(ref error) if error.is_concurrency()) {
            uow.evict_authorization(&record.id);
            uow.evict_tokens_of_authorization(&record.id);
        }
        result
    }

    // -------------------------------------------------------------------------
    // Find
    // -------------------------------------------------------------------------

    /// Find authorizations for a subject/client pair, optionally narrowed
    /// by status, kind, and a required scope set.
    ///
    /// Every supplied filter is an exact-match AND. The scope filter keeps
    /// only records whose stored scope set is a superset of the requested
    /// scopes; it is applied here after the backend query, using the parse
    /// cache. The returned stream is lazy, finite, and non-restartable.
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
        scopes: Option<&[String]>,
    ) -> StoreResult<BoxStream<'static, StoreResult<AuthorizationRecord<B::Key>>>> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        if client.is_empty() {
            return Err(StoreError::argument("client must not be empty"));
        }

        let filter = AuthorizationFilter {
            subject: Some(subject.to_owned()),
            application_id: Some(key_from_text(Some(client))?),
            status: status.map(str::to_owned),
            kind: kind.map(str::to_owned),
        };

        let stream = self.backend.stream_authorizations(filter);
        let Some(required) = scopes.filter(|s| !s.is_empty()) else {
            return Ok(stream);
        };

        let cache = Arc::clone(&self.cache);
        let required = required.to_vec();
        Ok(stream
            .filter_map(move |result| {
                let cache = Arc::clone(&cache);
                let required = required.clone();
                async move {
                    match result {
                        Ok(record) => {
                            match cache.scopes(EntityKind::Authorization, record.scopes.as_deref())
                            {
                                Ok(granted) => required
                                    .iter()
                                    .all(|scope| granted.contains(scope))
                                    .then_some(Ok(record)),
                                Err(error) => Some(Err(error)),
                            }
                        }
                        Err(error) => Some(Err(error)),
                    }
                }
            })
            .boxed())
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
    ) -> StoreResult<Option<AuthorizationRecord<B::Key>>> {
        if id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let key: B::Key = key_from_text(Some(id))?;

        if let Some(tracked) = uow.authorization(&key) {
            return Ok(Some(tracked.clone()));
        }

        let fetched = self.backend.fetch_authorization(&key).await?;
        if let Some(record) = &fetched {
            uow.track_authorization(record.clone());
        }
        Ok(fetched)
    }

    /// All authorizations issued to the given application.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub fn find_by_application_id(
        &self,
        application_id: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<AuthorizationRecord<B::Key>>>> {
        if application_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = AuthorizationFilter {
            application_id: Some(key_from_text(Some(application_id))?),
            ..Default::default()
        };
        Ok(self.backend.stream_authorizations(filter))
    }

    /// All authorizations belonging to the given subject.
    ///
    /// # Errors
    ///
    /// `Argument` if the subject is empty.
    pub fn find_by_subject(
        &self,
        subject: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<AuthorizationRecord<B::Key>>>> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        let filter = AuthorizationFilter {
            subject: Some(subject.to_owned()),
            ..Default::default()
        };
        Ok(self.backend.stream_authorizations(filter))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// External identifier of the record, absent until assigned.
    #[must_use]
    pub fn get_id(&self, record: &AuthorizationRecord<B::Key>) -> Option<String> {
        key_to_text(&record.id)
    }

    /// External identifier of the linked application, absent when unset.
    #[must_use]
    pub fn get_application_id(&self, record: &AuthorizationRecord<B::Key>) -> Option<String> {
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
        record: &mut AuthorizationRecord<B::Key>,
        application_id: Option<&str>,
    ) -> StoreResult<()> {
        let key: B::Key = key_from_text(application_id)?;
        record.application_id = (!key.is_zero()).then_some(key);
        Ok(())
    }

    /// Granted scopes, in stored order, via the parse cache.
    ///
    /// # Errors
    ///
    /// `Serialization` if the stored text is not a JSON string array.
    pub fn get_scopes(&self, record: &AuthorizationRecord<B::Key>) -> StoreResult<ScopeList> {
        self.cache
            .scopes(EntityKind::Authorization, record.scopes.as_deref())
    }

    /// Replace the granted scopes. An empty slice clears the backing field.
    ///
    /// # Errors
    ///
    /// `Serialization` if encoding fails.
    pub fn set_scopes(
        &self,
        record: &mut AuthorizationRecord<B::Key>,
        scopes: &[String],
    ) -> StoreResult<()> {
        record.scopes = encode_scopes(scopes)?;
        Ok(())
    }

    /// Additional properties, via the parse cache.
    ///
    /// # Errors
    ///
    /// `Serialization` if the stored text is not a JSON object.
    pub fn get_properties(&self, record: &AuthorizationRecord<B::Key>) -> StoreResult<PropertyMap> {
        self.cache
            .properties(EntityKind::Authorization, record.properties.as_deref())
    }

    /// Replace the property map. An empty map clears the backing field.
    ///
    /// # Errors
    ///
    /// `Serialization` if encoding fails.
    pub fn set_properties(
        &self,
        record: &mut AuthorizationRecord<B::Key>,
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
    pub fn instantiate(&self) -> StoreResult<AuthorizationRecord<B::Key>> {
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
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<B::Key>>> {
        let backend = Arc::clone(&self.backend);
        let start = offset.unwrap_or(0);
        futures_util::stream::try_unfold((start, count), move |(position, remaining)| {
            let backend = Arc::clone(&backend);
            async move {
                if remaining == Some(0) {
                    return Ok::<_, StoreError>(None);
                }
                let take = remaining.map_or(LIST_PAGE, |r| r.min(LIST_PAGE));
                let page = backend
                    .list_authorizations(Some(take), Some(position))
                    .await?;
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

    /// Remove stale authorizations created before `threshold`, in capped
    /// batches, until a batch affects no rows.
    ///
    /// Valid non-ad-hoc authorizations are never removed regardless of
    /// age. Cancellation is honored between batches; committed batches
    /// stay committed and their count is still returned.
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
        bulk::prune_authorizations(self.backend.as_ref(), &self.options, threshold, cancellation)
            .await
    }

    /// Revoke every authorization matching the given subject and optional
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
        let filter = AuthorizationFilter {
            subject: Some(subject.to_owned()),
            application_id,
            status: status.map(str::to_owned),
            kind: kind.map(str::to_owned),
        };
        bulk::revoke_authorizations(self.backend.as_ref(), &self.options, &filter).await
    }

    /// Revoke every authorization issued to the given application.
    ///
    /// # Errors
    ///
    /// `Argument` if the identifier is empty or malformed.
    pub async fn revoke_by_application_id(&self, application_id: &str) -> StoreResult<u64> {
        if application_id.is_empty() {
            return Err(StoreError::argument("identifier must not be empty"));
        }
        let filter = AuthorizationFilter {
            application_id: Some(key_from_text(Some(application_id))?),
            ..Default::default()
        };
        bulk::revoke_authorizations(self.backend.as_ref(), &self.options, &filter).await
    }

    /// Revoke every authorization belonging to the given subject.
    ///
    /// # Errors
    ///
    /// `Argument` if the subject is empty.
    pub async fn revoke_by_subject(&self, subject: &str) -> StoreResult<u64> {
        if subject.is_empty() {
            return Err(StoreError::argument("subject must not be empty"));
        }
        let filter = AuthorizationFilter {
            subject: Some(subject.to_owned()),
            ..Default::default()
        };
        bulk::revoke_authorizations(self.backend.as_ref(), &self.options, &filter).await
    }
}

impl<B: StorageBackend> std::fmt::Debug for AuthorizationStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

//! Storage port.
//!
//! This module defines the seam between the stores and a concrete storage
//! backend: the query filter language, the capability flags that select the
//! bulk execution strategy at runtime, and the two traits every backend
//! implements — [`StorageBackend`] for pool-scoped operations and
//! [`StorageSession`] for the transactional fallback path with change
//! tracking.
//!
//! Implementations are provided in separate crates:
//!
//! - `opengrant-store-memory` - in-memory backend
//! - `opengrant-store-postgres` - PostgreSQL backend

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use time::OffsetDateTime;

use crate::error::{StoreError, StoreResult};
use crate::keys::EntityKey;
use crate::types::{AuthorizationRecord, TokenRecord, statuses};

// =============================================================================
// Capabilities & Isolation
// =============================================================================

/// Native bulk capabilities advertised by a backend.
///
/// These runtime flags decide whether predicate mutations run as one
/// set-based backend statement or through the transactional fallback.
/// The choice is a performance decision only; both paths must produce the
/// same persisted state and affected-row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The backend can apply a predicate update in a single statement.
    pub set_based_updates: bool,
    /// The backend can apply a predicate delete in a single statement.
    pub set_based_deletes: bool,
}

impl Capabilities {
    /// Full native bulk support.
    #[must_use]
    pub fn native() -> Self {
        Self {
            set_based_updates: true,
            set_based_deletes: true,
        }
    }

    /// No native bulk support; every predicate mutation takes the
    /// transactional fallback.
    #[must_use]
    pub fn fallback_only() -> Self {
        Self {
            set_based_updates: false,
            set_based_deletes: false,
        }
    }
}

/// Transaction isolation for the fallback path.
///
/// Scoped strictly to one batch: serializable blocks concurrent insertion
/// of child rows during a cascade delete, repeatable read locks retrieved
/// rows against concurrent modification during pruning without blocking
/// unrelated inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// The backend default.
    ReadCommitted,
    /// Lock retrieved rows against concurrent modification.
    RepeatableRead,
    /// Additionally block concurrent insertion of matching rows.
    Serializable,
}

// =============================================================================
// Filters
// =============================================================================

/// Exact-match AND filter over authorization rows.
///
/// Unset fields do not constrain the result. This concrete filter language
/// is the only predicate form that crosses the port.
#[derive(Debug, Clone)]
pub struct AuthorizationFilter<K> {
    /// Match the subject exactly.
    pub subject: Option<String>,
    /// Match the application key exactly.
    pub application_id: Option<K>,
    /// Match the status exactly.
    pub status: Option<String>,
    /// Match the kind exactly.
    pub kind: Option<String>,
}

impl<K> Default for AuthorizationFilter<K> {
    fn default() -> Self {
        Self {
            subject: None,
            application_id: None,
            status: None,
            kind: None,
        }
    }
}

impl<K: EntityKey> AuthorizationFilter<K> {
    /// Returns `true` if the record satisfies every set constraint.
    #[must_use]
    pub fn matches(&self, record: &AuthorizationRecord<K>) -> bool {
        if let Some(subject) = &self.subject
            && record.subject.as_deref() != Some(subject)
        {
            return false;
        }
        if let Some(application_id) = &self.application_id
            && record.application_id.as_ref() != Some(application_id)
        {
            return false;
        }
        if let Some(status) = &self.status
            && record.status.as_deref() != Some(status)
        {
            return false;
        }
        if let Some(kind) = &self.kind
            && record.kind.as_deref() != Some(kind)
        {
            return false;
        }
        true
    }
}

/// Exact-match AND filter over token rows.
#[derive(Debug, Clone)]
pub struct TokenFilter<K> {
    /// Match the subject exactly.
    pub subject: Option<String>,
    /// Match the application key exactly.
    pub application_id: Option<K>,
    /// Match the authorization key exactly.
    pub authorization_id: Option<K>,
    /// Match the status exactly.
    pub status: Option<String>,
    /// Match the kind exactly.
    pub kind: Option<String>,
}

impl<K> Default for TokenFilter<K> {
    fn default() -> Self {
        Self {
            subject: None,
            application_id: None,
            authorization_id: None,
            status: None,
            kind: None,
        }
    }
}

impl<K: EntityKey> TokenFilter<K> {
    /// Returns `true` if the record satisfies every set constraint.
    #[must_use]
    pub fn matches(&self, record: &TokenRecord<K>) -> bool {
        if let Some(subject) = &self.subject
            && record.subject.as_deref() != Some(subject)
        {
            return false;
        }
        if let Some(application_id) = &self.application_id
            && record.application_id.as_ref() != Some(application_id)
        {
            return false;
        }
        if let Some(authorization_id) = &self.authorization_id
            && record.authorization_id.as_ref() != Some(authorization_id)
        {
            return false;
        }
        if let Some(status) = &self.status
            && record.status.as_deref() != Some(status)
        {
            return false;
        }
        if let Some(kind) = &self.kind
            && record.kind.as_deref() != Some(kind)
        {
            return false;
        }
        true
    }
}

/// Selector for one prune batch.
#[derive(Debug, Clone, Copy)]
pub struct PruneSelector {
    /// Records created at or after this instant are never pruned.
    pub threshold: OffsetDateTime,
    /// Upper bound on rows removed by one batch.
    pub limit: usize,
}

/// Prune rule for authorization rows.
///
/// An authorization is prunable only when it was created before the
/// threshold and is either no longer valid, or is an ad-hoc grant with no
/// remaining linked tokens. Rows without a creation date are never pruned.
#[must_use]
pub fn authorization_is_prunable<K: EntityKey>(
    record: &AuthorizationRecord<K>,
    linked_tokens: u64,
    threshold: OffsetDateTime,
) -> bool {
    let Some(created) = record.creation_date else {
        return false;
    };
    if created >= threshold {
        return false;
    }
    !record.is_valid() || (record.is_ad_hoc() && linked_tokens == 0)
}

/// Prune rule for token rows.
///
/// A token is prunable only when it was created before the threshold and is
/// either in an inert status (neither `inactive` nor `valid`), linked to an
/// authorization that is no longer valid, or past its expiration. Rows
/// without a creation date are never pruned.
#[must_use]
pub fn token_is_prunable<K: EntityKey>(
    record: &TokenRecord<K>,
    authorization_invalid: bool,
    threshold: OffsetDateTime,
    now: OffsetDateTime,
) -> bool {
    let Some(created) = record.creation_date else {
        return false;
    };
    if created >= threshold {
        return false;
    }
    let inert = !matches!(
        record.status.as_deref(),
        Some(statuses::INACTIVE) | Some(statuses::VALID)
    );
    let expired = record.expiration_date.map(|exp| exp < now).unwrap_or(false);
    inert || authorization_invalid || expired
}

// =============================================================================
// Storage Backend
// =============================================================================

/// Pool-scoped storage operations over authorization and token rows.
///
/// All operations are safe to issue concurrently from many callers; the
/// backend draws connections from a shared pool and never serializes
/// callers through one session.
///
/// The native bulk methods (`revoke_*`, `prune_*`,
/// `delete_authorization_cascade`) are only invoked when [`Capabilities`]
/// advertises the corresponding support; their default implementations
/// report the missing capability.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// The backend's native key type.
    type Key: EntityKey;

    /// Native bulk capabilities of this backend.
    fn capabilities(&self) -> Capabilities;

    // -------------------------------------------------------------------------
    // Authorizations
    // -------------------------------------------------------------------------

    /// Count authorization rows, optionally filtered.
    async fn count_authorizations(
        &self,
        filter: Option<&AuthorizationFilter<Self::Key>>,
    ) -> StoreResult<u64>;

    /// Insert a new row, assigning the key when the record carries the zero
    /// key. Backend rejections (constraint violations) surface unmodified.
    async fn insert_authorization(
        &self,
        record: AuthorizationRecord<Self::Key>,
    ) -> StoreResult<AuthorizationRecord<Self::Key>>;

    /// Persist an updated row if the stored concurrency token still equals
    /// `expected_token`.
    ///
    /// # Errors
    ///
    /// Returns a `Concurrency` error when the stored token differs or the
    /// row no longer exists; the row is left untouched.
    async fn save_authorization(
        &self,
        record: &AuthorizationRecord<Self::Key>,
        expected_token: &str,
    ) -> StoreResult<()>;

    /// Point lookup by key.
    async fn fetch_authorization(
        &self,
        id: &Self::Key,
    ) -> StoreResult<Option<AuthorizationRecord<Self::Key>>>;

    /// List rows in ascending key order, then skip/take.
    async fn list_authorizations(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuthorizationRecord<Self::Key>>>;

    /// Lazy stream of rows matching the filter.
    ///
    /// The stream is finite, non-restartable, and releases any underlying
    /// cursor resource when dropped before exhaustion.
    fn stream_authorizations(
        &self,
        filter: AuthorizationFilter<Self::Key>,
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<Self::Key>>>;

    /// Set-based revoke: flip matching rows to `revoked` and regenerate
    /// their concurrency tokens in one statement. Rows already revoked are
    /// neither touched nor counted, so a repeated call reports zero.
    /// Returns the affected count. Already durable on return.
    async fn revoke_authorizations(
        &self,
        filter: &AuthorizationFilter<Self::Key>,
    ) -> StoreResult<u64> {
        let _ = filter;
        Err(StoreError::capability(
            "backend has no native set-based update support",
        ))
    }

    /// Set-based prune of one batch of prunable authorization rows.
    /// Returns the number of rows removed.
    async fn prune_authorizations(&self, selector: &PruneSelector) -> StoreResult<u64> {
        let _ = selector;
        Err(StoreError::capability(
            "backend has no native set-based delete support",
        ))
    }

    /// Set-based cascade delete: remove the authorization and every linked
    /// token atomically, guarded by the concurrency token. Returns the
    /// number of token rows removed.
    ///
    /// # Errors
    ///
    /// Returns a `Concurrency` error when the stored token differs or the
    /// row no longer exists.
    async fn delete_authorization_cascade(
        &self,
        id: &Self::Key,
        expected_token: &str,
    ) -> StoreResult<u64> {
        let _ = (id, expected_token);
        Err(StoreError::capability(
            "backend has no native set-based delete support",
        ))
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    /// Count token rows, optionally filtered.
    async fn count_tokens(&self, filter: Option<&TokenFilter<Self::Key>>) -> StoreResult<u64>;

    /// Insert a new row, assigning the key when the record carries the zero
    /// key. Backend rejections (constraint violations) surface unmodified.
    async fn insert_token(
        &self,
        record: TokenRecord<Self::Key>,
    ) -> StoreResult<TokenRecord<Self::Key>>;

    /// Persist an updated row if the stored concurrency token still equals
    /// `expected_token`.
    ///
    /// # Errors
    ///
    /// Returns a `Concurrency` error when the stored token differs or the
    /// row no longer exists; the row is left untouched.
    async fn save_token(
        &self,
        record: &TokenRecord<Self::Key>,
        expected_token: &str,
    ) -> StoreResult<()>;

    /// Delete one row, guarded by the concurrency token.
    ///
    /// # Errors
    ///
    /// Returns a `Concurrency` error when the stored token differs or the
    /// row no longer exists.
    async fn delete_token(&self, id: &Self::Key, expected_token: &str) -> StoreResult<()>;

    /// Point lookup by key.
    async fn fetch_token(&self, id: &Self::Key) -> StoreResult<Option<TokenRecord<Self::Key>>>;

    /// Point lookup by reference identifier.
    async fn fetch_token_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<Self::Key>>>;

    /// List rows in ascending key order, then skip/take.
    async fn list_tokens(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TokenRecord<Self::Key>>>;

    /// Lazy stream of rows matching the filter. Same contract as
    /// [`stream_authorizations`](Self::stream_authorizations).
    fn stream_tokens(
        &self,
        filter: TokenFilter<Self::Key>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<Self::Key>>>;

    /// Set-based revoke over token rows. Same contract as
    /// [`revoke_authorizations`](Self::revoke_authorizations): already
    /// revoked rows are neither touched nor counted.
    async fn revoke_tokens(&self, filter: &TokenFilter<Self::Key>) -> StoreResult<u64> {
        let _ = filter;
        Err(StoreError::capability(
            "backend has no native set-based update support",
        ))
    }

    /// Set-based prune of one batch of prunable token rows. Returns the
    /// number of rows removed.
    async fn prune_tokens(&self, selector: &PruneSelector) -> StoreResult<u64> {
        let _ = selector;
        Err(StoreError::capability(
            "backend has no native set-based delete support",
        ))
    }

    // -------------------------------------------------------------------------
    // Transactional Fallback
    // -------------------------------------------------------------------------

    /// Open a transactional session at the given isolation level.
    ///
    /// The session is scoped to one batch; it must be committed or dropped
    /// (dropping rolls back pending writes where the backend supports it).
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> StoreResult<Box<dyn StorageSession<Key = Self::Key>>>;
}

// =============================================================================
// Storage Session
// =============================================================================

/// One transactional batch with change tracking.
///
/// Rows returned by the `load_*` methods are tracked by the session. A
/// `save_*`/`delete_*` call that observes a stale concurrency token fails
/// with a `Concurrency` error and resets that row's tracked state to
/// unchanged, so subsequent saves and the final commit are unaffected by
/// the conflicting row.
#[async_trait]
pub trait StorageSession: Send {
    /// The backend's native key type.
    type Key: EntityKey;

    /// Load up to `limit` authorization rows matching the filter, tracked.
    async fn load_authorizations(
        &mut self,
        filter: &AuthorizationFilter<Self::Key>,
        limit: usize,
    ) -> StoreResult<Vec<AuthorizationRecord<Self::Key>>>;

    /// Load one batch of prunable authorization rows, tracked.
    async fn load_prunable_authorizations(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<AuthorizationRecord<Self::Key>>>;

    /// Load up to `limit` token rows matching the filter, tracked.
    async fn load_tokens(
        &mut self,
        filter: &TokenFilter<Self::Key>,
        limit: usize,
    ) -> StoreResult<Vec<TokenRecord<Self::Key>>>;

    /// Load one batch of prunable token rows, tracked.
    async fn load_prunable_tokens(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<TokenRecord<Self::Key>>>;

    /// Save one tracked authorization row under optimistic concurrency.
    async fn save_authorization(
        &mut self,
        record: &AuthorizationRecord<Self::Key>,
        expected_token: &str,
    ) -> StoreResult<()>;

    /// Save one tracked token row under optimistic concurrency.
    async fn save_token(
        &mut self,
        record: &TokenRecord<Self::Key>,
        expected_token: &str,
    ) -> StoreResult<()>;

    /// Delete one tracked authorization row under optimistic concurrency.
    async fn delete_authorization(
        &mut self,
        id: &Self::Key,
        expected_token: &str,
    ) -> StoreResult<()>;

    /// Delete one tracked token row under optimistic concurrency.
    async fn delete_token(&mut self, id: &Self::Key, expected_token: &str) -> StoreResult<()>;

    /// Commit the batch.
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    fn authorization(
        subject: &str,
        status: &str,
        kind: &str,
        age: Duration,
    ) -> AuthorizationRecord<Uuid> {
        AuthorizationRecord {
            id: Uuid::new_v4(),
            subject: Some(subject.to_string()),
            status: Some(status.to_string()),
            kind: Some(kind.to_string()),
            creation_date: Some(OffsetDateTime::now_utc() - age),
            concurrency_token: "t".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_authorization_filter_exact_match_and() {
        let record = authorization("alice", "valid", "permanent", Duration::hours(1));

        let mut filter = AuthorizationFilter::<Uuid>::default();
        assert!(filter.matches(&record));

        filter.subject = Some("alice".to_string());
        filter.status = Some("valid".to_string());
        assert!(filter.matches(&record));

        filter.kind = Some("ad-hoc".to_string());
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_filter_on_unset_field_rejects() {
        let mut record = authorization("alice", "valid", "permanent", Duration::hours(1));
        record.application_id = None;

        let filter = AuthorizationFilter::<Uuid> {
            application_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_token_filter_by_authorization() {
        let authorization_id = Uuid::new_v4();
        let record = TokenRecord::<Uuid> {
            id: Uuid::new_v4(),
            authorization_id: Some(authorization_id),
            ..Default::default()
        };

        let filter = TokenFilter::<Uuid> {
            authorization_id: Some(authorization_id),
            ..Default::default()
        };
        assert!(filter.matches(&record));

        let other = TokenFilter::<Uuid> {
            authorization_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(!other.matches(&record));
    }

    #[test]
    fn test_authorization_prune_rule() {
        let threshold = OffsetDateTime::now_utc();

        // Old and revoked: prunable.
        let revoked = authorization("a", "revoked", "permanent", Duration::days(30));
        assert!(authorization_is_prunable(&revoked, 3, threshold));

        // Old, valid, permanent: never prunable regardless of age.
        let valid = authorization("a", "valid", "permanent", Duration::days(365));
        assert!(!authorization_is_prunable(&valid, 0, threshold));

        // Old, valid, ad-hoc without tokens: prunable.
        let ad_hoc = authorization("a", "valid", "ad-hoc", Duration::days(30));
        assert!(authorization_is_prunable(&ad_hoc, 0, threshold));
        assert!(!authorization_is_prunable(&ad_hoc, 1, threshold));

        // Created at/after the threshold: never prunable.
        let mut fresh = authorization("a", "revoked", "permanent", Duration::ZERO);
        fresh.creation_date = Some(threshold);
        assert!(!authorization_is_prunable(&fresh, 0, threshold));
    }

    #[test]
    fn test_token_prune_rule() {
        let now = OffsetDateTime::now_utc();
        let threshold = now;

        let mut token = TokenRecord::<Uuid> {
            id: Uuid::new_v4(),
            status: Some("valid".to_string()),
            creation_date: Some(now - Duration::days(30)),
            ..Default::default()
        };

        // Valid, unexpired, with a valid authorization: kept.
        assert!(!token_is_prunable(&token, false, threshold, now));

        // Linked authorization no longer valid: prunable.
        assert!(token_is_prunable(&token, true, threshold, now));

        // Expired: prunable.
        token.expiration_date = Some(now - Duration::minutes(1));
        assert!(token_is_prunable(&token, false, threshold, now));
        token.expiration_date = None;

        // Inert status: prunable.
        token.status = Some("redeemed".to_string());
        assert!(token_is_prunable(&token, false, threshold, now));

        // Inactive counts as kept.
        token.status = Some("inactive".to_string());
        assert!(!token_is_prunable(&token, false, threshold, now));

        // Created at the threshold: kept.
        token.status = Some("redeemed".to_string());
        token.creation_date = Some(threshold);
        assert!(!token_is_prunable(&token, false, threshold, now));
    }

    #[test]
    fn test_missing_creation_date_is_never_pruned() {
        let threshold = OffsetDateTime::now_utc();
        let record = AuthorizationRecord::<Uuid> {
            id: Uuid::new_v4(),
            status: Some("revoked".to_string()),
            creation_date: None,
            ..Default::default()
        };
        assert!(!authorization_is_prunable(&record, 0, threshold));
    }

    #[test]
    fn test_capabilities_presets() {
        assert!(Capabilities::native().set_based_updates);
        assert!(!Capabilities::fallback_only().set_based_deletes);
    }
}

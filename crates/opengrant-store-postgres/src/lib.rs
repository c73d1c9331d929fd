//! PostgreSQL storage backend for OpenGrant Store.
//!
//! Provides persistent storage for:
//!
//! - Authorization rows (`authorizations` table)
//! - Token rows (`tokens` table)
//!
//! The backend advertises full native bulk support: predicate revoke,
//! prune, and cascade delete each run as a single SQL statement. The
//! transactional fallback path is still available through
//! [`StorageBackend::begin`] and runs real transactions with an explicit
//! isolation level.
//!
//! # Example
//!
//! ```ignore
//! use opengrant_store_postgres::PostgresBackend;
//!
//! let backend = PostgresBackend::connect("postgres://localhost/opengrant").await?;
//! backend.ensure_schema().await?;
//! ```

mod authorization;
mod session;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sqlx_core::pool::Pool;
use sqlx_core::query::query;
use sqlx_postgres::Postgres;
use uuid::Uuid;

use opengrant_store::backend::{
    AuthorizationFilter, Capabilities, IsolationLevel, PruneSelector, StorageBackend,
    StorageSession, TokenFilter,
};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::{AuthorizationRecord, TokenRecord};

use session::PostgresSession;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

/// Translate a database error, keeping the underlying cause attached.
pub(crate) fn map_db_error(error: sqlx_core::Error) -> StoreError {
    if let sqlx_core::Error::Database(ref db_err) = error
        && db_err.is_unique_violation()
    {
        return StoreError::backend_with("unique constraint violated", error);
    }
    StoreError::backend_with("database operation failed", error)
}

/// Page size used by the lazy row streams.
pub(crate) const STREAM_PAGE: i64 = 256;

// =============================================================================
// PostgreSQL Backend
// =============================================================================

/// PostgreSQL storage backend keyed by UUID.
///
/// Holds a shared connection pool; operations draw connections from it and
/// never serialize callers through a single session.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Arc<PgPool>,
}

impl PostgresBackend {
    /// Create a backend over an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create a backend by connecting to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        use sqlx_core::pool::PoolOptions;
        let pool = PoolOptions::<Postgres>::new()
            .connect(database_url)
            .await
            .map_err(map_db_error)?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn pool_arc(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    /// Create the `authorizations` and `tokens` tables and their indexes
    /// when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        query(
            r#"
            CREATE TABLE IF NOT EXISTS authorizations (
                id                UUID PRIMARY KEY,
                subject           TEXT,
                status            TEXT,
                kind              TEXT,
                scopes            TEXT,
                properties        TEXT,
                creation_date     TIMESTAMPTZ,
                concurrency_token TEXT NOT NULL,
                application_id    UUID
            )
            "#,
        )
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id                UUID PRIMARY KEY,
                subject           TEXT,
                status            TEXT,
                kind              TEXT,
                reference_id      TEXT,
                payload           TEXT,
                properties        TEXT,
                creation_date     TIMESTAMPTZ,
                expiration_date   TIMESTAMPTZ,
                redemption_date   TIMESTAMPTZ,
                concurrency_token TEXT NOT NULL,
                application_id    UUID,
                authorization_id  UUID
            )
            "#,
        )
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS authorizations_subject_idx ON authorizations (subject)",
            "CREATE INDEX IF NOT EXISTS authorizations_application_idx ON authorizations (application_id)",
            "CREATE INDEX IF NOT EXISTS tokens_subject_idx ON tokens (subject)",
            "CREATE INDEX IF NOT EXISTS tokens_authorization_idx ON tokens (authorization_id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS tokens_reference_idx ON tokens (reference_id) WHERE reference_id IS NOT NULL",
        ] {
            query(statement)
                .execute(self.pool())
                .await
                .map_err(map_db_error)?;
        }

        tracing::debug!("storage schema ensured");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    type Key = Uuid;

    fn capabilities(&self) -> Capabilities {
        Capabilities::native()
    }

    // -------------------------------------------------------------------------
    // Authorizations
    // -------------------------------------------------------------------------

    async fn count_authorizations(
        &self,
        filter: Option<&AuthorizationFilter<Uuid>>,
    ) -> StoreResult<u64> {
        self.count_authorization_rows(filter).await
    }

    async fn insert_authorization(
        &self,
        record: AuthorizationRecord<Uuid>,
    ) -> StoreResult<AuthorizationRecord<Uuid>> {
        self.insert_authorization_row(record).await
    }

    async fn save_authorization(
        &self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.save_authorization_row(record, expected_token).await
    }

    async fn fetch_authorization(
        &self,
        id: &Uuid,
    ) -> StoreResult<Option<AuthorizationRecord<Uuid>>> {
        self.fetch_authorization_row(id).await
    }

    async fn list_authorizations(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        self.list_authorization_rows(count, offset).await
    }

    fn stream_authorizations(
        &self,
        filter: AuthorizationFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<Uuid>>> {
        self.stream_authorization_rows(filter)
    }

    async fn revoke_authorizations(
        &self,
        filter: &AuthorizationFilter<Uuid>,
    ) -> StoreResult<u64> {
        self.revoke_authorization_rows(filter).await
    }

    async fn prune_authorizations(&self, selector: &PruneSelector) -> StoreResult<u64> {
        self.prune_authorization_rows(selector).await
    }

    async fn delete_authorization_cascade(
        &self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<u64> {
        self.delete_authorization_cascade_rows(id, expected_token)
            .await
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    async fn count_tokens(&self, filter: Option<&TokenFilter<Uuid>>) -> StoreResult<u64> {
        self.count_token_rows(filter).await
    }

    async fn insert_token(&self, record: TokenRecord<Uuid>) -> StoreResult<TokenRecord<Uuid>> {
        self.insert_token_row(record).await
    }

    async fn save_token(
        &self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        self.save_token_row(record, expected_token).await
    }

    async fn delete_token(&self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        self.delete_token_row(id, expected_token).await
    }

    async fn fetch_token(&self, id: &Uuid) -> StoreResult<Option<TokenRecord<Uuid>>> {
        self.fetch_token_row(id).await
    }

    async fn fetch_token_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<Uuid>>> {
        self.fetch_token_row_by_reference(reference_id).await
    }

    async fn list_tokens(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        self.list_token_rows(count, offset).await
    }

    fn stream_tokens(
        &self,
        filter: TokenFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<Uuid>>> {
        self.stream_token_rows(filter)
    }

    async fn revoke_tokens(&self, filter: &TokenFilter<Uuid>) -> StoreResult<u64> {
        self.revoke_token_rows(filter).await
    }

    async fn prune_tokens(&self, selector: &PruneSelector) -> StoreResult<u64> {
        self.prune_token_rows(selector).await
    }

    // -------------------------------------------------------------------------
    // Transactional Fallback
    // -------------------------------------------------------------------------

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> StoreResult<Box<dyn StorageSession<Key = Uuid>>> {
        let session = PostgresSession::begin(self.pool(), isolation).await?;
        Ok(Box::new(session))
    }
}

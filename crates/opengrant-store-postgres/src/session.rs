//! Transactional session for the fallback strategy path.

use async_trait::async_trait;
use sqlx_core::pool::Pool;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::transaction::Transaction;
use sqlx_postgres::Postgres;
use uuid::Uuid;

use opengrant_store::backend::{
    AuthorizationFilter, IsolationLevel, PruneSelector, StorageSession, TokenFilter,
};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::{AuthorizationRecord, TokenRecord};

use crate::authorization::authorization_from_row;
use crate::map_db_error;
use crate::token::token_from_row;

/// One fallback batch inside a real database transaction.
///
/// Optimistic row writes carry their concurrency token in the statement
/// itself, so a conflicting row affects zero rows and leaves nothing
/// pending for it; the rest of the batch commits normally. Dropping the
/// session without committing rolls the transaction back.
pub(crate) struct PostgresSession {
    tx: Transaction<'static, Postgres>,
}

impl PostgresSession {
    pub(crate) async fn begin(
        pool: &Pool<Postgres>,
        isolation: IsolationLevel,
    ) -> StoreResult<Self> {
        let mut tx = pool.begin().await.map_err(map_db_error)?;

        let statement = match isolation {
            IsolationLevel::ReadCommitted => None,
            IsolationLevel::RepeatableRead => {
                Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            }
            IsolationLevel::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        };
        if let Some(statement) = statement {
            query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }

        tracing::trace!(?isolation, "postgres session opened");
        Ok(Self { tx })
    }
}

#[async_trait]
impl StorageSession for PostgresSession {
    type Key = Uuid;

    async fn load_authorizations(
        &mut self,
        filter: &AuthorizationFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows: Vec<_> = query_as(
            r#"
            SELECT id, subject, status, kind, scopes, properties,
                   creation_date, concurrency_token, application_id
            FROM authorizations
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::text IS NULL OR kind = $4)
            ORDER BY id
            LIMIT $5
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(authorization_from_row).collect())
    }

    async fn load_prunable_authorizations(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows: Vec<_> = query_as(
            r#"
            SELECT a.id, a.subject, a.status, a.kind, a.scopes, a.properties,
                   a.creation_date, a.concurrency_token, a.application_id
            FROM authorizations a
            WHERE a.creation_date < $1
              AND (a.status IS DISTINCT FROM 'valid'
                   OR (a.kind = 'ad-hoc' AND NOT EXISTS (
                       SELECT 1 FROM tokens t WHERE t.authorization_id = a.id)))
            ORDER BY a.id
            LIMIT $2
            "#,
        )
        .bind(selector.threshold)
        .bind(selector.limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(authorization_from_row).collect())
    }

    async fn load_tokens(
        &mut self,
        filter: &TokenFilter<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let rows: Vec<_> = query_as(
            r#"
            SELECT id, subject, status, kind, reference_id, payload, properties,
                   creation_date, expiration_date, redemption_date,
                   concurrency_token, application_id, authorization_id
            FROM tokens
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::uuid IS NULL OR authorization_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::text IS NULL OR kind = $5)
            ORDER BY id
            LIMIT $6
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.authorization_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(token_from_row).collect())
    }

    async fn load_prunable_tokens(
        &mut self,
        selector: &PruneSelector,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let rows: Vec<_> = query_as(
            r#"
            SELECT t.id, t.subject, t.status, t.kind, t.reference_id, t.payload,
                   t.properties, t.creation_date, t.expiration_date,
                   t.redemption_date, t.concurrency_token, t.application_id,
                   t.authorization_id
            FROM tokens t
            LEFT JOIN authorizations a ON a.id = t.authorization_id
            WHERE t.creation_date < $1
              AND (t.status IS NULL
                   OR t.status NOT IN ('inactive', 'valid')
                   OR (a.id IS NOT NULL AND a.status IS DISTINCT FROM 'valid')
                   OR t.expiration_date < NOW())
            ORDER BY t.id
            LIMIT $2
            "#,
        )
        .bind(selector.threshold)
        .bind(selector.limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(token_from_row).collect())
    }

    async fn save_authorization(
        &mut self,
        record: &AuthorizationRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let result = query(
            r#"
            UPDATE authorizations
            SET subject = $2,
                status = $3,
                kind = $4,
                scopes = $5,
                properties = $6,
                creation_date = $7,
                concurrency_token = $8,
                application_id = $9
            WHERE id = $1
              AND concurrency_token = $10
            "#,
        )
        .bind(record.id)
        .bind(record.subject.as_deref())
        .bind(record.status.as_deref())
        .bind(record.kind.as_deref())
        .bind(record.scopes.as_deref())
        .bind(record.properties.as_deref())
        .bind(record.creation_date)
        .bind(record.concurrency_token.as_str())
        .bind(record.application_id)
        .bind(expected_token)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::concurrency(format!(
                "authorization {} was modified concurrently",
                record.id
            )));
        }
        Ok(())
    }

    async fn save_token(
        &mut self,
        record: &TokenRecord<Uuid>,
        expected_token: &str,
    ) -> StoreResult<()> {
        let result = query(
            r#"
            UPDATE tokens
            SET subject = $2,
                status = $3,
                kind = $4,
                reference_id = $5,
                payload = $6,
                properties = $7,
                creation_date = $8,
                expiration_date = $9,
                redemption_date = $10,
                concurrency_token = $11,
                application_id = $12,
                authorization_id = $13
            WHERE id = $1
              AND concurrency_token = $14
            "#,
        )
        .bind(record.id)
        .bind(record.subject.as_deref())
        .bind(record.status.as_deref())
        .bind(record.kind.as_deref())
        .bind(record.reference_id.as_deref())
        .bind(record.payload.as_deref())
        .bind(record.properties.as_deref())
        .bind(record.creation_date)
        .bind(record.expiration_date)
        .bind(record.redemption_date)
        .bind(record.concurrency_token.as_str())
        .bind(record.application_id)
        .bind(record.authorization_id)
        .bind(expected_token)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::concurrency(format!(
                "token {} was modified concurrently",
                record.id
            )));
        }
        Ok(())
    }

    async fn delete_authorization(
        &mut self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<()> {
        let result = query(
            r#"
            DELETE FROM authorizations
            WHERE id = $1
              AND concurrency_token = $2
            "#,
        )
        .bind(id)
        .bind(expected_token)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::concurrency(format!(
                "authorization {id} was modified concurrently"
            )));
        }
        Ok(())
    }

    async fn delete_token(&mut self, id: &Uuid, expected_token: &str) -> StoreResult<()> {
        let result = query(
            r#"
            DELETE FROM tokens
            WHERE id = $1
              AND concurrency_token = $2
            "#,
        )
        .bind(id)
        .bind(expected_token)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::concurrency(format!(
                "token {id} was modified concurrently"
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_db_error)
    }
}

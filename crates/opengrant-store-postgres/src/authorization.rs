//! Authorization row operations.

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;
use uuid::Uuid;

use opengrant_store::backend::{AuthorizationFilter, PruneSelector};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::AuthorizationRecord;

use crate::{PostgresBackend, STREAM_PAGE, map_db_error};

/// Column tuple: id, subject, status, kind, scopes, properties,
/// creation_date, concurrency_token, application_id.
type AuthorizationRow = (
    Uuid,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<OffsetDateTime>,
    String,
    Option<Uuid>,
);

pub(crate) fn authorization_from_row(row: AuthorizationRow) -> AuthorizationRecord<Uuid> {
    AuthorizationRecord {
        id: row.0,
        subject: row.1,
        status: row.2,
        kind: row.3,
        scopes: row.4,
        properties: row.5,
        creation_date: row.6,
        concurrency_token: row.7,
        application_id: row.8,
    }
}

impl PostgresBackend {
    pub(crate) async fn count_authorization_rows(
        &self,
        filter: Option<&AuthorizationFilter<Uuid>>,
    ) -> StoreResult<u64> {
        let empty = AuthorizationFilter::default();
        let filter = filter.unwrap_or(&empty);

        let (count,): (i64,) = query_as(
            r#"
            SELECT COUNT(*)
            FROM authorizations
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::text IS NULL OR kind = $4)
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .fetch_one(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(count as u64)
    }

    pub(crate) async fn insert_authorization_row(
        &self,
        mut record: AuthorizationRecord<Uuid>,
    ) -> StoreResult<AuthorizationRecord<Uuid>> {
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }

        query(
            r#"
            INSERT INTO authorizations
                (id, subject, status, kind, scopes, properties,
                 creation_date, concurrency_token, application_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(record)
    }

    pub(crate) async fn save_authorization_row(
        &self,
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
        .execute(self.pool())
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

    pub(crate) async fn fetch_authorization_row(
        &self,
        id: &Uuid,
    ) -> StoreResult<Option<AuthorizationRecord<Uuid>>> {
        let row: Option<AuthorizationRow> = query_as(
            r#"
            SELECT id, subject, status, kind, scopes, properties,
                   creation_date, concurrency_token, application_id
            FROM authorizations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(row.map(authorization_from_row))
    }

    pub(crate) async fn list_authorization_rows(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuthorizationRecord<Uuid>>> {
        let rows: Vec<AuthorizationRow> = query_as(
            r#"
            SELECT id, subject, status, kind, scopes, properties,
                   creation_date, concurrency_token, application_id
            FROM authorizations
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(count.map(|c| c as i64))
        .bind(offset.unwrap_or(0) as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(authorization_from_row).collect())
    }

    pub(crate) fn stream_authorization_rows(
        &self,
        filter: AuthorizationFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<AuthorizationRecord<Uuid>>> {
        let pool = self.pool_arc();
        futures_util::stream::try_unfold(
            (pool, filter, None::<Uuid>),
            |(pool, filter, last_id)| async move {
                let rows: Vec<AuthorizationRow> = query_as(
                    r#"
                    SELECT id, subject, status, kind, scopes, properties,
                           creation_date, concurrency_token, application_id
                    FROM authorizations
                    WHERE ($1::text IS NULL OR subject = $1)
                      AND ($2::uuid IS NULL OR application_id = $2)
                      AND ($3::text IS NULL OR status = $3)
                      AND ($4::text IS NULL OR kind = $4)
                      AND ($5::uuid IS NULL OR id > $5)
                    ORDER BY id
                    LIMIT $6
                    "#,
                )
                .bind(filter.subject.as_deref())
                .bind(filter.application_id)
                .bind(filter.status.as_deref())
                .bind(filter.kind.as_deref())
                .bind(last_id)
                .bind(STREAM_PAGE)
                .fetch_all(pool.as_ref())
                .await
                .map_err(map_db_error)?;

                if rows.is_empty() {
                    return Ok::<_, StoreError>(None);
                }
                let next_last = rows.last().map(|r| r.0);
                let page: Vec<_> = rows
                    .into_iter()
                    .map(authorization_from_row)
                    .map(Ok::<_, StoreError>)
                    .collect();
                Ok(Some((
                    futures_util::stream::iter(page),
                    (pool, filter, next_last),
                )))
            },
        )
        .try_flatten()
        .boxed()
    }

    pub(crate) async fn revoke_authorization_rows(
        &self,
        filter: &AuthorizationFilter<Uuid>,
    ) -> StoreResult<u64> {
        let result = query(
            r#"
            UPDATE authorizations
            SET status = 'revoked',
                concurrency_token = gen_random_uuid()::text
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::text IS NULL OR kind = $4)
              AND status IS DISTINCT FROM 'revoked'
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(result.rows_affected())
    }

    pub(crate) async fn prune_authorization_rows(
        &self,
        selector: &PruneSelector,
    ) -> StoreResult<u64> {
        let result = query(
            r#"
            DELETE FROM authorizations
            WHERE id IN (
                SELECT a.id
                FROM authorizations a
                WHERE a.creation_date < $1
                  AND (a.status IS DISTINCT FROM 'valid'
                       OR (a.kind = 'ad-hoc' AND NOT EXISTS (
                           SELECT 1 FROM tokens t WHERE t.authorization_id = a.id)))
                ORDER BY a.id
                LIMIT $2
            )
            "#,
        )
        .bind(selector.threshold)
        .bind(selector.limit as i64)
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(result.rows_affected())
    }

    pub(crate) async fn delete_authorization_cascade_rows(
        &self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<u64> {
        let (authorizations, tokens): (i64, i64) = query_as(
            r#"
            WITH target AS (
                SELECT id
                FROM authorizations
                WHERE id = $1
                  AND concurrency_token = $2
            ),
            deleted_tokens AS (
                DELETE FROM tokens
                WHERE authorization_id IN (SELECT id FROM target)
                RETURNING 1
            ),
            deleted_authorizations AS (
                DELETE FROM authorizations
                WHERE id IN (SELECT id FROM target)
                RETURNING 1
            )
            SELECT (SELECT COUNT(*) FROM deleted_authorizations),
                   (SELECT COUNT(*) FROM deleted_tokens)
            "#,
        )
        .bind(id)
        .bind(expected_token)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_error)?;

        if authorizations == 0 {
            return Err(StoreError::concurrency(format!(
                "authorization {id} was modified concurrently"
            )));
        }
        Ok(tokens as u64)
    }
}

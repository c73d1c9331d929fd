//! Token row operations.

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;
use uuid::Uuid;

use opengrant_store::backend::{PruneSelector, TokenFilter};
use opengrant_store::error::{StoreError, StoreResult};
use opengrant_store::types::TokenRecord;

use crate::{PostgresBackend, STREAM_PAGE, map_db_error};

/// Column tuple: id, subject, status, kind, reference_id, payload,
/// properties, creation_date, expiration_date, redemption_date,
/// concurrency_token, application_id, authorization_id.
type TokenRow = (
    Uuid,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<OffsetDateTime>,
    Option<OffsetDateTime>,
    Option<OffsetDateTime>,
    String,
    Option<Uuid>,
    Option<Uuid>,
);

pub(crate) fn token_from_row(row: TokenRow) -> TokenRecord<Uuid> {
    TokenRecord {
        id: row.0,
        subject: row.1,
        status: row.2,
        kind: row.3,
        reference_id: row.4,
        payload: row.5,
        properties: row.6,
        creation_date: row.7,
        expiration_date: row.8,
        redemption_date: row.9,
        concurrency_token: row.10,
        application_id: row.11,
        authorization_id: row.12,
    }
}

const TOKEN_COLUMNS: &str = "id, subject, status, kind, reference_id, payload, properties, \
     creation_date, expiration_date, redemption_date, concurrency_token, \
     application_id, authorization_id";

impl PostgresBackend {
    pub(crate) async fn count_token_rows(
        &self,
        filter: Option<&TokenFilter<Uuid>>,
    ) -> StoreResult<u64> {
        let empty = TokenFilter::default();
        let filter = filter.unwrap_or(&empty);

        let (count,): (i64,) = query_as(
            r#"
            SELECT COUNT(*)
            FROM tokens
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::uuid IS NULL OR authorization_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::text IS NULL OR kind = $5)
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.authorization_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .fetch_one(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(count as u64)
    }

    pub(crate) async fn insert_token_row(
        &self,
        mut record: TokenRecord<Uuid>,
    ) -> StoreResult<TokenRecord<Uuid>> {
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }

        query(
            r#"
            INSERT INTO tokens
                (id, subject, status, kind, reference_id, payload, properties,
                 creation_date, expiration_date, redemption_date,
                 concurrency_token, application_id, authorization_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(record)
    }

    pub(crate) async fn save_token_row(
        &self,
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
        .execute(self.pool())
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

    pub(crate) async fn delete_token_row(
        &self,
        id: &Uuid,
        expected_token: &str,
    ) -> StoreResult<()> {
        let result = query(
            r#"
            DELETE FROM tokens
            WHERE id = $1
              AND concurrency_token = $2
            "#,
        )
        .bind(id)
        .bind(expected_token)
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::concurrency(format!(
                "token {id} was modified concurrently"
            )));
        }
        Ok(())
    }

    pub(crate) async fn fetch_token_row(
        &self,
        id: &Uuid,
    ) -> StoreResult<Option<TokenRecord<Uuid>>> {
        let row: Option<TokenRow> = query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(row.map(token_from_row))
    }

    pub(crate) async fn fetch_token_row_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Option<TokenRecord<Uuid>>> {
        let row: Option<TokenRow> = query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE reference_id = $1"
        ))
        .bind(reference_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(row.map(token_from_row))
    }

    pub(crate) async fn list_token_rows(
        &self,
        count: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TokenRecord<Uuid>>> {
        let rows: Vec<TokenRow> = query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(count.map(|c| c as i64))
        .bind(offset.unwrap_or(0) as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(token_from_row).collect())
    }

    pub(crate) fn stream_token_rows(
        &self,
        filter: TokenFilter<Uuid>,
    ) -> BoxStream<'static, StoreResult<TokenRecord<Uuid>>> {
        let pool = self.pool_arc();
        futures_util::stream::try_unfold(
            (pool, filter, None::<Uuid>),
            |(pool, filter, last_id)| async move {
                let rows: Vec<TokenRow> = query_as(&format!(
                    r#"
                    SELECT {TOKEN_COLUMNS}
                    FROM tokens
                    WHERE ($1::text IS NULL OR subject = $1)
                      AND ($2::uuid IS NULL OR application_id = $2)
                      AND ($3::uuid IS NULL OR authorization_id = $3)
                      AND ($4::text IS NULL OR status = $4)
                      AND ($5::text IS NULL OR kind = $5)
                      AND ($6::uuid IS NULL OR id > $6)
                    ORDER BY id
                    LIMIT $7
                    "#
                ))
                .bind(filter.subject.as_deref())
                .bind(filter.application_id)
                .bind(filter.authorization_id)
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
                let page: Vec<_> = rows.into_iter().map(token_from_row).map(Ok::<_, StoreError>).collect();
                Ok(Some((
                    futures_util::stream::iter(page),
                    (pool, filter, next_last),
                )))
            },
        )
        .try_flatten()
        .boxed()
    }

    pub(crate) async fn revoke_token_rows(&self, filter: &TokenFilter<Uuid>) -> StoreResult<u64> {
        let result = query(
            r#"
            UPDATE tokens
            SET status = 'revoked',
                concurrency_token = gen_random_uuid()::text
            WHERE ($1::text IS NULL OR subject = $1)
              AND ($2::uuid IS NULL OR application_id = $2)
              AND ($3::uuid IS NULL OR authorization_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::text IS NULL OR kind = $5)
              AND status IS DISTINCT FROM 'revoked'
            "#,
        )
        .bind(filter.subject.as_deref())
        .bind(filter.application_id)
        .bind(filter.authorization_id)
        .bind(filter.status.as_deref())
        .bind(filter.kind.as_deref())
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;

        Ok(result.rows_affected())
    }

    pub(crate) async fn prune_token_rows(&self, selector: &PruneSelector) -> StoreResult<u64> {
        // A token survives while it is inactive or valid, its linked
        // authorization (when it exists) is still valid, and it is
        // unexpired. Rows without a creation date are never selected.
        let result = query(
            r#"
            DELETE FROM tokens
            WHERE id IN (
                SELECT t.id
                FROM tokens t
                LEFT JOIN authorizations a ON a.id = t.authorization_id
                WHERE t.creation_date < $1
                  AND (t.status IS NULL
                       OR t.status NOT IN ('inactive', 'valid')
                       OR (a.id IS NOT NULL AND a.status IS DISTINCT FROM 'valid')
                       OR t.expiration_date < NOW())
                ORDER BY t.id
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
}

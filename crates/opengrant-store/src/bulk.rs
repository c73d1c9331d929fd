//! Bulk operation strategy.
//!
//! Every predicate-driven mutation (revoke-by-predicate, prune, cascade
//! delete) runs through this module, which picks between two execution
//! paths at call time:
//!
//! - the **set-based path**, one native backend statement, used when the
//!   backend advertises the capability and bulk operations are not
//!   administratively disabled;
//! - the **fallback path**, a transaction at an explicit isolation level
//!   that loads matching rows with change tracking, mutates them in
//!   memory, and saves row by row.
//!
//! Both paths produce the same persisted state and affected-row count for
//! identical predicates and data; the selection is a capability and
//! performance decision only.

use tokio_util::sync::CancellationToken;

use crate::backend::{
    AuthorizationFilter, IsolationLevel, PruneSelector, StorageBackend, TokenFilter,
};
use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::store::fresh_concurrency_token;
use crate::types::statuses;

/// Safety bound on prune iterations, mirroring the batch cap: a backend
/// that keeps failing or keeps reporting progress cannot spin forever.
const MAX_PRUNE_BATCHES: usize = 1_000;

fn use_set_based_updates<B: StorageBackend>(backend: &B, options: &StoreOptions) -> bool {
    backend.capabilities().set_based_updates && !options.disable_bulk_operations
}

fn use_set_based_deletes<B: StorageBackend>(backend: &B, options: &StoreOptions) -> bool {
    backend.capabilities().set_based_deletes && !options.disable_bulk_operations
}

fn finish_batch(succeeded: u64, causes: Vec<StoreError>) -> StoreResult<u64> {
    if causes.is_empty() {
        Ok(succeeded)
    } else {
        Err(StoreError::aggregate(succeeded, causes))
    }
}

// =============================================================================
// Revoke
// =============================================================================

/// Flip every matching authorization to `revoked`, returning the count
/// changed. Rows already revoked are not touched or counted.
pub(crate) async fn revoke_authorizations<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    filter: &AuthorizationFilter<B::Key>,
) -> StoreResult<u64> {
    if use_set_based_updates(backend, options) {
        let affected = backend.revoke_authorizations(filter).await?;
        tracing::debug!(affected, path = "set-based", "authorizations revoked");
        return Ok(affected);
    }

    let mut session = backend.begin(IsolationLevel::ReadCommitted).await?;
    let rows = session.load_authorizations(filter, usize::MAX).await?;

    let mut succeeded = 0u64;
    let mut causes = Vec::new();
    for mut record in rows {
        if record.has_status(statuses::REVOKED) {
            continue;
        }
        let expected = std::mem::take(&mut record.concurrency_token);
        record.status = Some(statuses::REVOKED.to_string());
        record.concurrency_token = fresh_concurrency_token();
        match session.save_authorization(&record, &expected).await {
            Ok(()) => succeeded += 1,
            // The session already reset the conflicting row; keep going.
            Err(error) => causes.push(error),
        }
    }
    session.commit().await?;

    tracing::debug!(
        affected = succeeded,
        conflicts = causes.len(),
        path = "fallback",
        "authorizations revoked"
    );
    finish_batch(succeeded, causes)
}

/// Flip every matching token to `revoked`, returning the count changed.
/// Rows already revoked are not touched or counted.
pub(crate) async fn revoke_tokens<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    filter: &TokenFilter<B::Key>,
) -> StoreResult<u64> {
    if use_set_based_updates(backend, options) {
        let affected = backend.revoke_tokens(filter).await?;
        tracing::debug!(affected, path = "set-based", "tokens revoked");
        return Ok(affected);
    }

    let mut session = backend.begin(IsolationLevel::ReadCommitted).await?;
    let rows = session.load_tokens(filter, usize::MAX).await?;

    let mut succeeded = 0u64;
    let mut causes = Vec::new();
    for mut record in rows {
        if record.has_status(statuses::REVOKED) {
            continue;
        }
        let expected = std::mem::take(&mut record.concurrency_token);
        record.status = Some(statuses::REVOKED.to_string());
        record.concurrency_token = fresh_concurrency_token();
        match session.save_token(&record, &expected).await {
            Ok(()) => succeeded += 1,
            Err(error) => causes.push(error),
        }
    }
    session.commit().await?;

    tracing::debug!(
        affected = succeeded,
        conflicts = causes.len(),
        path = "fallback",
        "tokens revoked"
    );
    finish_batch(succeeded, causes)
}

// =============================================================================
// Cascade Delete
// =============================================================================

/// Delete an authorization together with every linked token.
///
/// The set-based path removes the pair in one atomic statement. The
/// fallback opens a serializable transaction so a token inserted for the
/// authorization while the delete runs makes the transaction fail instead
/// of surviving as an orphan; that failure mode is the accepted behavior,
/// rather than stronger locking.
pub(crate) async fn delete_authorization_cascade<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    id: &B::Key,
    expected_token: &str,
) -> StoreResult<()> {
    if use_set_based_deletes(backend, options) {
        let tokens = backend
            .delete_authorization_cascade(id, expected_token)
            .await?;
        tracing::debug!(
            linked_tokens = tokens,
            path = "set-based",
            "authorization deleted"
        );
        return Ok(());
    }

    let mut session = backend.begin(IsolationLevel::Serializable).await?;

    let filter = TokenFilter {
        authorization_id: Some(id.clone()),
        ..Default::default()
    };
    let tokens = session.load_tokens(&filter, usize::MAX).await?;
    let linked = tokens.len();
    for token in &tokens {
        session
            .delete_token(&token.id, &token.concurrency_token)
            .await?;
    }
    session.delete_authorization(id, expected_token).await?;
    session.commit().await?;

    tracing::debug!(
        linked_tokens = linked,
        path = "fallback",
        "authorization deleted"
    );
    Ok(())
}

// =============================================================================
// Prune
// =============================================================================

enum PruneKind {
    Authorizations,
    Tokens,
}

/// Remove stale authorization rows in capped batches until a batch reports
/// zero affected rows. See [`prune`] for the shared loop semantics.
pub(crate) async fn prune_authorizations<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    threshold: time::OffsetDateTime,
    cancellation: &CancellationToken,
) -> StoreResult<u64> {
    prune(
        backend,
        options,
        threshold,
        cancellation,
        PruneKind::Authorizations,
    )
    .await
}

/// Remove stale token rows in capped batches until a batch reports zero
/// affected rows. See [`prune`] for the shared loop semantics.
pub(crate) async fn prune_tokens<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    threshold: time::OffsetDateTime,
    cancellation: &CancellationToken,
) -> StoreResult<u64> {
    prune(backend, options, threshold, cancellation, PruneKind::Tokens).await
}

/// Shared prune loop.
///
/// Each iteration processes one capped batch through the selected strategy
/// path. Batch failures are collected rather than fatal; the loop moves on
/// to the next batch and the collected causes are raised together at the
/// end, alongside the count already pruned. Cancellation is honored
/// between batches only; a batch that committed stays committed.
async fn prune<B: StorageBackend>(
    backend: &B,
    options: &StoreOptions,
    threshold: time::OffsetDateTime,
    cancellation: &CancellationToken,
    kind: PruneKind,
) -> StoreResult<u64> {
    let selector = PruneSelector {
        threshold,
        limit: options.prune_batch_size,
    };
    let set_based = use_set_based_deletes(backend, options);

    let mut pruned = 0u64;
    let mut causes = Vec::new();

    for batch in 0..MAX_PRUNE_BATCHES {
        if cancellation.is_cancelled() {
            tracing::info!(batch, pruned, "prune cancelled between batches");
            break;
        }

        let outcome = if set_based {
            match kind {
                PruneKind::Authorizations => backend.prune_authorizations(&selector).await,
                PruneKind::Tokens => backend.prune_tokens(&selector).await,
            }
        } else {
            prune_batch_fallback(backend, &selector, &kind).await
        };

        match outcome {
            Ok(0) => break,
            Ok(affected) => {
                pruned += affected;
                tracing::debug!(batch, affected, pruned, "prune batch completed");
            }
            Err(StoreError::Aggregate {
                succeeded,
                causes: batch_causes,
            }) => {
                pruned += succeeded;
                causes.extend(batch_causes);
            }
            Err(error) => causes.push(error),
        }
    }

    finish_batch(pruned, causes)
}

/// One fallback prune batch: repeatable read, tracked load, per-row delete.
///
/// A row-level conflict is captured and the batch continues; the session
/// has already reset the conflicting row so the commit is unaffected.
async fn prune_batch_fallback<B: StorageBackend>(
    backend: &B,
    selector: &PruneSelector,
    kind: &PruneKind,
) -> StoreResult<u64> {
    let mut session = backend.begin(IsolationLevel::RepeatableRead).await?;

    let mut succeeded = 0u64;
    let mut causes = Vec::new();

    match kind {
        PruneKind::Authorizations => {
            let rows = session.load_prunable_authorizations(selector).await?;
            if rows.is_empty() {
                return Ok(0);
            }
            for record in rows {
                match session
                    .delete_authorization(&record.id, &record.concurrency_token)
                    .await
                {
                    Ok(()) => succeeded += 1,
                    Err(error) => causes.push(error),
                }
            }
        }
        PruneKind::Tokens => {
            let rows = session.load_prunable_tokens(selector).await?;
            if rows.is_empty() {
                return Ok(0);
            }
            for record in rows {
                match session
                    .delete_token(&record.id, &record.concurrency_token)
                    .await
                {
                    Ok(()) => succeeded += 1,
                    Err(error) => causes.push(error),
                }
            }
        }
    }

    session.commit().await?;
    finish_batch(succeeded, causes)
}

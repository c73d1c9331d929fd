//! Store lifecycle tests over the in-memory backend: create, find,
//! accessors, unit-of-work visibility, optimistic updates, and listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::TryStreamExt;
use opengrant_store::{
    AuthorizationStore, StoreOptions, TokenRecord, TokenStore, UnitOfWork, statuses,
};
use opengrant_store_memory::MemoryBackend;
use uuid::Uuid;

fn authorization_store(backend: Arc<MemoryBackend>) -> AuthorizationStore<MemoryBackend> {
    AuthorizationStore::new(backend, StoreOptions::default())
}

fn token_store(backend: Arc<MemoryBackend>) -> TokenStore<MemoryBackend> {
    TokenStore::new(backend, StoreOptions::default())
}

#[tokio::test]
async fn test_create_assigns_id_token_and_creation_date() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(Arc::clone(&backend));
    let mut uow = UnitOfWork::new();

    let mut record = store.instantiate().unwrap();
    record.subject = Some("alice".to_string());
    record.status = Some(statuses::VALID.to_string());

    let stored = store.create(&mut uow, record).await.unwrap();
    assert!(!stored.id.is_nil());
    assert!(!stored.concurrency_token.is_empty());
    assert!(stored.creation_date.is_some());
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_by_id_consults_unit_of_work_first() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(Arc::clone(&backend));
    let mut uow = UnitOfWork::new();

    let mut record = store.instantiate().unwrap();
    record.subject = Some("alice".to_string());
    let stored = store.create(&mut uow, record).await.unwrap();
    let id = store.get_id(&stored).unwrap();

    // Another writer changes the row behind this unit of work's back.
    let mut changed = stored.clone();
    changed.subject = Some("mallory".to_string());
    changed.concurrency_token = "other".to_string();
    opengrant_store::StorageBackend::save_authorization(
        backend.as_ref(),
        &changed,
        &stored.concurrency_token,
    )
    .await
    .unwrap();

    // The tracked copy wins inside the same unit of work.
    let seen = store.find_by_id(&mut uow, &id).await.unwrap().unwrap();
    assert_eq!(seen.subject.as_deref(), Some("alice"));

    // A fresh unit of work observes the committed state.
    let mut fresh = UnitOfWork::new();
    let seen = store.find_by_id(&mut fresh, &id).await.unwrap().unwrap();
    assert_eq!(seen.subject.as_deref(), Some("mallory"));
}

#[tokio::test]
async fn test_update_regenerates_concurrency_token() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);
    let mut uow = UnitOfWork::new();

    let stored = store
        .create(&mut uow, store.instantiate().unwrap())
        .await
        .unwrap();
    let first_token = stored.concurrency_token.clone();

    let mut record = stored;
    record.subject = Some("alice".to_string());
    store.update(&mut uow, &mut record).await.unwrap();
    assert_ne!(record.concurrency_token, first_token);
}

#[tokio::test]
async fn test_stale_update_fails_without_effect() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);

    let mut uow_a = UnitOfWork::new();
    let stored = store
        .create(&mut uow_a, store.instantiate().unwrap())
        .await
        .unwrap();
    let id = store.get_id(&stored).unwrap();

    // Two callers load the same row.
    let mut uow_b = UnitOfWork::new();
    let mut copy_a = store.find_by_id(&mut uow_a, &id).await.unwrap().unwrap();
    let mut copy_b = store.find_by_id(&mut uow_b, &id).await.unwrap().unwrap();

    copy_a.subject = Some("first-writer".to_string());
    store.update(&mut uow_a, &mut copy_a).await.unwrap();

    copy_b.subject = Some("second-writer".to_string());
    let err = store.update(&mut uow_b, &mut copy_b).await.unwrap_err();
    assert!(err.is_concurrency());

    // The failed attempt left the first writer's state untouched, and the
    // loser's unit of work rereads fresh data.
    let seen = store.find_by_id(&mut uow_b, &id).await.unwrap().unwrap();
    assert_eq!(seen.subject.as_deref(), Some("first-writer"));
}

#[tokio::test]
async fn test_update_without_id_is_argument_error() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);
    let mut uow = UnitOfWork::new();

    let mut blank = store.instantiate().unwrap();
    let err = store.update(&mut uow, &mut blank).await.unwrap_err();
    assert!(err.is_argument());
}

#[tokio::test]
async fn test_scopes_accessors_preserve_order_and_clear() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);

    let mut record = store.instantiate().unwrap();
    let scopes = vec!["openid".to_string(), "email".to_string()];
    store.set_scopes(&mut record, &scopes).unwrap();
    assert_eq!(record.scopes.as_deref(), Some(r#"["openid","email"]"#));
    assert_eq!(*store.get_scopes(&record).unwrap(), scopes);

    store.set_scopes(&mut record, &[]).unwrap();
    assert_eq!(record.scopes, None);
    assert!(store.get_scopes(&record).unwrap().is_empty());
}

#[tokio::test]
async fn test_properties_accessors() {
    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend);

    let mut record = store.instantiate().unwrap();
    let mut properties = BTreeMap::new();
    properties.insert("display".to_string(), serde_json::json!("Demo app"));
    properties.insert("attempts".to_string(), serde_json::json!(2));
    store.set_properties(&mut record, &properties).unwrap();

    let read = store.get_properties(&record).unwrap();
    assert_eq!(*read, properties);

    store.set_properties(&mut record, &BTreeMap::new()).unwrap();
    assert_eq!(record.properties, None);
}

#[tokio::test]
async fn test_find_filters_by_scope_superset() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);
    let mut uow = UnitOfWork::new();

    let application_id = Uuid::new_v4();
    for scopes in [
        vec!["openid".to_string(), "email".to_string()],
        vec!["email".to_string()],
    ] {
        let mut record = store.instantiate().unwrap();
        record.subject = Some("alice".to_string());
        record.application_id = Some(application_id);
        record.status = Some(statuses::VALID.to_string());
        store.set_scopes(&mut record, &scopes).unwrap();
        store.create(&mut uow, record).await.unwrap();
    }

    let required = vec!["openid".to_string()];
    let found: Vec<_> = store
        .find(
            "alice",
            &application_id.to_string(),
            None,
            None,
            Some(&required),
        )
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    let granted = store.get_scopes(&found[0]).unwrap();
    assert!(granted.contains(&"openid".to_string()));
}

#[tokio::test]
async fn test_find_rejects_empty_arguments() {
    let backend = Arc::new(MemoryBackend::new());
    let store = authorization_store(backend);

    assert!(store.find("", "client", None, None, None).err().unwrap().is_argument());
    assert!(store.find("alice", "", None, None, None).err().unwrap().is_argument());
    assert!(
        store
            .find("alice", "not-a-uuid", None, None, None)
            .err()
            .unwrap()
            .is_argument()
    );
}

#[tokio::test]
async fn test_token_reference_id_lookup_and_uow() {
    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend);
    let mut uow = UnitOfWork::new();

    let mut record = store.instantiate().unwrap();
    record.reference_id = Some("ref-42".to_string());
    store.create(&mut uow, record).await.unwrap();

    let found = store
        .find_by_reference_id(&mut uow, "ref-42")
        .await
        .unwrap();
    assert!(found.is_some());

    let missing = store.find_by_reference_id(&mut uow, "ref-0").await.unwrap();
    assert!(missing.is_none());

    let err = store.find_by_reference_id(&mut uow, "").await.unwrap_err();
    assert!(err.is_argument());
}

#[tokio::test]
async fn test_create_surfaces_backend_rejection_unmodified() {
    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend);
    let mut uow = UnitOfWork::new();

    let mut record = store.instantiate().unwrap();
    record.reference_id = Some("ref-1".to_string());
    store.create(&mut uow, record).await.unwrap();

    let mut duplicate = store.instantiate().unwrap();
    duplicate.reference_id = Some("ref-1".to_string());
    let err = store.create(&mut uow, duplicate).await.unwrap_err();
    assert!(err.is_backend());
}

#[tokio::test]
async fn test_relation_accessors_round_trip_through_codec() {
    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend);

    let mut record = store.instantiate().unwrap();
    assert_eq!(store.get_authorization_id(&record), None);

    let authorization_id = Uuid::new_v4().to_string();
    store
        .set_authorization_id(&mut record, Some(&authorization_id))
        .unwrap();
    assert_eq!(store.get_authorization_id(&record), Some(authorization_id));

    // Empty text clears the link; a detached record reads as absent.
    store.set_authorization_id(&mut record, Some("")).unwrap();
    assert_eq!(store.get_authorization_id(&record), None);

    let err = store
        .set_authorization_id(&mut record, Some("garbage"))
        .unwrap_err();
    assert!(err.is_argument());
}

#[tokio::test]
async fn test_list_is_stable_and_pageable() {
    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend);
    let mut uow = UnitOfWork::new();

    for _ in 0..7 {
        store
            .create(&mut uow, TokenRecord::default())
            .await
            .unwrap();
    }

    let all: Vec<_> = store.list(None, None).try_collect().await.unwrap();
    assert_eq!(all.len(), 7);
    let ids: Vec<_> = all.iter().map(|t| t.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "listing must be ascending by id");

    let page: Vec<_> = store.list(Some(2), Some(3)).try_collect().await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, ids[3]);
    assert_eq!(page[1].id, ids[4]);
}

#[tokio::test]
async fn test_failing_factory_is_construction_error() {
    struct Failing;
    impl opengrant_store::RecordFactory<TokenRecord<Uuid>> for Failing {
        fn instantiate(&self) -> opengrant_store::StoreResult<TokenRecord<Uuid>> {
            Err(opengrant_store::StoreError::construction(
                "no parameterless constructor",
            ))
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let store = token_store(backend).with_factory(Arc::new(Failing));

    let err = store.instantiate().unwrap_err();
    assert!(err.is_construction());
}

#[tokio::test]
async fn test_shared_parse_cache_between_stores() {
    let backend = Arc::new(MemoryBackend::new());
    let authorizations = authorization_store(Arc::clone(&backend));
    let tokens =
        token_store(backend).with_parse_cache(Arc::clone(authorizations.parse_cache()));

    let mut record = authorizations.instantiate().unwrap();
    authorizations
        .set_scopes(&mut record, &["openid".to_string()])
        .unwrap();
    authorizations.get_scopes(&record).unwrap();
    authorizations.get_scopes(&record).unwrap();

    let stats = authorizations.parse_cache().stats();
    assert!(stats.hits >= 1);
    // Also visible through the token store's handle.
    let _ = tokens;
}

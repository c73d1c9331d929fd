//! Unit of work.
//!
//! An explicit identity map passed into store calls. Point lookups consult
//! it before querying the backend, so a caller that created or edited a
//! record earlier in the same unit of work sees its own uncommitted state
//! on repeated lookups.

use std::collections::HashMap;

use crate::keys::EntityKey;
use crate::types::{AuthorizationRecord, TokenRecord};

/// Identity map of records loaded or mutated during one logical operation.
///
/// The map never expires entries on its own; its lifetime is the caller's
/// request scope. Create one per protocol request and drop it at the end.
#[derive(Debug)]
pub struct UnitOfWork<K: EntityKey> {
    authorizations: HashMap<K, AuthorizationRecord<K>>,
    tokens: HashMap<K, TokenRecord<K>>,
}

impl<K: EntityKey> Default for UnitOfWork<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityKey> UnitOfWork<K> {
    /// Create an empty unit of work.
    #[must_use]
    pub fn new() -> Self {
        Self {
            authorizations: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Authorizations
    // -------------------------------------------------------------------------

    /// Track an authorization, replacing any previous state for its id.
    pub fn track_authorization(&mut self, record: AuthorizationRecord<K>) {
        if !record.id.is_zero() {
            self.authorizations.insert(record.id.clone(), record);
        }
    }

    /// Tracked authorization by id, if present.
    #[must_use]
    pub fn authorization(&self, id: &K) -> Option<&AuthorizationRecord<K>> {
        self.authorizations.get(id)
    }

    /// Stop tracking an authorization (after a delete).
    pub fn evict_authorization(&mut self, id: &K) {
        self.authorizations.remove(id);
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    /// Track a token, replacing any previous state for its id.
    pub fn track_token(&mut self, record: TokenRecord<K>) {
        if !record.id.is_zero() {
            self.tokens.insert(record.id.clone(), record);
        }
    }

    /// Tracked token by id, if present.
    #[must_use]
    pub fn token(&self, id: &K) -> Option<&TokenRecord<K>> {
        self.tokens.get(id)
    }

    /// Tracked token by reference identifier, if present.
    #[must_use]
    pub fn token_by_reference(&self, reference_id: &str) -> Option<&TokenRecord<K>> {
        self.tokens
            .values()
            .find(|t| t.reference_id.as_deref() == Some(reference_id))
    }

    /// Stop tracking a token (after a delete).
    pub fn evict_token(&mut self, id: &K) {
        self.tokens.remove(id);
    }

    /// Stop tracking every token linked to the given authorization (after
    /// a cascade delete).
    pub fn evict_tokens_of_authorization(&mut self, authorization_id: &K) {
        self.tokens
            .retain(|_, t| t.authorization_id.as_ref() != Some(authorization_id));
    }

    /// Number of tracked records across both entity kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.authorizations.len() + self.tokens.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorizations.is_empty() && self.tokens.is_empty()
    }
}

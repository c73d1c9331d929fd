//! Authorization record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::keys::EntityKey;
use crate::types::{kinds, statuses};

/// A standing grant recording that a subject approved a client for a set
/// of scopes.
///
/// Scopes and properties are persisted as compact JSON text and parsed on
/// demand through the store's parse cache. The concurrency token is opaque
/// and regenerated on every successful write; a write carrying a stale
/// token fails without effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRecord<K: EntityKey> {
    /// Backend-assigned identifier, immutable once assigned.
    pub id: K,

    /// Subject (end user) the grant belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Lifecycle status; see [`statuses`](crate::types::statuses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Authorization kind; see [`kinds`](crate::types::kinds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Granted scopes as a compact JSON array of strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,

    /// Additional properties as a compact JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,

    /// UTC creation instant.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub creation_date: Option<OffsetDateTime>,

    /// Opaque optimistic-concurrency token.
    pub concurrency_token: String,

    /// Key of the client application the grant was issued to, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<K>,
}

impl<K: EntityKey> Default for AuthorizationRecord<K> {
    fn default() -> Self {
        Self {
            id: K::zero(),
            subject: None,
            status: None,
            kind: None,
            scopes: None,
            properties: None,
            creation_date: None,
            concurrency_token: String::new(),
            application_id: None,
        }
    }
}

impl<K: EntityKey> AuthorizationRecord<K> {
    /// Create a blank record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the status equals the given value.
    #[must_use]
    pub fn has_status(&self, status: &str) -> bool {
        self.status.as_deref() == Some(status)
    }

    /// Returns `true` if the record is in the `valid` status.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.has_status(statuses::VALID)
    }

    /// Returns `true` if this is an ad-hoc grant.
    #[must_use]
    pub fn is_ad_hoc(&self) -> bool {
        self.kind.as_deref() == Some(kinds::AD_HOC)
    }
}

//! Token record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::keys::EntityKey;
use crate::types::statuses;

/// An issued credential, optionally linked to an authorization and to a
/// client application.
///
/// The payload is opaque to the store (typically an encrypted blob). The
/// reference identifier is an optional external handle for reference-token
/// formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord<K: EntityKey> {
    /// Backend-assigned identifier, immutable once assigned.
    pub id: K,

    /// Subject (end user) the token was issued for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Lifecycle status; see [`statuses`](crate::types::statuses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Token kind (access token, refresh token, ...). Open domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Optional external handle for reference tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,

    /// Opaque payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

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

    /// UTC expiration instant, when bounded.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expiration_date: Option<OffsetDateTime>,

    /// UTC redemption instant, when redeemed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub redemption_date: Option<OffsetDateTime>,

    /// Opaque optimistic-concurrency token.
    pub concurrency_token: String,

    /// Key of the client application, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<K>,

    /// Key of the authorization this token was issued under, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<K>,
}

impl<K: EntityKey> Default for TokenRecord<K> {
    fn default() -> Self {
        Self {
            id: K::zero(),
            subject: None,
            status: None,
            kind: None,
            reference_id: None,
            payload: None,
            properties: None,
            creation_date: None,
            expiration_date: None,
            redemption_date: None,
            concurrency_token: String::new(),
            application_id: None,
            authorization_id: None,
        }
    }
}

impl<K: EntityKey> TokenRecord<K> {
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

    /// Returns `true` if the expiration instant has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expiration_date
            .map(|exp| OffsetDateTime::now_utc() > exp)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_blank_record() {
        let record = TokenRecord::<Uuid>::new();
        assert!(record.id.is_nil());
        assert!(record.authorization_id.is_none());
        assert!(!record.is_expired());
    }

    #[test]
    fn test_is_expired() {
        let now = OffsetDateTime::now_utc();

        let mut record = TokenRecord::<Uuid>::new();
        record.expiration_date = Some(now + Duration::hours(1));
        assert!(!record.is_expired());

        record.expiration_date = Some(now - Duration::minutes(1));
        assert!(record.is_expired());
    }

    #[test]
    fn test_serialization_round_trip() {
        let record = TokenRecord::<Uuid> {
            id: Uuid::new_v4(),
            subject: Some("alice".to_string()),
            status: Some(statuses::VALID.to_string()),
            kind: Some("refresh_token".to_string()),
            reference_id: Some("ref-1".to_string()),
            payload: Some("opaque".to_string()),
            creation_date: Some(OffsetDateTime::now_utc()),
            expiration_date: Some(OffsetDateTime::now_utc() + Duration::days(30)),
            concurrency_token: "t1".to_string(),
            authorization_id: Some(Uuid::new_v4()),
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: TokenRecord<Uuid> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.reference_id, record.reference_id);
        assert_eq!(back.authorization_id, record.authorization_id);
    }
}

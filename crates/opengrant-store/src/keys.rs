//! Identifier codec.
//!
//! Stores expose opaque string identifiers to their callers while backends
//! index rows by a native key type (UUID, integer, string). This module
//! defines the conversion contract between the two representations.
//!
//! The codec is bidirectional and lossless for canonical identifiers:
//! `key_to_text(key_from_text(s)?) == Some(s)` for every canonical non-zero
//! `s`. Empty or absent text maps to the zero key, and the zero key renders
//! back as absent.

use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A backend-native key type.
///
/// Every key type designates one *zero* value standing in for "no key":
/// the nil UUID, integer zero, or the empty string. The zero key is never
/// assigned to a persisted row.
pub trait EntityKey:
    Clone + Eq + std::hash::Hash + Ord + std::fmt::Debug + Send + Sync + 'static
{
    /// The zero key.
    fn zero() -> Self;

    /// Returns `true` if this is the zero key.
    fn is_zero(&self) -> bool;

    /// Parse the canonical string form. Returns `None` on malformed input.
    fn parse(text: &str) -> Option<Self>;

    /// Render the canonical string form.
    fn render(&self) -> String;
}

impl EntityKey for Uuid {
    fn zero() -> Self {
        Uuid::nil()
    }

    fn is_zero(&self) -> bool {
        self.is_nil()
    }

    fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok()
    }

    fn render(&self) -> String {
        // Hyphenated lowercase is the canonical form.
        self.to_string()
    }
}

impl EntityKey for i64 {
    fn zero() -> Self {
        0
    }

    fn is_zero(&self) -> bool {
        *self == 0
    }

    fn parse(text: &str) -> Option<Self> {
        text.parse().ok()
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

impl EntityKey for String {
    fn zero() -> Self {
        String::new()
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn parse(text: &str) -> Option<Self> {
        Some(text.to_owned())
    }

    fn render(&self) -> String {
        self.clone()
    }
}

/// Convert an external string identifier to a backend key.
///
/// Empty or absent text maps to the zero key. Malformed text is an
/// `Argument` error.
///
/// # Errors
///
/// Returns [`StoreError::Argument`] if the text is not a canonical
/// rendering of the key type.
pub fn key_from_text<K: EntityKey>(text: Option<&str>) -> StoreResult<K> {
    match text {
        None | Some("") => Ok(K::zero()),
        Some(text) => K::parse(text)
            .ok_or_else(|| StoreError::argument(format!("malformed identifier: {text:?}"))),
    }
}

/// Render a backend key as an external string identifier.
///
/// The zero key maps to `None`.
#[must_use]
pub fn key_to_text<K: EntityKey>(key: &K) -> Option<String> {
    if key.is_zero() {
        None
    } else {
        Some(key.render())
    }
}

/// Render an optional backend key, treating both `None` and the zero key
/// as absent.
#[must_use]
pub fn optional_key_to_text<K: EntityKey>(key: Option<&K>) -> Option<String> {
    key.and_then(key_to_text)
}

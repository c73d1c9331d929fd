//! Authorization and token stores.
//!
//! The stores implement the full lifecycle operation set on top of a
//! [`StorageBackend`](crate::backend::StorageBackend): creation, point and
//! predicate lookup, soft revocation, hard deletion with cascade, and
//! scheduled pruning. Key conversion goes through the identifier codec,
//! scope/property parsing through the parse cache, and predicate mutations
//! through the bulk operation strategy.

mod authorization;
mod token;

pub use authorization::AuthorizationStore;
pub use token::TokenStore;

use uuid::Uuid;

/// Generate a fresh opaque concurrency token.
pub(crate) fn fresh_concurrency_token() -> String {
    Uuid::new_v4().to_string()
}

/// Page size used by the lazy `list` streams.
pub(crate) const LIST_PAGE: usize = 256;

//! Domain records persisted by the stores.
//!
//! Records are concrete structs parameterized by the backend's native key
//! type. Relations are held as plain key fields rather than navigation
//! objects; the external Application entity is referenced by identifier
//! only.

mod authorization;
mod token;

pub use authorization::AuthorizationRecord;
pub use token::TokenRecord;

use crate::error::StoreResult;

/// Lifecycle status values.
///
/// The status domain is open: these are the values the stores read and
/// write, but callers may persist others.
pub mod statuses {
    /// The record is live.
    pub const VALID: &str = "valid";
    /// The record was revoked and can no longer be used.
    pub const REVOKED: &str = "revoked";
    /// The record was redeemed (tokens only, externally driven).
    pub const REDEEMED: &str = "redeemed";
    /// The record is not yet usable.
    pub const INACTIVE: &str = "inactive";
}

/// Authorization kind values. The domain is open, like [`statuses`].
pub mod kinds {
    /// A one-off grant tied to a single flow.
    pub const AD_HOC: &str = "ad-hoc";
    /// A standing grant reused across flows.
    pub const PERMANENT: &str = "permanent";
}

/// Factory producing blank records for [`instantiate`] operations.
///
/// A factory is registered per entity kind; a failing factory surfaces as a
/// distinguishable `Construction` error rather than a low-level panic.
///
/// [`instantiate`]: crate::store::AuthorizationStore::instantiate
pub trait RecordFactory<T>: Send + Sync {
    /// Produce a new blank record.
    ///
    /// # Errors
    ///
    /// Returns a `Construction` error when the record cannot be built.
    fn instantiate(&self) -> StoreResult<T>;
}

/// Factory that builds records via [`Default`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl<T: Default> RecordFactory<T> for DefaultFactory {
    fn instantiate(&self) -> StoreResult<T> {
        Ok(T::default())
    }
}

//! Error types for cart operations and their collaborators.
//!
//! Each collaborator reports its own narrow error ([`StoreError`],
//! [`LockError`], [`PriceError`]); the runtime folds them into the
//! caller-facing [`CartError`] taxonomy.

use thiserror::Error;

use crate::types::{CartId, CartStatus, OwnerId, ProductId, Version};

/// Result type alias for cart operations.
pub type Result<T> = std::result::Result<T, CartError>;

/// Failures of the relational aggregate store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// A stored row could not be mapped back into the domain.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),
}

/// Failures of the distributed lock store.
///
/// Logical outcomes (already held, nothing to release) are not errors; they
/// are the `bool` results of [`crate::lock::ReservationLock`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Transport failure talking to the lock store. Always transient.
    #[error("Lock store unavailable: {0}")]
    Transport(String),
}

/// Failures of the price oracle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// The catalogue has no such product.
    #[error("Product {0} not found")]
    NotFound(ProductId),

    /// Transport failure or upstream unavailability. Retryable.
    #[error("Price oracle unavailable: {0}")]
    Transient(String),

    /// The oracle answered with something that is not a price.
    #[error("Invalid price oracle response: {0}")]
    InvalidResponse(String),
}

impl PriceError {
    /// Returns `true` if the call may succeed when repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Caller-facing failure taxonomy for cart operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CartError {
    // ═══════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════

    /// Quantity must be positive.
    #[error("Quantity must be greater than zero, got {quantity}")]
    InvalidQuantity {
        /// Rejected quantity
        quantity: i64,
    },

    /// No cart with this id.
    #[error("Cart {0} not found")]
    CartNotFound(CartId),

    /// Finalizing a cart with no line items.
    #[error("Cart {0} is empty")]
    EmptyCart(CartId),

    /// The price oracle does not know the product.
    #[error("Product {0} not found")]
    ProductNotFound(ProductId),

    /// Wrong status for the requested transition.
    #[error("Cart {cart_id} is {status}, cannot {operation}")]
    StateConflict {
        /// Target cart
        cart_id: CartId,
        /// Status observed
        status: CartStatus,
        /// Rejected operation
        operation: &'static str,
    },

    // ═══════════════════════════════════════════════════════════
    // Authorization
    // ═══════════════════════════════════════════════════════════

    /// Caller does not own the cart.
    #[error("Owner {owner_id} has no access to cart {cart_id}")]
    Unauthorized {
        /// Target cart
        cart_id: CartId,
        /// Caller
        owner_id: OwnerId,
    },

    // ═══════════════════════════════════════════════════════════
    // Concurrency
    // ═══════════════════════════════════════════════════════════

    /// Another cart holds the product's reservation.
    #[error("Product {product_id} is reserved by another cart")]
    ReservationConflict {
        /// Contested product
        product_id: ProductId,
    },

    /// The compare-and-swap commit touched no row: another writer won the race.
    #[error("Cart {cart_id} was modified concurrently (expected version {expected})")]
    ConcurrencyConflict {
        /// Target cart
        cart_id: CartId,
        /// Version the losing writer observed
        expected: Version,
    },

    // ═══════════════════════════════════════════════════════════
    // Infrastructure
    // ═══════════════════════════════════════════════════════════

    /// A collaborator stayed unavailable after retries, or timed out.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        /// Collaborator name
        service: &'static str,
        /// Last failure
        reason: String,
    },

    /// Non-transient aggregate store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A guarantee of the store was broken (e.g. a CAS touched more than one row).
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl CartError {
    /// Returns `true` for client-side validation failures, including state conflicts.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cartkeeper_core::{CartError, CartId};
    /// assert!(CartError::EmptyCart(CartId::new()).is_validation());
    /// assert!(!CartError::InvariantViolation("x".into()).is_validation());
    /// ```
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidQuantity { .. }
                | Self::CartNotFound(_)
                | Self::EmptyCart(_)
                | Self::ProductNotFound(_)
                | Self::StateConflict { .. }
        )
    }

    /// Returns `true` if the failure is attributable to the caller's request
    /// rather than to infrastructure.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.is_validation()
            || matches!(
                self,
                Self::Unauthorized { .. }
                    | Self::ReservationConflict { .. }
                    | Self::ConcurrencyConflict { .. }
            )
    }

    /// Returns `true` if restarting the whole use case from a fresh read may succeed.
    ///
    /// Nothing inside the core retries these; the caller decides.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Unavailable { .. }
        )
    }
}

impl From<PriceError> for CartError {
    fn from(err: PriceError) -> Self {
        match err {
            PriceError::NotFound(product_id) => Self::ProductNotFound(product_id),
            PriceError::Transient(reason) | PriceError::InvalidResponse(reason) => {
                Self::Unavailable {
                    service: "price oracle",
                    reason,
                }
            }
        }
    }
}

impl From<LockError> for CartError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Transport(reason) => Self::Unavailable {
                service: "lock store",
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conflict_is_a_validation_failure() {
        let err = CartError::StateConflict {
            cart_id: CartId::new(),
            status: CartStatus::Expired,
            operation: "add item",
        };
        assert!(err.is_validation());
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_authorization_is_distinct_from_validation() {
        let err = CartError::Unauthorized {
            cart_id: CartId::new(),
            owner_id: OwnerId::new(),
        };
        assert!(!err.is_validation());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_price_not_found_maps_to_validation() {
        let err = CartError::from(PriceError::NotFound(ProductId::new(4)));
        assert_eq!(err, CartError::ProductNotFound(ProductId::new(4)));
        assert!(err.is_validation());
    }

    #[test]
    fn test_transient_failures_map_to_unavailable() {
        let err = CartError::from(LockError::Transport("connection reset".into()));
        assert!(matches!(err, CartError::Unavailable { service: "lock store", .. }));
        assert!(err.is_retryable());
        assert!(!err.is_client_error());
    }
}

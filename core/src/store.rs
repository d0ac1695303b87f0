//! Aggregate store trait: the single source of truth for cart and item state.
//!
//! # Implementations
//!
//! - `PostgresCartStore` (in `cartkeeper-postgres`): Production implementation
//! - `InMemoryCartStore` (in `cartkeeper-testing`): Fast, deterministic testing
//!
//! # Write Paths
//!
//! Carts are mutated through exactly two paths:
//!
//! - [`CartStore::commit`]: the compare-and-swap commit used by every request
//!   handler
//! - [`CartStore::expire_carts`]: the predicate-gated batch transition used by
//!   the sweeper, idempotent under overlapping runs

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::StoreError;
use crate::types::{Cart, CartId, CartItem, CartMutation, ExpiredCart, OwnerId};

/// Relational store for the cart aggregate.
///
/// Implementations must be `Send + Sync`; handlers call them concurrently
/// without any in-process sequencing.
pub trait CartStore: Send + Sync {
    /// Point read of a cart by id.
    ///
    /// # Errors
    ///
    /// Returns error on storage failures; a missing cart is `Ok(None)`.
    fn get_cart(
        &self,
        cart_id: CartId,
    ) -> impl Future<Output = Result<Option<Cart>, StoreError>> + Send;

    /// All line items of a cart, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns error on storage failures.
    fn get_items(
        &self,
        cart_id: CartId,
    ) -> impl Future<Output = Result<Vec<CartItem>, StoreError>> + Send;

    /// The owner's `Active` cart, if any. At most one exists.
    ///
    /// # Errors
    ///
    /// Returns error on storage failures.
    fn find_active_cart(
        &self,
        owner_id: OwnerId,
    ) -> impl Future<Output = Result<Option<Cart>, StoreError>> + Send;

    /// Persist a freshly created cart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the owner already has an `Active`
    /// cart (another creation won the race), other variants on storage failures.
    fn insert_cart(&self, cart: &Cart) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Compare-and-swap commit.
    ///
    /// Atomically: update the fields set in `mutation` and increment `version`
    /// where `id = mutation.cart_id and version = mutation.expected_version`;
    /// if that touched a row, apply `mutation.item` in the same transaction.
    /// If it touched no row, nothing is written.
    ///
    /// # Returns
    ///
    /// The number of cart rows the conditional update touched. `0` means another
    /// writer advanced the version since the read; anything above `1` is an
    /// invariant violation the caller must surface.
    ///
    /// # Errors
    ///
    /// Returns error on storage failures; the transaction is rolled back.
    fn commit(
        &self,
        mutation: &CartMutation,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Transition every `Active` cart whose `expires_at` is before `now` to
    /// `Expired`, incrementing its version, in one transaction.
    ///
    /// Re-running with the same `now` is a no-op: the predicate excludes carts
    /// that are no longer `Active`.
    ///
    /// # Returns
    ///
    /// The carts this call expired, each with the products it listed.
    ///
    /// # Errors
    ///
    /// Returns error on storage failures; no cart is transitioned.
    fn expire_carts(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ExpiredCart>, StoreError>> + Send;
}

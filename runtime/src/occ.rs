//! Optimistic concurrency controller.
//!
//! Every mutating cart operation reads the aggregate, computes the new field
//! values, and hands them here as a [`CartMutation`] carrying the version it
//! observed. The store applies it as one conditional update and reports the
//! number of rows touched:
//!
//! - `0`: another writer advanced the version since the read; surfaced as
//!   [`CartError::ConcurrencyConflict`] and **never retried here**, since a
//!   retry would repeat side effects (price lookups, reservations) against a
//!   state the caller has not seen
//! - `1`: success; the cart is now at `expected_version + 1`
//! - more: impossible for a unique id; surfaced as [`CartError::InvariantViolation`]

use cartkeeper_core::store::CartStore;
use cartkeeper_core::{CartError, CartMutation, Version};

use crate::metrics::names;

/// Apply `mutation` through the compare-and-swap path of `store`.
///
/// # Returns
///
/// The cart's new version.
///
/// # Errors
///
/// - [`CartError::ConcurrencyConflict`] if the conditional update touched no row
/// - [`CartError::InvariantViolation`] if it touched more than one
/// - [`CartError::Store`] on storage failures (the store rolled back)
pub async fn commit<S: CartStore>(store: &S, mutation: &CartMutation) -> Result<Version, CartError> {
    let rows = store.commit(mutation).await?;

    match rows {
        0 => {
            tracing::warn!(
                cart_id = %mutation.cart_id,
                expected_version = %mutation.expected_version,
                "Compare-and-swap commit lost the race"
            );
            metrics::counter!(names::COMMIT_CONFLICTS).increment(1);
            Err(CartError::ConcurrencyConflict {
                cart_id: mutation.cart_id,
                expected: mutation.expected_version,
            })
        }
        1 => {
            let version = mutation.expected_version.next();
            tracing::debug!(
                cart_id = %mutation.cart_id,
                version = %version,
                "Compare-and-swap commit applied"
            );
            metrics::counter!(names::COMMITS).increment(1);
            Ok(version)
        }
        rows => {
            tracing::error!(
                cart_id = %mutation.cart_id,
                rows,
                "Compare-and-swap commit touched more than one cart row"
            );
            Err(CartError::InvariantViolation(format!(
                "commit on cart {} touched {rows} rows",
                mutation.cart_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use cartkeeper_core::types::{Cart, ExpiredCart, OwnerId};
    use cartkeeper_core::{CartId, CartItem, StoreError};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex;

    /// Store stub answering every commit with a fixed row count.
    struct RowCountStore {
        rows: Result<u64, StoreError>,
        seen: Mutex<Vec<CartMutation>>,
    }

    impl RowCountStore {
        fn answering(rows: Result<u64, StoreError>) -> Self {
            Self {
                rows,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl CartStore for RowCountStore {
        async fn get_cart(&self, _cart_id: CartId) -> Result<Option<Cart>, StoreError> {
            Ok(None)
        }

        async fn get_items(&self, _cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
            Ok(Vec::new())
        }

        async fn find_active_cart(&self, _owner_id: OwnerId) -> Result<Option<Cart>, StoreError> {
            Ok(None)
        }

        async fn insert_cart(&self, _cart: &Cart) -> Result<(), StoreError> {
            Ok(())
        }

        async fn commit(&self, mutation: &CartMutation) -> Result<u64, StoreError> {
            self.seen.lock().unwrap().push(mutation.clone());
            self.rows.clone()
        }

        async fn expire_carts(&self, _now: DateTime<Utc>) -> Result<Vec<ExpiredCart>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn mutation() -> CartMutation {
        let cart = Cart::new(OwnerId::new(), Utc::now(), Duration::minutes(15));
        CartMutation::against(&cart)
    }

    #[tokio::test]
    async fn test_one_row_advances_version() {
        let store = RowCountStore::answering(Ok(1));
        let mutation = mutation();

        let version = commit(&store, &mutation).await.unwrap();

        assert_eq!(version, Version::new(2));
        assert_eq!(store.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_rows_is_a_conflict_and_is_not_retried() {
        let store = RowCountStore::answering(Ok(0));
        let mutation = mutation();

        let err = commit(&store, &mutation).await.unwrap_err();

        assert_eq!(
            err,
            CartError::ConcurrencyConflict {
                cart_id: mutation.cart_id,
                expected: Version::INITIAL,
            }
        );
        assert_eq!(store.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_many_rows_is_an_invariant_violation() {
        let store = RowCountStore::answering(Ok(2));
        let err = commit(&store, &mutation()).await.unwrap_err();
        assert!(matches!(err, CartError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = RowCountStore::answering(Err(StoreError::Database("connection reset".into())));
        let err = commit(&store, &mutation()).await.unwrap_err();
        assert_eq!(
            err,
            CartError::Store(StoreError::Database("connection reset".into()))
        );
    }
}

//! Cart state machine.
//!
//! `ACTIVE → FINALIZED` and `ACTIVE → EXPIRED` are the only transitions; both
//! targets are terminal. This module owns the request-driven operations
//! (`create`, `add_item`, `remove_item`, `finalize`, `read`); expiry belongs to
//! the [`crate::sweeper::Sweeper`].
//!
//! # Ordering
//!
//! Within one `add_item` call the sequence is strict:
//! price fetch → reservation → compare-and-swap commit. A later step never
//! runs if an earlier one failed. When the commit fails, the reservation is
//! released unless the cart, re-read after the failure, lists the product.
//!
//! # Example
//!
//! ```ignore
//! let service = CartService::new(environment, CartPolicy::default());
//!
//! let cart = service.create(owner_id).await?;
//! let cart = service.add_item(cart.cart_id, owner_id, ProductId::new(7), 2).await?;
//! let cart = service.finalize(cart.cart_id, owner_id).await?;
//! ```

use cartkeeper_core::environment::Clock;
use cartkeeper_core::lock::{ReservationLock, ReserveOutcome};
use cartkeeper_core::pricing::PriceOracle;
use cartkeeper_core::store::CartStore;
use cartkeeper_core::{
    Cart, CartError, CartId, CartMutation, CartStatus, CartView, Decimal, ItemChange,
    LockError, OwnerId, PriceError, ProductId, Result, StoreError,
};
use chrono::Duration;
use std::future::Future;

use crate::metrics::names;
use crate::occ;
use crate::retry::{RetryPolicy, retry_with_predicate, with_timeout};

/// Tunables of the cart state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CartPolicy {
    /// Lifetime of an untouched cart, and of each reservation it takes.
    pub cart_ttl: Duration,
    /// Retry policy around lock-store calls.
    pub lock_retry: RetryPolicy,
    /// Retry policy around price-oracle calls.
    pub price_retry: RetryPolicy,
}

impl Default for CartPolicy {
    fn default() -> Self {
        Self {
            cart_ttl: Duration::seconds(900),
            lock_retry: RetryPolicy::lock_store(),
            price_retry: RetryPolicy::price_oracle(),
        }
    }
}

/// Collaborators injected into the cart runtime.
#[derive(Debug, Clone)]
pub struct CartEnvironment<S, L, P, C> {
    /// Relational aggregate store
    pub store: S,
    /// Distributed reservation lock store
    pub locks: L,
    /// External price oracle
    pub prices: P,
    /// Time source
    pub clock: C,
}

/// Request-driven operations on the cart aggregate.
#[derive(Debug, Clone)]
pub struct CartService<S, L, P, C> {
    env: CartEnvironment<S, L, P, C>,
    policy: CartPolicy,
}

impl<S, L, P, C> CartService<S, L, P, C>
where
    S: CartStore,
    L: ReservationLock,
    P: PriceOracle,
    C: Clock,
{
    /// Create a service over `env`.
    #[must_use]
    pub const fn new(env: CartEnvironment<S, L, P, C>, policy: CartPolicy) -> Self {
        Self { env, policy }
    }

    /// Injected collaborators.
    #[must_use]
    pub const fn environment(&self) -> &CartEnvironment<S, L, P, C> {
        &self.env
    }

    /// Active tunables.
    #[must_use]
    pub const fn policy(&self) -> &CartPolicy {
        &self.policy
    }

    // ═══════════════════════════════════════════════════════════
    // Query
    // ═══════════════════════════════════════════════════════════

    /// Ownership-checked projection of a cart.
    ///
    /// # Errors
    ///
    /// - [`CartError::CartNotFound`] if no such cart exists
    /// - [`CartError::Unauthorized`] if `owner_id` does not own it
    /// - [`CartError::Store`] on storage failures
    pub async fn read(&self, cart_id: CartId, owner_id: OwnerId) -> Result<CartView> {
        let cart = self.load_owned(cart_id, owner_id).await?;
        let items = self.env.store.get_items(cart_id).await?;
        Ok(CartView::from_parts(&cart, &items))
    }

    // ═══════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════

    /// Return the owner's active cart, creating one if none exists.
    ///
    /// Idempotent: two calls with no intervening finalize or expiry return the
    /// same cart. Concurrent creations converge on the one the store accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Store`] on storage failures.
    pub async fn create(&self, owner_id: OwnerId) -> Result<CartView> {
        if let Some(existing) = self.env.store.find_active_cart(owner_id).await? {
            tracing::info!(
                owner_id = %owner_id,
                cart_id = %existing.id,
                "Owner already has an active cart"
            );
            let items = self.env.store.get_items(existing.id).await?;
            return Ok(CartView::from_parts(&existing, &items));
        }

        let cart = Cart::new(owner_id, self.env.clock.now(), self.policy.cart_ttl);

        match self.env.store.insert_cart(&cart).await {
            Ok(()) => {
                tracing::info!(
                    owner_id = %owner_id,
                    cart_id = %cart.id,
                    expires_at = %cart.expires_at,
                    "Created cart"
                );
                metrics::counter!(names::CARTS_CREATED).increment(1);
                Ok(CartView::from_parts(&cart, &[]))
            }
            Err(StoreError::Duplicate(reason)) => {
                // Another request created the owner's cart between our read and insert.
                let winner = self
                    .env
                    .store
                    .find_active_cart(owner_id)
                    .await?
                    .ok_or(CartError::Store(StoreError::Duplicate(reason)))?;
                tracing::info!(
                    owner_id = %owner_id,
                    cart_id = %winner.id,
                    "Concurrent creation won, returning its cart"
                );
                let items = self.env.store.get_items(winner.id).await?;
                Ok(CartView::from_parts(&winner, &items))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Add `quantity` of `product_id` to the cart, reserving the product.
    ///
    /// Fetches the price, reserves the product for this cart, upserts the line
    /// (incrementing its quantity and refreshing its price if present), extends
    /// the cart's deadline, and commits through compare-and-swap. After the
    /// commit the reservations of the cart's other lines are renewed so they
    /// track the extended deadline.
    ///
    /// # Errors
    ///
    /// - [`CartError::InvalidQuantity`] if `quantity <= 0`
    /// - [`CartError::CartNotFound`], [`CartError::Unauthorized`]
    /// - [`CartError::StateConflict`] if the cart is not active
    /// - [`CartError::ProductNotFound`] if the oracle does not know the product
    /// - [`CartError::ReservationConflict`] if another cart holds the product
    /// - [`CartError::ConcurrencyConflict`] if another writer won the commit;
    ///   the reservation has been released unless the cart lists the product
    /// - [`CartError::Unavailable`] if the oracle or lock store stayed unreachable
    pub async fn add_item(
        &self,
        cart_id: CartId,
        owner_id: OwnerId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<CartView> {
        let quantity = u32::try_from(quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or(CartError::InvalidQuantity { quantity })?;

        let cart = self.load_owned(cart_id, owner_id).await?;
        ensure_active(&cart, "add item")?;
        let listed = self
            .env
            .store
            .get_items(cart_id)
            .await?
            .iter()
            .any(|item| item.product_id == product_id);

        tracing::info!(product_id = %product_id, "Fetching product price");
        let price = self.fetch_price(product_id).await?;

        self.reserve(product_id, cart_id).await?;

        let expires_at = self.env.clock.now() + self.policy.cart_ttl;
        let mutation = CartMutation::against(&cart)
            .with_expires_at(expires_at)
            .with_item(ItemChange::Upsert {
                product_id,
                quantity,
                price,
            });

        let version = match occ::commit(&self.env.store, &mutation).await {
            Ok(version) => version,
            Err(err) => {
                self.release_unless_listed(product_id, cart_id, listed).await;
                return Err(err);
            }
        };

        tracing::info!(
            cart_id = %cart_id,
            product_id = %product_id,
            quantity,
            price = %price,
            version = %version,
            "Added item to cart"
        );

        let view = self.read(cart_id, owner_id).await?;
        self.renew_other_reservations(&view, product_id).await;
        Ok(view)
    }

    /// Remove the line for `product_id` and give up its reservation.
    ///
    /// Only ownership is checked; a line can be removed whatever the cart's
    /// status. The deadline is extended only while the cart is active. The
    /// reservation is released after the commit succeeds, best-effort: a failed
    /// release is logged and counted but does not fail the removal.
    ///
    /// # Errors
    ///
    /// - [`CartError::CartNotFound`], [`CartError::Unauthorized`]
    /// - [`CartError::ConcurrencyConflict`] if another writer won the commit
    /// - [`CartError::Store`] on storage failures
    pub async fn remove_item(
        &self,
        cart_id: CartId,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Result<CartView> {
        let cart = self.load_owned(cart_id, owner_id).await?;

        let mut mutation = CartMutation::against(&cart).with_item(ItemChange::Remove { product_id });
        if cart.status == CartStatus::Active {
            mutation = mutation.with_expires_at(self.env.clock.now() + self.policy.cart_ttl);
        }

        let version = occ::commit(&self.env.store, &mutation).await?;

        tracing::info!(
            cart_id = %cart_id,
            product_id = %product_id,
            version = %version,
            "Removed item from cart"
        );

        self.release_quietly(product_id, cart_id).await;

        self.read(cart_id, owner_id).await
    }

    /// Transition an active, non-empty cart to `FINALIZED`.
    ///
    /// Reservations stay held: finalization signals intent to purchase.
    ///
    /// # Errors
    ///
    /// - [`CartError::CartNotFound`], [`CartError::Unauthorized`]
    /// - [`CartError::StateConflict`] if the cart is not active
    /// - [`CartError::EmptyCart`] if the cart has no lines
    /// - [`CartError::ConcurrencyConflict`] if another writer won the commit
    pub async fn finalize(&self, cart_id: CartId, owner_id: OwnerId) -> Result<CartView> {
        let cart = self.load_owned(cart_id, owner_id).await?;
        ensure_active(&cart, "finalize")?;

        let items = self.env.store.get_items(cart_id).await?;
        if items.is_empty() {
            return Err(CartError::EmptyCart(cart_id));
        }

        let mutation = CartMutation::against(&cart).with_status(CartStatus::Finalized);
        let version = occ::commit(&self.env.store, &mutation).await?;

        tracing::info!(cart_id = %cart_id, version = %version, "Finalized cart");
        metrics::counter!(names::CARTS_FINALIZED).increment(1);

        let finalized = Cart {
            status: CartStatus::Finalized,
            version,
            ..cart
        };
        Ok(CartView::from_parts(&finalized, &items))
    }

    // ═══════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════

    async fn load_owned(&self, cart_id: CartId, owner_id: OwnerId) -> Result<Cart> {
        let cart = self
            .env
            .store
            .get_cart(cart_id)
            .await?
            .ok_or(CartError::CartNotFound(cart_id))?;

        if cart.owner_id != owner_id {
            tracing::warn!(
                cart_id = %cart_id,
                owner_id = %owner_id,
                "Rejected access to a cart owned by someone else"
            );
            return Err(CartError::Unauthorized { cart_id, owner_id });
        }

        Ok(cart)
    }

    async fn fetch_price(&self, product_id: ProductId) -> Result<Decimal> {
        let policy = &self.policy.price_retry;
        let price = retry_with_predicate(
            policy,
            || {
                with_timeout(
                    policy.attempt_timeout,
                    self.env.prices.fetch_price(product_id),
                    |limit| PriceError::Transient(format!("timed out after {}ms", limit.as_millis())),
                )
            },
            PriceError::is_transient,
        )
        .await?;
        Ok(price)
    }

    /// Take the product's reservation for `cart_id`, or renew it if the cart
    /// already holds it, in one lock-store step.
    async fn reserve(&self, product_id: ProductId, cart_id: CartId) -> Result<()> {
        let ttl = self.policy.cart_ttl;

        match self
            .with_lock_retry(|| self.env.locks.reserve(product_id, cart_id, ttl))
            .await?
        {
            ReserveOutcome::Acquired => {
                tracing::info!(product_id = %product_id, cart_id = %cart_id, "Reserved product");
                metrics::counter!(names::RESERVATIONS_ACQUIRED).increment(1);
                Ok(())
            }
            ReserveOutcome::Renewed => {
                tracing::debug!(
                    product_id = %product_id,
                    cart_id = %cart_id,
                    "Cart already holds the product, renewed its reservation"
                );
                Ok(())
            }
            ReserveOutcome::HeldByOther => {
                tracing::warn!(
                    product_id = %product_id,
                    cart_id = %cart_id,
                    "Product is reserved by another cart"
                );
                metrics::counter!(names::RESERVATION_CONFLICTS).increment(1);
                Err(CartError::ReservationConflict { product_id })
            }
        }
    }

    /// Give back the reservation after a failed `add_item` commit, unless the
    /// cart lists the product.
    ///
    /// The lock reply cannot tell whether this call took the reservation (a
    /// retried reserve whose first reply was lost reports a renewal), so the
    /// aggregate decides. A line committed by a rival writer keeps it; so does
    /// a line that was listed when the call read the cart, if the lines cannot
    /// be re-read.
    async fn release_unless_listed(&self, product_id: ProductId, cart_id: CartId, listed: bool) {
        let listed = match self.env.store.get_items(cart_id).await {
            Ok(items) => items.iter().any(|item| item.product_id == product_id),
            Err(err) => {
                tracing::warn!(
                    cart_id = %cart_id,
                    error = %err,
                    "Failed to re-read cart lines after a failed commit"
                );
                listed
            }
        };

        if listed {
            tracing::debug!(
                product_id = %product_id,
                cart_id = %cart_id,
                "Cart lists the product, keeping its reservation"
            );
            return;
        }
        self.release_quietly(product_id, cart_id).await;
    }

    /// Release the cart's reservation of `product_id`, logging instead of failing.
    async fn release_quietly(&self, product_id: ProductId, cart_id: CartId) {
        match self
            .with_lock_retry(|| self.env.locks.release(product_id, cart_id))
            .await
        {
            Ok(true) => {
                tracing::info!(product_id = %product_id, cart_id = %cart_id, "Released reservation");
            }
            Ok(false) => {
                tracing::debug!(
                    product_id = %product_id,
                    cart_id = %cart_id,
                    "No reservation of this cart to release"
                );
            }
            Err(err) => {
                tracing::warn!(
                    product_id = %product_id,
                    cart_id = %cart_id,
                    error = %err,
                    "Failed to release reservation, it will lapse with its TTL"
                );
                metrics::counter!(names::RELEASE_FAILURES).increment(1);
            }
        }
    }

    /// Push out the reservations of every line except `touched` to the new deadline.
    async fn renew_other_reservations(&self, view: &CartView, touched: ProductId) {
        let ttl = self.policy.cart_ttl;

        for line in view.items.iter().filter(|line| line.product_id != touched) {
            let product_id = line.product_id;
            match self
                .with_lock_retry(|| self.env.locks.renew(product_id, view.cart_id, ttl))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        product_id = %product_id,
                        cart_id = %view.cart_id,
                        "Cart lists a product whose reservation it no longer holds"
                    );
                    metrics::counter!(names::RESERVATIONS_LOST).increment(1);
                }
                Err(err) => {
                    tracing::warn!(
                        product_id = %product_id,
                        cart_id = %view.cart_id,
                        error = %err,
                        "Failed to renew reservation"
                    );
                }
            }
        }
    }

    async fn with_lock_retry<F, Fut, T>(&self, mut operation: F) -> std::result::Result<T, LockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, LockError>>,
    {
        let policy = &self.policy.lock_retry;
        retry_with_predicate(
            policy,
            || {
                with_timeout(policy.attempt_timeout, operation(), |limit| {
                    LockError::Transport(format!("timed out after {}ms", limit.as_millis()))
                })
            },
            |_: &LockError| true,
        )
        .await
    }
}

fn ensure_active(cart: &Cart, operation: &'static str) -> Result<()> {
    if cart.status == CartStatus::Active {
        Ok(())
    } else {
        Err(CartError::StateConflict {
            cart_id: cart.id,
            status: cart.status,
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use cartkeeper_core::{Utc, Version};

    #[test]
    fn test_default_policy_matches_cart_ttl() {
        let policy = CartPolicy::default();
        assert_eq!(policy.cart_ttl, Duration::minutes(15));
        assert_eq!(policy.lock_retry.max_attempts(), 3);
        assert_eq!(policy.price_retry.max_attempts(), 3);
    }

    #[test]
    fn test_ensure_active_rejects_terminal_states() {
        let mut cart = Cart::new(OwnerId::new(), Utc::now(), Duration::minutes(15));
        assert!(ensure_active(&cart, "add item").is_ok());

        cart.status = CartStatus::Expired;
        cart.version = Version::new(3);
        let err = ensure_active(&cart, "add item").unwrap_err();
        assert_eq!(
            err,
            CartError::StateConflict {
                cart_id: cart.id,
                status: CartStatus::Expired,
                operation: "add item",
            }
        );
    }
}

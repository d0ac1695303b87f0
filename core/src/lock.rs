//! Product reservation lock: TTL-bound mutual exclusion keyed by product.
//!
//! A reservation is a single key per product whose value is the holder cart.
//! The lock store auto-removes it when its TTL elapses.
//!
//! # Atomicity
//!
//! Every primitive is one indivisible operation on the lock store:
//!
//! - **acquire**: set-if-absent with the expiry attached in the same command
//! - **reserve**: acquire, or else reset the expiry if the holder matches
//! - **renew**: compare holder, reset expiry if equal
//! - **release**: compare holder, delete if equal
//!
//! No caller ever reads a reservation and then writes it in a separate step.
//!
//! # Implementations
//!
//! - `RedisReservationLock` (in `cartkeeper-redis`): `SET NX PX` and Lua scripts
//! - `InMemoryReservationLock` (in `cartkeeper-testing`): `HashMap` behind a mutex

use chrono::Duration;
use std::future::Future;

use crate::error::LockError;
use crate::types::{CartId, ProductId};

/// Key under which the reservation of `product_id` is stored.
///
/// # Examples
///
/// ```
/// # use cartkeeper_core::{lock::reservation_key, ProductId};
/// assert_eq!(reservation_key(ProductId::new(42)), "product:42:lock");
/// ```
#[must_use]
pub fn reservation_key(product_id: ProductId) -> String {
    format!("product:{product_id}:lock")
}

/// Outcome of [`ReservationLock::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The product was free and is now held by the caller.
    Acquired,
    /// The caller already held the product; its expiry was reset.
    Renewed,
    /// Another cart holds the product. Nothing was changed.
    HeldByOther,
}

impl ReserveOutcome {
    /// Whether the caller holds the reservation after the call.
    #[must_use]
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Acquired | Self::Renewed)
    }
}

/// Distributed reservation lock store.
pub trait ReservationLock: Send + Sync {
    /// Reserve `product_id` for `holder` if nobody holds it, expiring after `ttl`.
    ///
    /// Never blocks or queues. `Ok(false)` means a reservation already exists,
    /// including one held by `holder` itself; callers treat it as a conflict,
    /// not as a retryable condition.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] only on lock-store transport failures.
    fn acquire(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Reserve `product_id` for `holder`, or reset the expiry of `holder`'s
    /// existing reservation, in one indivisible step.
    ///
    /// A release landing between "is it free?" and "is it mine?" cannot be
    /// observed: the answer is [`ReserveOutcome::HeldByOther`] only while
    /// another cart actually holds the product.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] only on lock-store transport failures.
    fn reserve(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> impl Future<Output = Result<ReserveOutcome, LockError>> + Send;

    /// Reset the expiry of `holder`'s own reservation to `ttl`.
    ///
    /// Never creates a reservation. `Ok(false)` means `holder` does not hold
    /// it (expired, released, or held by another cart).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] only on lock-store transport failures.
    fn renew(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Delete the reservation of `product_id` only if `holder` holds it.
    ///
    /// `Ok(true)` means this call removed `holder`'s reservation; `Ok(false)`
    /// means there was nothing of `holder`'s to remove. Both are normal outcomes.
    /// A reservation held by another cart is never touched.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] only on lock-store transport failures.
    fn release(
        &self,
        product_id: ProductId,
        holder: CartId,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

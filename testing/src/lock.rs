//! In-memory reservation lock store.

use cartkeeper_core::environment::Clock;
use cartkeeper_core::lock::{ReservationLock, ReserveOutcome};
use cartkeeper_core::{CartId, LockError, ProductId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    holder: CartId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    reservations: HashMap<ProductId, Reservation>,
    acquire_calls: usize,
    reserve_calls: usize,
    renew_calls: usize,
    release_calls: usize,
    failing_acquires: usize,
    failing_reserves: usize,
    lost_reserve_replies: usize,
    failing_releases: usize,
}

impl Inner {
    /// Drop the reservation of `product_id` if its TTL has elapsed.
    fn evict_expired(&mut self, product_id: ProductId, now: DateTime<Utc>) {
        if self
            .reservations
            .get(&product_id)
            .is_some_and(|r| r.expires_at <= now)
        {
            self.reservations.remove(&product_id);
        }
    }
}

/// Mock reservation lock store for testing.
///
/// Reservations expire against the injected clock, so advancing a
/// [`crate::ManualClock`] past a TTL makes the product free again. Each
/// primitive runs under one mutex, matching the atomicity of the real store.
/// Clones share state.
#[derive(Clone)]
pub struct InMemoryReservationLock {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for InMemoryReservationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReservationLock")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl InMemoryReservationLock {
    /// Create an empty lock store whose TTLs run on `clock`.
    #[must_use]
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Current holder of `product_id`, if the reservation is live.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn holder(&self, product_id: ProductId) -> Option<CartId> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired(product_id, now);
        inner.reservations.get(&product_id).map(|r| r.holder)
    }

    /// Expiry of the live reservation of `product_id`.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn expires_at(&self, product_id: ProductId) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired(product_id, now);
        inner.reservations.get(&product_id).map(|r| r.expires_at)
    }

    /// Number of `acquire` calls received, failed ones included.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn acquire_calls(&self) -> usize {
        self.inner.lock().unwrap().acquire_calls
    }

    /// Number of `reserve` calls received, failed ones included.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn reserve_calls(&self) -> usize {
        self.inner.lock().unwrap().reserve_calls
    }

    /// Number of `renew` calls received.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn renew_calls(&self) -> usize {
        self.inner.lock().unwrap().renew_calls
    }

    /// Number of `release` calls received, failed ones included.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn release_calls(&self) -> usize {
        self.inner.lock().unwrap().release_calls
    }

    /// Make the next `n` acquires fail with a transport error.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn fail_next_acquires(&self, n: usize) {
        self.inner.lock().unwrap().failing_acquires = n;
    }

    /// Make the next `n` reserves fail with a transport error, changing nothing.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn fail_next_reserves(&self, n: usize) {
        self.inner.lock().unwrap().failing_reserves = n;
    }

    /// Make the next `n` reserves take effect but report a transport error,
    /// as when the reply is lost or arrives after the caller's timeout.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn lose_next_reserve_replies(&self, n: usize) {
        self.inner.lock().unwrap().lost_reserve_replies = n;
    }

    /// Make the next `n` releases fail with a transport error.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn fail_next_releases(&self, n: usize) {
        self.inner.lock().unwrap().failing_releases = n;
    }
}

impl ReservationLock for InMemoryReservationLock {
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn acquire(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.acquire_calls += 1;

        if inner.failing_acquires > 0 {
            inner.failing_acquires -= 1;
            return Err(LockError::Transport("injected acquire failure".to_string()));
        }

        inner.evict_expired(product_id, now);
        if inner.reservations.contains_key(&product_id) {
            return Ok(false);
        }

        inner.reservations.insert(
            product_id,
            Reservation {
                holder,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn reserve(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<ReserveOutcome, LockError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.reserve_calls += 1;

        if inner.failing_reserves > 0 {
            inner.failing_reserves -= 1;
            return Err(LockError::Transport("injected reserve failure".to_string()));
        }

        inner.evict_expired(product_id, now);
        let expires_at = now + ttl;
        let outcome = match inner.reservations.entry(product_id) {
            Entry::Vacant(slot) => {
                slot.insert(Reservation { holder, expires_at });
                ReserveOutcome::Acquired
            }
            Entry::Occupied(mut slot) if slot.get().holder == holder => {
                slot.get_mut().expires_at = expires_at;
                ReserveOutcome::Renewed
            }
            Entry::Occupied(_) => ReserveOutcome::HeldByOther,
        };

        if inner.lost_reserve_replies > 0 {
            inner.lost_reserve_replies -= 1;
            return Err(LockError::Transport("injected lost reply".to_string()));
        }
        Ok(outcome)
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn renew(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.renew_calls += 1;
        inner.evict_expired(product_id, now);

        match inner.reservations.get_mut(&product_id) {
            Some(reservation) if reservation.holder == holder => {
                reservation.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn release(&self, product_id: ProductId, holder: CartId) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.release_calls += 1;

        if inner.failing_releases > 0 {
            inner.failing_releases -= 1;
            return Err(LockError::Transport("injected release failure".to_string()));
        }

        inner.evict_expired(product_id, now);
        if inner
            .reservations
            .get(&product_id)
            .is_some_and(|r| r.holder == holder)
        {
            inner.reservations.remove(&product_id);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::test_clock;

    #[tokio::test]
    async fn test_acquire_is_set_if_absent() {
        let locks = InMemoryReservationLock::new(test_clock());
        let (a, b) = (CartId::new(), CartId::new());
        let product = ProductId::new(1);

        assert!(locks.acquire(product, a, Duration::minutes(15)).await.unwrap());
        assert!(!locks.acquire(product, b, Duration::minutes(15)).await.unwrap());
        // Same holder is refused too.
        assert!(!locks.acquire(product, a, Duration::minutes(15)).await.unwrap());
        assert_eq!(locks.holder(product), Some(a));
    }

    #[tokio::test]
    async fn test_reserve_acquires_renews_or_refuses() {
        let clock = test_clock();
        let locks = InMemoryReservationLock::new(clock.clone());
        let (a, b) = (CartId::new(), CartId::new());
        let product = ProductId::new(1);
        let ttl = Duration::minutes(15);

        assert_eq!(locks.reserve(product, a, ttl).await.unwrap(), ReserveOutcome::Acquired);
        clock.advance(Duration::minutes(5));
        assert_eq!(locks.reserve(product, a, ttl).await.unwrap(), ReserveOutcome::Renewed);
        assert_eq!(locks.expires_at(product), Some(clock.now() + ttl));
        assert_eq!(locks.reserve(product, b, ttl).await.unwrap(), ReserveOutcome::HeldByOther);
        assert_eq!(locks.holder(product), Some(a));

        // Freed between two calls: the next reserve takes it, never refuses.
        locks.release(product, a).await.unwrap();
        assert_eq!(locks.reserve(product, a, ttl).await.unwrap(), ReserveOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_lost_reserve_reply_still_takes_effect() {
        let locks = InMemoryReservationLock::new(test_clock());
        let cart = CartId::new();
        let product = ProductId::new(1);
        locks.lose_next_reserve_replies(1);

        assert!(locks.reserve(product, cart, Duration::minutes(15)).await.is_err());
        assert_eq!(locks.holder(product), Some(cart));
        assert_eq!(
            locks.reserve(product, cart, Duration::minutes(15)).await.unwrap(),
            ReserveOutcome::Renewed
        );
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let locks = InMemoryReservationLock::new(test_clock());
        let (a, b) = (CartId::new(), CartId::new());
        let product = ProductId::new(1);
        locks.acquire(product, a, Duration::minutes(15)).await.unwrap();

        assert!(!locks.release(product, b).await.unwrap());
        assert_eq!(locks.holder(product), Some(a));
        assert!(locks.release(product, a).await.unwrap());
        assert!(!locks.release(product, a).await.unwrap());
        assert_eq!(locks.holder(product), None);
    }

    #[tokio::test]
    async fn test_reservation_lapses_with_ttl() {
        let clock = test_clock();
        let locks = InMemoryReservationLock::new(clock.clone());
        let (a, b) = (CartId::new(), CartId::new());
        let product = ProductId::new(1);
        locks.acquire(product, a, Duration::minutes(15)).await.unwrap();

        clock.advance(Duration::minutes(15));

        assert!(!locks.renew(product, a, Duration::minutes(15)).await.unwrap());
        assert!(locks.acquire(product, b, Duration::minutes(15)).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_extends_own_reservation_only() {
        let clock = test_clock();
        let locks = InMemoryReservationLock::new(clock.clone());
        let (a, b) = (CartId::new(), CartId::new());
        let product = ProductId::new(1);
        locks.acquire(product, a, Duration::minutes(15)).await.unwrap();

        clock.advance(Duration::minutes(10));
        assert!(locks.renew(product, a, Duration::minutes(15)).await.unwrap());
        assert!(!locks.renew(product, b, Duration::minutes(15)).await.unwrap());
        assert_eq!(
            locks.expires_at(product),
            Some(clock.now() + Duration::minutes(15))
        );
    }
}

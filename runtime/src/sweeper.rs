//! Expiration sweeper: reclaims abandoned carts and their reservations.
//!
//! Each run expires every active cart past its deadline in one store
//! transaction, then releases the reservations those carts listed. The
//! releases are a best-effort side channel with no transactional coupling to
//! the status commit: a failure is logged and counted, the remaining items and
//! carts are still processed, and any reservation left behind (including after
//! a crash between commit and release) lapses with its own TTL.
//!
//! Overlapping runs are safe. The expiry predicate only matches `ACTIVE` carts,
//! so a cart expired by one run is invisible to the next, and a release of a
//! reservation the cart no longer holds is a no-op.

use cartkeeper_core::environment::Clock;
use cartkeeper_core::lock::ReservationLock;
use cartkeeper_core::store::CartStore;
use cartkeeper_core::{CartId, LockError, ProductId, StoreError};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::metrics::names;
use crate::retry::{RetryPolicy, retry_with_predicate, with_timeout};

/// Outcome of one sweeper run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Carts transitioned to `EXPIRED`
    pub expired_carts: usize,
    /// Reservations this run removed
    pub released: usize,
    /// Reservations already gone (TTL lapsed or never held)
    pub already_absent: usize,
    /// Releases that failed after retries
    pub failed_releases: usize,
}

/// Periodic reclaimer of expired carts.
#[derive(Debug, Clone)]
pub struct Sweeper<S, L, C> {
    store: S,
    locks: L,
    clock: C,
    lock_retry: RetryPolicy,
}

impl<S, L, C> Sweeper<S, L, C>
where
    S: CartStore,
    L: ReservationLock,
    C: Clock,
{
    /// Create a sweeper over the aggregate store and the lock store.
    #[must_use]
    pub const fn new(store: S, locks: L, clock: C, lock_retry: RetryPolicy) -> Self {
        Self {
            store,
            locks,
            clock,
            lock_retry,
        }
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Returns error only if the status transition itself failed, in which case
    /// nothing was expired and no reservation was touched.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        tracing::info!(now = %now, "Expire carts sweep started");

        let expired = self.store.expire_carts(now).await?;
        tracing::info!(count = expired.len(), "Expired carts");
        metrics::counter!(names::CARTS_EXPIRED).increment(expired.len() as u64);

        let mut report = SweepReport {
            expired_carts: expired.len(),
            ..SweepReport::default()
        };

        for cart in &expired {
            for product_id in &cart.product_ids {
                match self.release(*product_id, cart.cart_id).await {
                    Ok(true) => report.released += 1,
                    Ok(false) => report.already_absent += 1,
                    Err(err) => {
                        tracing::warn!(
                            cart_id = %cart.cart_id,
                            product_id = %product_id,
                            error = %err,
                            "Failed to release lock for product"
                        );
                        metrics::counter!(names::RELEASE_FAILURES).increment(1);
                        report.failed_releases += 1;
                    }
                }
            }
        }

        tracing::info!(
            expired_carts = report.expired_carts,
            released = report.released,
            already_absent = report.already_absent,
            failed_releases = report.failed_releases,
            "Expire carts sweep finished"
        );

        Ok(report)
    }

    /// Sweep every `period` until `shutdown` resolves.
    ///
    /// The first sweep runs immediately. Ticks missed while a sweep overran are
    /// skipped, not bunched. A failed sweep is logged and the loop continues.
    pub async fn run<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(period_ms = period.as_millis(), "Sweeper started");

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::error!(error = %err, "Expire carts sweep failed");
                        metrics::counter!(names::SWEEP_FAILURES).increment(1);
                    }
                }
            }
        }
    }

    async fn release(&self, product_id: ProductId, cart_id: CartId) -> Result<bool, LockError> {
        let policy = &self.lock_retry;
        retry_with_predicate(
            policy,
            || {
                with_timeout(
                    policy.attempt_timeout,
                    self.locks.release(product_id, cart_id),
                    |limit| LockError::Transport(format!("timed out after {}ms", limit.as_millis())),
                )
            },
            |_: &LockError| true,
        )
        .await
    }
}

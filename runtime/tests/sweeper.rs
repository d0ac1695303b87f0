//! Expiration sweeper tests.

#![allow(clippy::unwrap_used)]

use cartkeeper_core::environment::Clock;
use cartkeeper_core::lock::ReservationLock;
use cartkeeper_core::{CartError, CartStatus, Decimal, OwnerId, ProductId, Version};
use cartkeeper_runtime::{
    CartEnvironment, CartPolicy, CartService, RetryPolicy, SweepReport, Sweeper,
};
use cartkeeper_testing::{
    InMemoryCartStore, InMemoryReservationLock, ManualClock, MockPriceOracle, init_test_tracing,
    test_clock,
};
use chrono::Duration;

type Service = CartService<InMemoryCartStore, InMemoryReservationLock, MockPriceOracle, ManualClock>;

struct Harness {
    service: Service,
    sweeper: Sweeper<InMemoryCartStore, InMemoryReservationLock, ManualClock>,
    store: InMemoryCartStore,
    locks: InMemoryReservationLock,
    clock: ManualClock,
}

fn harness() -> Harness {
    init_test_tracing();

    let clock = test_clock();
    let store = InMemoryCartStore::new();
    let locks = InMemoryReservationLock::new(clock.clone());
    let prices = MockPriceOracle::new();
    for id in 1..=4 {
        prices.set_price(ProductId::new(id), Decimal::new(250, 2));
    }
    let fast = RetryPolicy::builder()
        .initial_delay(std::time::Duration::from_millis(1))
        .max_delay(std::time::Duration::from_millis(2))
        .build();

    let service = CartService::new(
        CartEnvironment {
            store: store.clone(),
            locks: locks.clone(),
            prices,
            clock: clock.clone(),
        },
        CartPolicy {
            cart_ttl: Duration::minutes(15),
            lock_retry: fast.clone(),
            price_retry: fast.clone(),
        },
    );
    let sweeper = Sweeper::new(store.clone(), locks.clone(), clock.clone(), fast);

    Harness {
        service,
        sweeper,
        store,
        locks,
        clock,
    }
}

#[tokio::test]
async fn test_sweep_expires_idle_cart_and_frees_products() {
    let h = harness();
    let owner = OwnerId::new();
    let cart = h.service.create(owner).await.unwrap();
    h.service
        .add_item(cart.cart_id, owner, ProductId::new(1), 1)
        .await
        .unwrap();
    h.service
        .add_item(cart.cart_id, owner, ProductId::new(2), 1)
        .await
        .unwrap();

    // Past the cart deadline but inside the reservation TTL.
    h.clock.advance(Duration::minutes(15) - Duration::seconds(1));
    h.store.put_cart(cartkeeper_core::Cart {
        expires_at: h.clock.now() - Duration::seconds(1),
        ..h.store.cart(cart.cart_id).unwrap()
    });

    let report = h.sweeper.sweep_once().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            expired_carts: 1,
            released: 2,
            already_absent: 0,
            failed_releases: 0,
        }
    );
    let stored = h.store.cart(cart.cart_id).unwrap();
    assert_eq!(stored.status, CartStatus::Expired);
    assert_eq!(stored.version, Version::new(4));

    // Another cart can take the products immediately.
    let other = h.service.create(OwnerId::new()).await.unwrap();
    assert!(
        h.locks
            .acquire(ProductId::new(1), other.cart_id, Duration::minutes(15))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_sweep_counts_reservations_that_already_lapsed() {
    let h = harness();
    let owner = OwnerId::new();
    let cart = h.service.create(owner).await.unwrap();
    h.service
        .add_item(cart.cart_id, owner, ProductId::new(1), 1)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(16));
    let report = h.sweeper.sweep_once().await.unwrap();

    assert_eq!(report.expired_carts, 1);
    assert_eq!(report.released, 0);
    assert_eq!(report.already_absent, 1);
}

#[tokio::test]
async fn test_sweep_leaves_live_and_finalized_carts_alone() {
    let h = harness();
    let (a, b) = (OwnerId::new(), OwnerId::new());
    let live = h.service.create(a).await.unwrap();
    let done = h.service.create(b).await.unwrap();
    h.service
        .add_item(done.cart_id, b, ProductId::new(3), 1)
        .await
        .unwrap();
    h.service.finalize(done.cart_id, b).await.unwrap();

    h.clock.advance(Duration::minutes(10));
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report, SweepReport::default());

    // Finalized carts never expire, even long after their deadline.
    h.clock.advance(Duration::hours(2));
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.expired_carts, 1);
    assert_eq!(h.store.cart(live.cart_id).unwrap().status, CartStatus::Expired);
    assert_eq!(h.store.cart(done.cart_id).unwrap().status, CartStatus::Finalized);
}

#[tokio::test]
async fn test_overlapping_sweeps_expire_once() {
    let h = harness();
    let cart = h.service.create(OwnerId::new()).await.unwrap();
    h.clock.advance(Duration::minutes(16));

    let (first, second) = tokio::join!(h.sweeper.sweep_once(), h.sweeper.sweep_once());
    let total = first.unwrap().expired_carts + second.unwrap().expired_carts;

    assert_eq!(total, 1);
    assert_eq!(h.store.cart(cart.cart_id).unwrap().version, Version::new(2));
}

#[tokio::test]
async fn test_release_failure_does_not_stop_the_sweep() {
    let h = harness();
    let owner = OwnerId::new();
    let cart = h.service.create(owner).await.unwrap();
    for id in 1..=3 {
        h.service
            .add_item(cart.cart_id, owner, ProductId::new(id), 1)
            .await
            .unwrap();
    }
    h.store.put_cart(cartkeeper_core::Cart {
        expires_at: h.clock.now() - Duration::seconds(1),
        ..h.store.cart(cart.cart_id).unwrap()
    });
    // Exhaust every attempt of the first release only.
    h.locks.fail_next_releases(3);

    let report = h.sweeper.sweep_once().await.unwrap();

    assert_eq!(report.expired_carts, 1);
    assert_eq!(report.failed_releases, 1);
    assert_eq!(report.released, 2);
    assert_eq!(
        h.store.cart(cart.cart_id).unwrap().status,
        CartStatus::Expired
    );
}

#[tokio::test]
async fn test_expired_cart_rejects_further_writes() {
    let h = harness();
    let owner = OwnerId::new();
    let cart = h.service.create(owner).await.unwrap();
    h.service
        .add_item(cart.cart_id, owner, ProductId::new(1), 1)
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(16));
    h.sweeper.sweep_once().await.unwrap();

    let err = h
        .service
        .add_item(cart.cart_id, owner, ProductId::new(2), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CartError::StateConflict {
            status: CartStatus::Expired,
            ..
        }
    ));

    let err = h.service.finalize(cart.cart_id, owner).await.unwrap_err();
    assert!(matches!(err, CartError::StateConflict { .. }));
}

#[tokio::test]
async fn test_run_sweeps_until_shutdown() {
    let h = harness();
    let cart = h.service.create(OwnerId::new()).await.unwrap();
    h.clock.advance(Duration::minutes(16));

    h.sweeper
        .run(
            std::time::Duration::from_millis(10),
            tokio::time::sleep(std::time::Duration::from_millis(50)),
        )
        .await;

    assert_eq!(h.store.cart(cart.cart_id).unwrap().status, CartStatus::Expired);
}

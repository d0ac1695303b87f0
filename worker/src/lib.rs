//! # Cartkeeper Worker
//!
//! Process wiring for the cart runtime: configuration, logging, and the
//! production collaborators (Postgres aggregate store, Redis reservation lock,
//! HTTP price oracle).
//!
//! The `cartkeeper-worker` binary uses this to run the expiration sweeper.
//! Request handlers embed the same [`Resources`] to build a
//! [`cartkeeper_runtime::CartService`].

pub mod config;

use anyhow::Context;
use cartkeeper_core::environment::SystemClock;
use cartkeeper_postgres::PostgresCartStore;
use cartkeeper_product_client::HttpPriceOracle;
use cartkeeper_redis::RedisReservationLock;
use cartkeeper_runtime::{CartEnvironment, CartPolicy, CartService, Sweeper};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::Config;

/// Cart service over the production collaborators.
pub type ProductionCartService =
    CartService<PostgresCartStore, RedisReservationLock, HttpPriceOracle, SystemClock>;

/// Sweeper over the production collaborators.
pub type ProductionSweeper = Sweeper<PostgresCartStore, RedisReservationLock, SystemClock>;

/// Initialise `tracing` with an `EnvFilter`, defaulting to `default_filter`
/// when `RUST_LOG` is unset.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connected production collaborators.
#[derive(Debug, Clone)]
pub struct Resources {
    /// Aggregate store
    pub store: PostgresCartStore,
    /// Reservation lock store
    pub locks: RedisReservationLock,
    /// Price oracle
    pub prices: HttpPriceOracle,
    /// Cart tunables derived from configuration
    pub policy: CartPolicy,
}

impl Resources {
    /// Connect to Postgres (running migrations) and Redis, and build the price oracle.
    ///
    /// # Errors
    ///
    /// Returns error if a connection cannot be established or migrations fail.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        tracing::info!(max_connections = config.postgres.max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.postgres.max_connections)
            .connect(&config.postgres.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = PostgresCartStore::from_pool(pool);
        store.migrate().await.context("Failed to run migrations")?;
        tracing::info!("Database migrations applied");

        tracing::info!("Connecting to Redis");
        let locks = RedisReservationLock::new(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?;

        let prices = HttpPriceOracle::new(&config.products.url, config.products.timeout)
            .context("Failed to build product service client")?;

        let policy = CartPolicy {
            cart_ttl: config.carts.ttl,
            ..CartPolicy::default()
        };

        Ok(Self {
            store,
            locks,
            prices,
            policy,
        })
    }

    /// Cart service sharing these collaborators.
    #[must_use]
    pub fn cart_service(&self) -> ProductionCartService {
        CartService::new(
            CartEnvironment {
                store: self.store.clone(),
                locks: self.locks.clone(),
                prices: self.prices.clone(),
                clock: SystemClock,
            },
            self.policy.clone(),
        )
    }

    /// Expiration sweeper sharing these collaborators.
    #[must_use]
    pub fn sweeper(&self) -> ProductionSweeper {
        Sweeper::new(
            self.store.clone(),
            self.locks.clone(),
            SystemClock,
            self.policy.lock_retry.clone(),
        )
    }
}

//! `PostgreSQL` aggregate store for cartkeeper.
//!
//! This crate implements the `CartStore` trait from `cartkeeper-core` on top of
//! a sqlx connection pool:
//!
//! - Compare-and-swap commits keyed by `(id, version)`, applied together with
//!   the line-item change in one transaction
//! - One active cart per owner, enforced by a partial unique index
//! - Batch expiry of idle carts for the sweeper
//!
//! # Example
//!
//! ```no_run
//! use cartkeeper_postgres::PostgresCartStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresCartStore::new("postgres://localhost/carts").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

use cartkeeper_core::store::CartStore;
use cartkeeper_core::types::{Cart, CartItem, CartMutation, CartStatus, ExpiredCart, ItemChange};
use cartkeeper_core::{CartId, OwnerId, ProductId, StoreError, Version};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

const CART_COLUMNS: &str = "id, owner_id, status, version, expires_at, created_at";

/// `PostgreSQL`-backed [`CartStore`].
#[derive(Debug, Clone)]
pub struct PostgresCartStore {
    pool: PgPool,
}

impl PostgresCartStore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection cannot be established.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to begin transaction: {e}")))
    }
}

fn cart_from_row(row: &PgRow) -> Result<Cart, StoreError> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    Ok(Cart {
        id: CartId::from_uuid(row.try_get("id").map_err(corrupt)?),
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(corrupt)?),
        status: CartStatus::parse(&status)?,
        version: Version::new(row.try_get("version").map_err(corrupt)?),
        expires_at: row.try_get("expires_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
    })
}

fn item_from_row(row: &PgRow) -> Result<CartItem, StoreError> {
    let quantity: i32 = row.try_get("quantity").map_err(corrupt)?;
    Ok(CartItem {
        cart_id: CartId::from_uuid(row.try_get("cart_id").map_err(corrupt)?),
        product_id: ProductId::new(row.try_get("product_id").map_err(corrupt)?),
        quantity: u32::try_from(quantity)
            .map_err(|_| StoreError::Corrupt(format!("negative quantity {quantity}")))?,
        price: row.try_get::<Decimal, _>("price").map_err(corrupt)?,
    })
}

fn corrupt(e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn database(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Database(format!("{context}: {e}"))
}

impl CartStore for PostgresCartStore {
    async fn get_cart(&self, cart_id: CartId) -> Result<Option<Cart>, StoreError> {
        sqlx::query(&format!("SELECT {CART_COLUMNS} FROM carts WHERE id = $1"))
            .bind(cart_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(database("Failed to get cart"))?
            .as_ref()
            .map(cart_from_row)
            .transpose()
    }

    async fn get_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
        sqlx::query(
            r"
            SELECT cart_id, product_id, quantity, price
            FROM cart_items
            WHERE cart_id = $1
            ORDER BY product_id
            ",
        )
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(database("Failed to get cart items"))?
        .iter()
        .map(item_from_row)
        .collect()
    }

    async fn find_active_cart(&self, owner_id: OwnerId) -> Result<Option<Cart>, StoreError> {
        sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM carts WHERE owner_id = $1 AND status = 'ACTIVE'"
        ))
        .bind(owner_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(database("Failed to find active cart"))?
        .as_ref()
        .map(cart_from_row)
        .transpose()
    }

    async fn insert_cart(&self, cart: &Cart) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO carts (id, owner_id, status, version, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(cart.id.as_uuid())
        .bind(cart.owner_id.as_uuid())
        .bind(cart.status.as_str())
        .bind(cart.version.value())
        .bind(cart.expires_at)
        .bind(cart.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return StoreError::Duplicate(format!(
                        "owner {} already has an active cart",
                        cart.owner_id
                    ));
                }
            }
            StoreError::Database(format!("Failed to create cart: {e}"))
        })?;

        Ok(())
    }

    async fn commit(&self, mutation: &CartMutation) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(
            r"
            UPDATE carts
            SET version = version + 1,
                status = COALESCE($3, status),
                expires_at = COALESCE($4, expires_at)
            WHERE id = $1 AND version = $2
            ",
        )
        .bind(mutation.cart_id.as_uuid())
        .bind(mutation.expected_version.value())
        .bind(mutation.status.map(|s| s.as_str()))
        .bind(mutation.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(database("Failed to update cart"))?
        .rows_affected();

        if rows != 1 {
            // Stale version (or a broken invariant): write nothing.
            tx.rollback()
                .await
                .map_err(database("Failed to roll back"))?;
            return Ok(rows);
        }

        match &mutation.item {
            Some(ItemChange::Upsert {
                product_id,
                quantity,
                price,
            }) => {
                let quantity = i32::try_from(*quantity).map_err(|_| {
                    StoreError::Database(format!("quantity {quantity} out of range"))
                })?;
                sqlx::query(
                    r"
                    INSERT INTO cart_items (cart_id, product_id, quantity, price)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (cart_id, product_id) DO UPDATE
                    SET quantity = cart_items.quantity + EXCLUDED.quantity,
                        price = EXCLUDED.price
                    ",
                )
                .bind(mutation.cart_id.as_uuid())
                .bind(product_id.value())
                .bind(quantity)
                .bind(price)
                .execute(&mut *tx)
                .await
                .map_err(database("Failed to upsert cart item"))?;
            }
            Some(ItemChange::Remove { product_id }) => {
                sqlx::query("DELETE FROM cart_items WHERE cart_id = $1 AND product_id = $2")
                    .bind(mutation.cart_id.as_uuid())
                    .bind(product_id.value())
                    .execute(&mut *tx)
                    .await
                    .map_err(database("Failed to delete cart item"))?;
            }
            None => {}
        }

        tx.commit().await.map_err(database("Failed to commit"))?;
        Ok(rows)
    }

    async fn expire_carts(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredCart>, StoreError> {
        let mut tx = self.begin().await?;

        let expired: Vec<Uuid> = sqlx::query_scalar(
            r"
            UPDATE carts
            SET status = 'EXPIRED', version = version + 1
            WHERE status = 'ACTIVE' AND expires_at < $1
            RETURNING id
            ",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(database("Failed to expire carts"))?;

        if expired.is_empty() {
            tx.commit().await.map_err(database("Failed to commit"))?;
            return Ok(Vec::new());
        }

        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT cart_id, product_id FROM cart_items WHERE cart_id = ANY($1) ORDER BY product_id",
        )
        .bind(&expired)
        .fetch_all(&mut *tx)
        .await
        .map_err(database("Failed to list expired cart items"))?;

        tx.commit().await.map_err(database("Failed to commit"))?;

        let mut products: HashMap<Uuid, Vec<ProductId>> = HashMap::new();
        for (cart_id, product_id) in rows {
            products
                .entry(cart_id)
                .or_default()
                .push(ProductId::new(product_id));
        }

        tracing::debug!(count = expired.len(), "Expired carts in database");

        Ok(expired
            .into_iter()
            .map(|id| ExpiredCart {
                cart_id: CartId::from_uuid(id),
                product_ids: products.remove(&id).unwrap_or_default(),
            })
            .collect())
    }
}

//! Redis-based product reservation lock.
//!
//! # Architecture
//!
//! Each reservation is one key:
//! - **Key**: `product:{product_id}:lock` → holder cart id
//! - **TTL**: set in the same command that creates the key
//!
//! # Atomicity
//!
//! - **acquire**: `SET key holder NX PX ttl`, a single command
//! - **reserve**: Lua script, `SET NX PX`, else `PEXPIRE` if the stored holder matches
//! - **renew**: Lua script, `PEXPIRE` only if the stored holder matches
//! - **release**: Lua script, `DEL` only if the stored holder matches
//!
//! The scripts run atomically on the server, so a reservation that lapsed and
//! was re-acquired by another cart between a caller's decision and its write is
//! never touched.
//!
//! # Example
//!
//! ```no_run
//! use cartkeeper_redis::RedisReservationLock;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let locks = RedisReservationLock::new("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use cartkeeper_core::lock::{ReservationLock, ReserveOutcome, reservation_key};
use cartkeeper_core::{CartId, LockError, ProductId};
use chrono::Duration;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

// 1 = acquired, 2 = renewed, 0 = held by another cart.
const RESERVE_SCRIPT: &str = r"
    if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
        return 1
    end
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        return 2
    end
    return 0
";

const RENEW_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    else
        return 0
    end
";

const RELEASE_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    else
        return 0
    end
";

/// `Redis`-backed [`ReservationLock`].
///
/// Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct RedisReservationLock {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    reserve_script: Script,
    renew_script: Script,
    release_script: Script,
}

impl std::fmt::Debug for RedisReservationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisReservationLock").finish_non_exhaustive()
    }
}

impl RedisReservationLock {
    /// Create a new `Redis` reservation lock.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns error if connection to `Redis` fails.
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = Client::open(redis_url)
            .map_err(|e| LockError::Transport(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Transport(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            reserve_script: Script::new(RESERVE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

/// TTL in whole milliseconds, at least one.
#[allow(clippy::cast_sign_loss)]
fn ttl_millis(ttl: Duration) -> u64 {
    ttl.num_milliseconds().max(1) as u64
}

impl ReservationLock for RedisReservationLock {
    async fn acquire(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let key = reservation_key(product_id);

        // Replies OK when set, nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Transport(format!("Failed to acquire reservation: {e}")))?;

        let acquired = reply.is_some();
        tracing::debug!(
            key = %key,
            holder = %holder,
            acquired,
            "Reservation acquire"
        );
        Ok(acquired)
    }

    async fn reserve(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<ReserveOutcome, LockError> {
        let mut conn = self.conn_manager.clone();
        let key = reservation_key(product_id);

        let reply: i64 = self
            .reserve_script
            .key(&key)
            .arg(holder.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Transport(format!("Failed to reserve product: {e}")))?;

        let outcome = match reply {
            1 => ReserveOutcome::Acquired,
            2 => ReserveOutcome::Renewed,
            _ => ReserveOutcome::HeldByOther,
        };
        tracing::debug!(key = %key, holder = %holder, outcome = ?outcome, "Reservation reserve");
        Ok(outcome)
    }

    async fn renew(
        &self,
        product_id: ProductId,
        holder: CartId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let key = reservation_key(product_id);

        let renewed: i64 = self
            .renew_script
            .key(&key)
            .arg(holder.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Transport(format!("Failed to renew reservation: {e}")))?;

        Ok(renewed == 1)
    }

    async fn release(&self, product_id: ProductId, holder: CartId) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let key = reservation_key(product_id);

        let deleted: i64 = self
            .release_script
            .key(&key)
            .arg(holder.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Transport(format!("Failed to release reservation: {e}")))?;

        tracing::debug!(
            key = %key,
            holder = %holder,
            released = deleted == 1,
            "Reservation release"
        );
        Ok(deleted == 1)
    }
}

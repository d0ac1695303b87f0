//! In-memory aggregate store.

use cartkeeper_core::store::CartStore;
use cartkeeper_core::types::{Cart, CartItem, CartMutation, CartStatus, ExpiredCart, ItemChange};
use cartkeeper_core::{CartId, OwnerId, ProductId, StoreError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    carts: HashMap<CartId, Cart>,
    items: HashMap<CartId, BTreeMap<ProductId, CartItem>>,
    commits: usize,
    pending_conflicts: usize,
    pending_rivals: Vec<(CartId, ItemChange)>,
    pending_failures: usize,
}

/// Mock aggregate store for testing.
///
/// Every operation runs under one mutex, so a commit's conditional update and
/// its item change are observed together or not at all, matching a database
/// transaction. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCartStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `cart` as-is, bypassing the active-owner check.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn put_cart(&self, cart: Cart) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.entry(cart.id).or_default();
        inner.carts.insert(cart.id, cart);
    }

    /// Store `item` as-is, bypassing the version check.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn put_item(&self, item: CartItem) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .items
            .entry(item.cart_id)
            .or_default()
            .insert(item.product_id, item);
    }

    /// Current state of a cart, if stored.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn cart(&self, cart_id: CartId) -> Option<Cart> {
        self.inner.lock().unwrap().carts.get(&cart_id).cloned()
    }

    /// Number of carts stored.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn cart_count(&self) -> usize {
        self.inner.lock().unwrap().carts.len()
    }

    /// Number of commits that touched a row.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    /// Make the next `n` commits lose the race: a phantom writer advances the
    /// target cart's version first, so the conditional update touches no row.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn conflict_on_next_commits(&self, n: usize) {
        self.inner.lock().unwrap().pending_conflicts = n;
    }

    /// Make the next commit to `cart_id` lose the race to a rival writer
    /// that applies `change` first, as a concurrent `add_item` or
    /// `remove_item` on the same cart would.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn rival_commits_first(&self, cart_id: CartId, change: ItemChange) {
        self.inner.lock().unwrap().pending_rivals.push((cart_id, change));
    }

    /// Make the next `n` commits fail with a database error.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.lock().unwrap().pending_failures = n;
    }
}

impl CartStore for InMemoryCartStore {
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn get_cart(&self, cart_id: CartId) -> Result<Option<Cart>, StoreError> {
        Ok(self.inner.lock().unwrap().carts.get(&cart_id).cloned())
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn get_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .items
            .get(&cart_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn find_active_cart(&self, owner_id: OwnerId) -> Result<Option<Cart>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .carts
            .values()
            .find(|cart| cart.owner_id == owner_id && cart.status == CartStatus::Active)
            .cloned())
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn insert_cart(&self, cart: &Cart) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.carts.contains_key(&cart.id) {
            return Err(StoreError::Duplicate(format!("cart {} already exists", cart.id)));
        }
        if cart.status == CartStatus::Active
            && inner
                .carts
                .values()
                .any(|c| c.owner_id == cart.owner_id && c.status == CartStatus::Active)
        {
            return Err(StoreError::Duplicate(format!(
                "owner {} already has an active cart",
                cart.owner_id
            )));
        }

        inner.carts.insert(cart.id, cart.clone());
        inner.items.entry(cart.id).or_default();
        Ok(())
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn commit(&self, mutation: &CartMutation) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.pending_failures > 0 {
            inner.pending_failures -= 1;
            return Err(StoreError::Database("injected commit failure".to_string()));
        }

        if let Some(idx) = inner
            .pending_rivals
            .iter()
            .position(|(cart_id, _)| *cart_id == mutation.cart_id)
        {
            let (cart_id, change) = inner.pending_rivals.remove(idx);
            if let Some(cart) = inner.carts.get_mut(&cart_id) {
                cart.version = cart.version.next();
            }
            apply_item_change(inner.items.entry(cart_id).or_default(), cart_id, &change);
            return Ok(0);
        }

        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            if let Some(cart) = inner.carts.get_mut(&mutation.cart_id) {
                cart.version = cart.version.next();
            }
            return Ok(0);
        }

        let Some(cart) = inner.carts.get_mut(&mutation.cart_id) else {
            return Ok(0);
        };
        if cart.version != mutation.expected_version {
            return Ok(0);
        }

        cart.version = cart.version.next();
        if let Some(status) = mutation.status {
            cart.status = status;
        }
        if let Some(expires_at) = mutation.expires_at {
            cart.expires_at = expires_at;
        }

        if let Some(change) = &mutation.item {
            apply_item_change(
                inner.items.entry(mutation.cart_id).or_default(),
                mutation.cart_id,
                change,
            );
        }

        inner.commits += 1;
        Ok(1)
    }

    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn expire_carts(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredCart>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Inner { carts, items, .. } = &mut *inner;

        let mut expired = Vec::new();
        for cart in carts.values_mut() {
            if cart.status == CartStatus::Active && cart.expires_at < now {
                cart.status = CartStatus::Expired;
                cart.version = cart.version.next();
                expired.push(ExpiredCart {
                    cart_id: cart.id,
                    product_ids: items
                        .get(&cart.id)
                        .map(|lines| lines.keys().copied().collect())
                        .unwrap_or_default(),
                });
            }
        }

        Ok(expired)
    }
}

fn apply_item_change(
    items: &mut BTreeMap<ProductId, CartItem>,
    cart_id: CartId,
    change: &ItemChange,
) {
    match change {
        ItemChange::Upsert {
            product_id,
            quantity,
            price,
        } => {
            items
                .entry(*product_id)
                .and_modify(|item| {
                    item.quantity += quantity;
                    item.price = *price;
                })
                .or_insert_with(|| CartItem {
                    cart_id,
                    product_id: *product_id,
                    quantity: *quantity,
                    price: *price,
                });
        }
        ItemChange::Remove { product_id } => {
            items.remove(product_id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::test_clock;
    use cartkeeper_core::Version;
    use cartkeeper_core::environment::Clock;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn upsert(cart: &Cart, product: i64, quantity: u32) -> CartMutation {
        CartMutation::against(cart).with_item(ItemChange::Upsert {
            product_id: ProductId::new(product),
            quantity,
            price: Decimal::new(1000, 2),
        })
    }

    #[tokio::test]
    async fn test_commit_is_compare_and_swap() {
        let store = InMemoryCartStore::new();
        let cart = Cart::new(OwnerId::new(), test_clock().now(), Duration::minutes(15));
        store.insert_cart(&cart).await.unwrap();

        assert_eq!(store.commit(&upsert(&cart, 1, 2)).await.unwrap(), 1);
        // Same expected version again: stale.
        assert_eq!(store.commit(&upsert(&cart, 1, 2)).await.unwrap(), 0);

        let stored = store.cart(cart.id).unwrap();
        assert_eq!(stored.version, Version::new(2));
        let items = store.get_items(cart.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_second_active_cart_for_owner_is_duplicate() {
        let store = InMemoryCartStore::new();
        let owner = OwnerId::new();
        let now = test_clock().now();

        store
            .insert_cart(&Cart::new(owner, now, Duration::minutes(15)))
            .await
            .unwrap();
        let err = store
            .insert_cart(&Cart::new(owner, now, Duration::minutes(15)))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_expire_is_idempotent_and_bumps_version() {
        let store = InMemoryCartStore::new();
        let clock = test_clock();
        let cart = Cart::new(OwnerId::new(), clock.now(), Duration::minutes(15));
        store.insert_cart(&cart).await.unwrap();
        store.commit(&upsert(&cart, 9, 1)).await.unwrap();

        clock.advance(Duration::minutes(16));
        let first = store.expire_carts(clock.now()).await.unwrap();
        let second = store.expire_carts(clock.now()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].product_ids, vec![ProductId::new(9)]);
        assert!(second.is_empty());

        let stored = store.cart(cart.id).unwrap();
        assert_eq!(stored.status, CartStatus::Expired);
        assert_eq!(stored.version, Version::new(3));
    }

    #[tokio::test]
    async fn test_injected_conflict_advances_version() {
        let store = InMemoryCartStore::new();
        let cart = Cart::new(OwnerId::new(), test_clock().now(), Duration::minutes(15));
        store.insert_cart(&cart).await.unwrap();
        store.conflict_on_next_commits(1);

        assert_eq!(store.commit(&upsert(&cart, 1, 1)).await.unwrap(), 0);
        assert_eq!(store.cart(cart.id).unwrap().version, Version::new(2));
        assert!(store.get_items(cart.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rival_change_lands_before_the_commit() {
        let store = InMemoryCartStore::new();
        let cart = Cart::new(OwnerId::new(), test_clock().now(), Duration::minutes(15));
        store.insert_cart(&cart).await.unwrap();
        store.rival_commits_first(
            cart.id,
            ItemChange::Upsert {
                product_id: ProductId::new(4),
                quantity: 1,
                price: Decimal::new(250, 2),
            },
        );

        assert_eq!(store.commit(&upsert(&cart, 1, 1)).await.unwrap(), 0);

        let items = store.get_items(cart.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, ProductId::new(4));
        assert_eq!(store.cart(cart.id).unwrap().version, Version::new(2));
    }
}

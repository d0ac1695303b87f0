//! Domain types for the cart aggregate.
//!
//! The aggregate is a [`Cart`] plus its [`CartItem`]s, treated as one
//! consistency boundary guarded by [`Version`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a cart
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CartId(Uuid);

impl CartId {
    /// Creates a new random `CartId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `CartId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CartId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user owning a cart
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Creates a new random `OwnerId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OwnerId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalogue identifier of a product
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(i64);

impl ProductId {
    /// Create a `ProductId` from its catalogue number
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the catalogue number
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic-lock token of a cart.
///
/// Starts at 1 and advances by exactly one on every successful mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(i64);

impl Version {
    /// Version of a freshly created cart.
    pub const INITIAL: Self = Self(1);

    /// Create a version from its raw value
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// The version a successful commit against `self` produces.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// Lifecycle status of a cart.
///
/// `Active` is the only non-terminal state: `Active → Finalized` on checkout
/// intent, `Active → Expired` on abandonment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    /// Accepting item mutations
    Active,
    /// Checked out; terminal
    Finalized,
    /// Abandoned and reclaimed by the sweeper; terminal
    Expired,
}

impl CartStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Finalized => "FINALIZED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "FINALIZED" => Ok(Self::Finalized),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(StoreError::Corrupt(format!("Invalid cart status: {s}"))),
        }
    }

    /// Returns `true` if no transition leaves this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cart aggregate root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Immutable identifier
    pub id: CartId,
    /// Immutable owner
    pub owner_id: OwnerId,
    /// Lifecycle status
    pub status: CartStatus,
    /// Optimistic-lock token
    pub version: Version,
    /// Abandonment deadline, extended on every item mutation while active
    pub expires_at: DateTime<Utc>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Cart {
    /// Create a fresh active cart at version 1 expiring `ttl` after `now`.
    #[must_use]
    pub fn new(owner_id: OwnerId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: CartId::new(),
            owner_id,
            status: CartStatus::Active,
            version: Version::INITIAL,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    /// Returns `true` if the cart is active and its deadline has passed.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CartStatus::Active && self.expires_at < now
    }
}

/// A line item of a cart. At most one exists per `(cart_id, product_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Owning cart
    pub cart_id: CartId,
    /// Product on this line
    pub product_id: ProductId,
    /// Positive quantity
    pub quantity: u32,
    /// Unit price snapshotted from the price oracle at the last addition
    pub price: Decimal,
}

impl CartItem {
    /// `price × quantity`, exact.
    #[must_use]
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// Line-item change applied together with a compare-and-swap commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemChange {
    /// Insert the line, or add `quantity` to the existing one and refresh its price.
    Upsert {
        /// Product to add
        product_id: ProductId,
        /// Quantity to add (positive)
        quantity: u32,
        /// Fresh unit price
        price: Decimal,
    },
    /// Delete the line if present.
    Remove {
        /// Product to remove
        product_id: ProductId,
    },
}

impl ItemChange {
    /// Product touched by this change.
    #[must_use]
    pub const fn product_id(&self) -> ProductId {
        match self {
            Self::Upsert { product_id, .. } | Self::Remove { product_id } => *product_id,
        }
    }
}

/// A compare-and-swap commit against one cart.
///
/// Applied as "set these fields, `version = version + 1`, where
/// `id = cart_id and version = expected_version`", with the optional item
/// change in the same transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartMutation {
    /// Target cart
    pub cart_id: CartId,
    /// Version observed by the read this mutation was computed from
    pub expected_version: Version,
    /// New status, if the mutation is a transition
    pub status: Option<CartStatus>,
    /// New deadline, if the mutation extends it
    pub expires_at: Option<DateTime<Utc>>,
    /// Line-item change committed atomically with the version bump
    pub item: Option<ItemChange>,
}

impl CartMutation {
    /// A mutation that only advances the version of `cart`.
    #[must_use]
    pub const fn against(cart: &Cart) -> Self {
        Self {
            cart_id: cart.id,
            expected_version: cart.version,
            status: None,
            expires_at: None,
            item: None,
        }
    }

    /// Set the status transition.
    #[must_use]
    pub const fn with_status(mut self, status: CartStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the new deadline.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach a line-item change.
    #[must_use]
    pub fn with_item(mut self, item: ItemChange) -> Self {
        self.item = Some(item);
        self
    }
}

/// A cart transitioned to `Expired` by a sweep, with the products it listed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredCart {
    /// The expired cart
    pub cart_id: CartId,
    /// Products whose reservations the cart may still hold
    pub product_ids: Vec<ProductId>,
}

// ============================================================================
// Projection
// ============================================================================

/// Line item as exposed to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    /// Product on this line
    pub product_id: ProductId,
    /// Quantity
    pub quantity: u32,
    /// Snapshotted unit price
    pub price: Decimal,
}

/// Ownership-checked read projection of a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartView {
    /// Cart identifier
    pub cart_id: CartId,
    /// Owner
    pub owner_id: OwnerId,
    /// Lifecycle status
    pub status: CartStatus,
    /// Current version
    pub version: Version,
    /// Items ordered by product id
    pub items: Vec<ItemView>,
    /// `Σ price × quantity`, exact
    pub total: Decimal,
    /// Abandonment deadline
    pub expires_at: DateTime<Utc>,
}

impl CartView {
    /// Build the projection of `cart` with its `items`.
    #[must_use]
    pub fn from_parts(cart: &Cart, items: &[CartItem]) -> Self {
        let mut lines: Vec<ItemView> = items
            .iter()
            .map(|item| ItemView {
                product_id: item.product_id,
                quantity: item.quantity,
                price: item.price,
            })
            .collect();
        lines.sort_by_key(|line| line.product_id);

        let total = items
            .iter()
            .map(CartItem::line_total)
            .fold(Decimal::new(0, 2), |acc, line| acc + line);

        Self {
            cart_id: cart.id,
            owner_id: cart.owner_id,
            status: cart.status,
            version: cart.version,
            items: lines,
            total,
            expires_at: cart.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn item(cart_id: CartId, product: i64, quantity: u32, price: &str) -> CartItem {
        CartItem {
            cart_id,
            product_id: ProductId::new(product),
            quantity,
            price: Decimal::from_str(price).unwrap(),
        }
    }

    #[test]
    fn test_status_round_trips_through_database_string() {
        for status in [CartStatus::Active, CartStatus::Finalized, CartStatus::Expired] {
            assert_eq!(CartStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(matches!(CartStatus::parse("OPEN"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_only_active_is_non_terminal() {
        assert!(!CartStatus::Active.is_terminal());
        assert!(CartStatus::Finalized.is_terminal());
        assert!(CartStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&CartStatus::Finalized).unwrap();
        assert_eq!(json, "\"FINALIZED\"");
    }

    #[test]
    fn test_view_total_is_exact_decimal() {
        let now = Utc::now();
        let cart = Cart::new(OwnerId::new(), now, Duration::minutes(15));
        let items = vec![
            item(cart.id, 2, 3, "0.10"),
            item(cart.id, 1, 2, "10.00"),
            item(cart.id, 3, 1, "0.20"),
        ];

        let view = CartView::from_parts(&cart, &items);

        // 0.30 + 20.00 + 0.20, no binary floating point drift
        assert_eq!(view.total, Decimal::from_str("20.50").unwrap());
        assert_eq!(
            view.items.iter().map(|i| i.product_id.value()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_empty_view_totals_zero() {
        let cart = Cart::new(OwnerId::new(), Utc::now(), Duration::minutes(15));
        let view = CartView::from_parts(&cart, &[]);
        assert_eq!(view.total, Decimal::ZERO);
        assert_eq!(view.total.to_string(), "0.00");
    }

    #[test]
    fn test_expiry_predicate_ignores_terminal_carts() {
        let now = Utc::now();
        let mut cart = Cart::new(OwnerId::new(), now, Duration::minutes(15));
        let later = now + Duration::minutes(16);
        assert!(cart.is_expired_at(later));

        cart.status = CartStatus::Finalized;
        assert!(!cart.is_expired_at(later));
    }

    #[test]
    fn test_mutation_builder_targets_observed_version() {
        let cart = Cart::new(OwnerId::new(), Utc::now(), Duration::minutes(15));
        let mutation = CartMutation::against(&cart)
            .with_status(CartStatus::Finalized)
            .with_item(ItemChange::Remove { product_id: ProductId::new(7) });

        assert_eq!(mutation.expected_version, Version::INITIAL);
        assert_eq!(mutation.status, Some(CartStatus::Finalized));
        assert_eq!(mutation.item.map(|c| c.product_id()), Some(ProductId::new(7)));
        assert_eq!(Version::INITIAL.next(), Version::new(2));
    }

    proptest! {
        #[test]
        fn prop_total_equals_sum_of_cents(lines in proptest::collection::vec((1u32..50, 0i64..100_000), 0..20)) {
            let cart = Cart::new(OwnerId::new(), Utc::now(), Duration::minutes(15));
            let items: Vec<CartItem> = lines
                .iter()
                .enumerate()
                .map(|(i, (quantity, cents))| CartItem {
                    cart_id: cart.id,
                    product_id: ProductId::new(i64::try_from(i).unwrap()),
                    quantity: *quantity,
                    price: Decimal::new(*cents, 2),
                })
                .collect();

            let expected_cents: i64 = lines.iter().map(|(q, c)| i64::from(*q) * c).sum();
            let view = CartView::from_parts(&cart, &items);

            prop_assert_eq!(view.total, Decimal::new(expected_cents, 2));
        }
    }
}

//! # Cartkeeper Core
//!
//! Core types and collaborator traits for cart mutation under concurrent access.
//!
//! This crate holds no I/O. It defines:
//!
//! - **Types**: the cart aggregate (`Cart` + `CartItem`), its status machine and
//!   the read projection (`CartView`)
//! - **Errors**: the failure taxonomy surfaced to callers (`CartError`) and the
//!   per-collaborator errors it is built from
//! - **Collaborators**: traits for the aggregate store, the reservation lock store,
//!   the price oracle and the clock, injected into the runtime
//!
//! ## Concurrency Model
//!
//! Correctness comes from two primitives, both behind traits here:
//!
//! - A compare-and-swap commit keyed by `(cart id, expected version)` on the
//!   aggregate store ([`store::CartStore::commit`])
//! - Atomic set-if-absent-with-expiry, acquire-or-renew and compare-and-delete
//!   on the lock store ([`lock::ReservationLock`])
//!
//! ## Example
//!
//! ```
//! use cartkeeper_core::types::{Cart, CartStatus, OwnerId};
//! use chrono::{Duration, Utc};
//!
//! let now = Utc::now();
//! let cart = Cart::new(OwnerId::new(), now, Duration::minutes(15));
//!
//! assert_eq!(cart.status, CartStatus::Active);
//! assert_eq!(cart.version.value(), 1);
//! assert_eq!(cart.expires_at, now + Duration::minutes(15));
//! ```

pub mod environment;
pub mod error;
pub mod lock;
pub mod pricing;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;

pub use error::{CartError, LockError, PriceError, Result, StoreError};
pub use lock::ReserveOutcome;
pub use types::{
    Cart, CartId, CartItem, CartMutation, CartStatus, CartView, ExpiredCart, ItemChange, ItemView,
    OwnerId, ProductId, Version,
};

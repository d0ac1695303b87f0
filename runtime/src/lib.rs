//! # Cartkeeper Runtime
//!
//! Concurrency-control runtime for shopping carts.
//!
//! This crate composes the collaborator traits of `cartkeeper-core` into:
//!
//! - [`service::CartService`]: the cart state machine (`create`, `add_item`,
//!   `remove_item`, `finalize`, `read`)
//! - [`occ`]: the optimistic concurrency controller every mutation commits through
//! - [`sweeper::Sweeper`]: the periodic reclaimer of abandoned carts
//! - [`retry`]: bounded exponential backoff around cross-process calls
//! - [`metrics`]: counters and the Prometheus exporter
//!
//! ## Concurrency
//!
//! Handlers call the service concurrently with no in-process sequencing. All
//! correctness comes from the compare-and-swap commit on the aggregate store
//! and the atomic primitives of the lock store; nothing here holds a lock
//! across an `.await`.

pub mod metrics;
pub mod occ;
pub mod retry;
pub mod service;
pub mod sweeper;

pub use retry::RetryPolicy;
pub use service::{CartEnvironment, CartPolicy, CartService};
pub use sweeper::{SweepReport, Sweeper};

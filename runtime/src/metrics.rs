//! Prometheus metrics for the cart runtime.
//!
//! Counters are recorded through the `metrics` facade from the service, the
//! concurrency controller and the sweeper. Nothing is exported unless a
//! recorder is installed, e.g. with [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cartkeeper_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Metric names recorded by this crate.
pub mod names {
    /// Successful compare-and-swap commits.
    pub const COMMITS: &str = "cart_commits_total";
    /// Compare-and-swap commits that touched no row.
    pub const COMMIT_CONFLICTS: &str = "cart_commit_conflicts_total";
    /// Carts created.
    pub const CARTS_CREATED: &str = "cart_created_total";
    /// Carts finalized.
    pub const CARTS_FINALIZED: &str = "cart_finalized_total";
    /// Fresh reservations acquired.
    pub const RESERVATIONS_ACQUIRED: &str = "cart_reservations_acquired_total";
    /// Reservations refused because another cart holds the product.
    pub const RESERVATION_CONFLICTS: &str = "cart_reservation_conflicts_total";
    /// Reservations found lost while renewing them.
    pub const RESERVATIONS_LOST: &str = "cart_reservations_lost_total";
    /// Best-effort reservation releases that failed.
    pub const RELEASE_FAILURES: &str = "cart_reservation_release_failures_total";
    /// Carts expired by the sweeper.
    pub const CARTS_EXPIRED: &str = "cart_expired_total";
    /// Sweeper runs that failed before expiring anything.
    pub const SWEEP_FAILURES: &str = "cart_sweep_failures_total";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns `true` once [`Self::start`] installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Install the Prometheus recorder and start its HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be installed, e.g. because another
    /// recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        self.started = true;

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );

        Ok(())
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(names::COMMITS, "Successful compare-and-swap cart commits");
    describe_counter!(
        names::COMMIT_CONFLICTS,
        "Cart commits rejected because another writer advanced the version"
    );
    describe_counter!(names::CARTS_CREATED, "Carts created");
    describe_counter!(names::CARTS_FINALIZED, "Carts finalized");
    describe_counter!(
        names::RESERVATIONS_ACQUIRED,
        "Product reservations freshly acquired"
    );
    describe_counter!(
        names::RESERVATION_CONFLICTS,
        "Item additions refused because another cart holds the product"
    );
    describe_counter!(
        names::RESERVATIONS_LOST,
        "Reservations a cart no longer held when renewing them"
    );
    describe_counter!(
        names::RELEASE_FAILURES,
        "Best-effort reservation releases that failed"
    );
    describe_counter!(names::CARTS_EXPIRED, "Carts expired by the sweeper");
    describe_counter!(
        names::SWEEP_FAILURES,
        "Sweeper runs that failed to expire carts"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_is_idle_until_started() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert!(!server.is_started());
        assert_eq!(server.addr().port(), 9090);
    }

    #[test]
    fn test_metric_names_are_prometheus_counters() {
        for name in [
            names::COMMITS,
            names::COMMIT_CONFLICTS,
            names::CARTS_CREATED,
            names::CARTS_FINALIZED,
            names::RESERVATIONS_ACQUIRED,
            names::RESERVATION_CONFLICTS,
            names::RESERVATIONS_LOST,
            names::RELEASE_FAILURES,
            names::CARTS_EXPIRED,
            names::SWEEP_FAILURES,
        ] {
            assert!(name.starts_with("cart_"));
            assert!(name.ends_with("_total"));
        }
    }
}

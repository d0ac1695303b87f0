//! Canned price oracle.

use cartkeeper_core::pricing::PriceOracle;
use cartkeeper_core::{PriceError, ProductId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    prices: HashMap<ProductId, Decimal>,
    calls: usize,
    transient_failures: usize,
    invalid_responses: usize,
}

/// Mock price oracle for testing.
///
/// Products without a price answer [`PriceError::NotFound`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockPriceOracle {
    inner: Arc<Mutex<Inner>>,
}

impl MockPriceOracle {
    /// Create an oracle that knows no product.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Self::set_price`].
    #[must_use]
    pub fn with_price(self, product_id: ProductId, price: Decimal) -> Self {
        self.set_price(product_id, price);
        self
    }

    /// Set the price returned for `product_id`.
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn set_price(&self, product_id: ProductId, price: Decimal) {
        self.inner.lock().unwrap().prices.insert(product_id, price);
    }

    /// Make the next `n` lookups fail with [`PriceError::Transient`].
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn fail_transiently(&self, n: usize) {
        self.inner.lock().unwrap().transient_failures = n;
    }

    /// Make the next `n` lookups fail with [`PriceError::InvalidResponse`].
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn answer_garbage(&self, n: usize) {
        self.inner.lock().unwrap().invalid_responses = n;
    }

    /// Number of lookups received, failed ones included.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    pub fn calls(&self) -> usize {
        self.inner.lock().unwrap().calls
    }
}

impl PriceOracle for MockPriceOracle {
    #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
    async fn fetch_price(&self, product_id: ProductId) -> Result<Decimal, PriceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;

        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(PriceError::Transient("injected outage".to_string()));
        }
        if inner.invalid_responses > 0 {
            inner.invalid_responses -= 1;
            return Err(PriceError::InvalidResponse("injected garbage".to_string()));
        }

        inner
            .prices
            .get(&product_id)
            .copied()
            .ok_or(PriceError::NotFound(product_id))
    }
}

//! Price oracle trait: authoritative unit price for a product.

use rust_decimal::Decimal;
use std::future::Future;

use crate::error::PriceError;
use crate::types::ProductId;

/// External source of product prices.
///
/// Prices are snapshotted into line items at the moment of addition and never
/// re-validated afterwards.
pub trait PriceOracle: Send + Sync {
    /// Fetch the current unit price of `product_id`.
    ///
    /// # Errors
    ///
    /// - [`PriceError::Transient`]: transport failure, retryable
    /// - [`PriceError::NotFound`]: unknown product, not retryable
    /// - [`PriceError::InvalidResponse`]: malformed answer, not retryable
    fn fetch_price(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Decimal, PriceError>> + Send;
}

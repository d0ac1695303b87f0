//! HTTP price oracle.
//!
//! Fetches the authoritative price of a product from the product service:
//!
//! ```text
//! GET {base_url}/products/{product_id}
//! 200 {"id": 1, "name": "Keyboard", "price": 199.99}
//! 404 unknown product
//! ```
//!
//! Transport failures, timeouts and `5xx` answers are transient; the runtime
//! retries them. A `404` is a definitive [`PriceError::NotFound`]. Anything
//! else that is not a price is [`PriceError::InvalidResponse`].
//!
//! # Example
//!
//! ```no_run
//! use cartkeeper_core::pricing::PriceOracle;
//! use cartkeeper_core::ProductId;
//! use cartkeeper_product_client::HttpPriceOracle;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let oracle = HttpPriceOracle::new("http://localhost:8001", Duration::from_secs(2))?;
//! let price = oracle.fetch_price(ProductId::new(1)).await?;
//! # Ok(())
//! # }
//! ```

use cartkeeper_core::pricing::PriceOracle;
use cartkeeper_core::{PriceError, ProductId};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Product record as served by the product service.
#[derive(Debug, Deserialize)]
struct ProductResponse {
    id: i64,
    /// JSON number or string; parsed exactly, never through `f64`.
    price: serde_json::Value,
}

/// [`PriceOracle`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPriceOracle {
    client: Client,
    base_url: String,
}

impl HttpPriceOracle {
    /// Create a client for the product service at `base_url`.
    ///
    /// `timeout` bounds each request end to end.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Transient`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PriceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PriceError::Transient(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl PriceOracle for HttpPriceOracle {
    async fn fetch_price(&self, product_id: ProductId) -> Result<Decimal, PriceError> {
        let url = format!("{}/products/{product_id}", self.base_url);
        tracing::debug!(url = %url, "Fetching product");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceError::Transient(format!("GET {url} failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let product = response
                    .json::<ProductResponse>()
                    .await
                    .map_err(|e| PriceError::InvalidResponse(format!("Malformed product: {e}")))?;

                if product.id != product_id.value() {
                    return Err(PriceError::InvalidResponse(format!(
                        "asked for product {product_id}, got {}",
                        product.id
                    )));
                }
                parse_price(&product.price)
            }
            StatusCode::NOT_FOUND => Err(PriceError::NotFound(product_id)),
            status if status.is_server_error() => Err(PriceError::Transient(format!(
                "product service answered {status}"
            ))),
            status => Err(PriceError::InvalidResponse(format!(
                "product service answered {status}"
            ))),
        }
    }
}

/// Exact decimal price from a JSON number or string, rounded to cents.
fn parse_price(value: &serde_json::Value) -> Result<Decimal, PriceError> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => {
            return Err(PriceError::InvalidResponse(format!(
                "price is not a number: {other}"
            )));
        }
    };

    let price = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| PriceError::InvalidResponse(format!("price {text:?}: {e}")))?;

    if price.is_sign_negative() {
        return Err(PriceError::InvalidResponse(format!("negative price {price}")));
    }

    Ok(price.round_dp(2))
}

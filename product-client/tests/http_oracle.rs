//! `HttpPriceOracle` against an in-process product service.

#![allow(clippy::unwrap_used)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use cartkeeper_core::pricing::PriceOracle;
use cartkeeper_core::{PriceError, ProductId};
use cartkeeper_product_client::HttpPriceOracle;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone, Default)]
struct Catalogue {
    calls: Arc<AtomicUsize>,
}

async fn product(State(catalogue): State<Catalogue>, Path(id): Path<i64>) -> Response {
    catalogue.calls.fetch_add(1, Ordering::SeqCst);
    match id {
        1 => Json(json!({"id": 1, "name": "Keyboard", "price": 199.99})).into_response(),
        2 => Json(json!({"id": 2, "name": "Mouse", "price": "49.50"})).into_response(),
        3 => Json(json!({"id": 99, "name": "Wrong", "price": 1.0})).into_response(),
        4 => Json(json!({"id": 4, "name": "Broken"})).into_response(),
        5 => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        6 => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(json!({"id": 6, "price": 1.0})).into_response()
        }
        7 => StatusCode::BAD_REQUEST.into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({"detail": "Product not found"}))).into_response(),
    }
}

/// Serve the catalogue on an ephemeral port; returns its base URL.
async fn serve(catalogue: Catalogue) -> String {
    let app = Router::new()
        .route("/products/:id", get(product))
        .with_state(catalogue);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

async fn oracle() -> (HttpPriceOracle, Catalogue) {
    let catalogue = Catalogue::default();
    let base_url = serve(catalogue.clone()).await;
    let oracle = HttpPriceOracle::new(&base_url, Duration::from_millis(300)).unwrap();
    (oracle, catalogue)
}

#[tokio::test]
async fn test_fetches_exact_price() {
    let (oracle, _) = oracle().await;

    let price = oracle.fetch_price(ProductId::new(1)).await.unwrap();

    assert_eq!(price, Decimal::new(19999, 2));
}

#[tokio::test]
async fn test_accepts_string_price() {
    let (oracle, _) = oracle().await;

    let price = oracle.fetch_price(ProductId::new(2)).await.unwrap();

    assert_eq!(price, Decimal::new(4950, 2));
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let (oracle, _) = oracle().await;

    let err = oracle.fetch_price(ProductId::new(404)).await.unwrap_err();

    assert_eq!(err, PriceError::NotFound(ProductId::new(404)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let (oracle, catalogue) = oracle().await;

    let err = oracle.fetch_price(ProductId::new(5)).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(catalogue.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_answer_times_out_as_transient() {
    let (oracle, _) = oracle().await;

    let err = oracle.fetch_price(ProductId::new(6)).await.unwrap_err();

    assert!(err.is_transient(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_unreachable_service_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let oracle = HttpPriceOracle::new(&format!("http://{addr}"), Duration::from_millis(300)).unwrap();

    let err = oracle.fetch_price(ProductId::new(1)).await.unwrap_err();

    assert!(err.is_transient());
}

#[tokio::test]
async fn test_malformed_answers_are_invalid_responses() {
    let (oracle, _) = oracle().await;

    for id in [3, 4, 7] {
        let err = oracle.fetch_price(ProductId::new(id)).await.unwrap_err();
        assert!(
            matches!(err, PriceError::InvalidResponse(_)),
            "product {id}: unexpected error {err}"
        );
    }
}

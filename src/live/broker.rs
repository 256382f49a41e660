//! Brokerage client abstraction used only by the live adapter. The engine
//! core never touches a broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::util::retry::{with_retry, RetryPolicy, Transient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub stock: String,
    pub side: OrderSide,
    pub quantity: u64,
    /// None places a market order.
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub stock: String,
    pub side: OrderSide,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub stock: String,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    #[serde(with = "rust_decimal::serde::float")]
    pub cash: Decimal,
    pub positions: Vec<BrokerPosition>,
}

/// Broker failures, classified for the retry policy. Rate limits (HTTP
/// 429) get the longer backoff schedule.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient broker failure: {0}")]
    Transient(String),
    #[error("broker rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, BrokerError>;
    async fn balance(&self) -> Result<AccountBalance, BrokerError>;
    /// When the current access token expires.
    async fn token_expires_at(&self) -> Result<DateTime<Utc>, BrokerError>;
    async fn refresh_token(&self) -> Result<(), BrokerError>;
}

fn classify(err: BrokerError) -> Transient {
    match err {
        BrokerError::RateLimited(msg) => Transient::RateLimited(msg),
        BrokerError::Transient(msg) => Transient::Retryable(msg),
        BrokerError::Rejected(msg) => Transient::Fatal(msg),
    }
}

/// Place an order with the broker retry schedule (timeout per attempt,
/// exponential backoff, longer on 429).
pub async fn place_order_with_retry(
    broker: &dyn BrokerClient,
    policy: &RetryPolicy,
    order: &OrderRequest,
) -> Result<OrderFill, String> {
    with_retry(policy, "place_order", move || async move {
        broker.place_order(order).await.map_err(classify)
    })
    .await
}

/// Refresh the token when it expires within ten minutes.
pub async fn ensure_fresh_token(
    broker: &dyn BrokerClient,
    now: DateTime<Utc>,
) -> Result<(), BrokerError> {
    let expires_at = broker.token_expires_at().await?;
    if expires_at - now <= chrono::Duration::minutes(10) {
        tracing::info!(%expires_at, "broker token expiring soon; refreshing");
        broker.refresh_token().await?;
    }
    Ok(())
}

//! Token price lookups.

use crate::capability::{
    method_not_found, params, to_value, CapabilityClient, Dispatch, Spawner,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const CAPABILITY: &str = "PriceGetter";

/// USD price of one token, scaled to 1e18 per whole token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub token: String,
    #[serde(with = "super::decimal")]
    pub price: u128,
}

/// Settings a provider builds a price getter from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceGetterConfig {
    /// Chain whose tokens are priced.
    pub chain_selector: u64,
    /// Fixed prices, used instead of on-chain feeds.
    #[serde(default)]
    pub static_prices: Vec<TokenPrice>,
}

#[async_trait]
pub trait PriceGetter: Send + Sync {
    /// Prices for `tokens`, in request order. Unsupported tokens are omitted.
    async fn token_prices(&self, tokens: Vec<String>) -> Result<Vec<TokenPrice>>;

    async fn is_token_supported(&self, token: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct TokenPricesParams {
    tokens: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct TokenParams {
    token: String,
}

/// Dispatch table serving a [`PriceGetter`].
pub struct PriceGetterService {
    inner: Arc<dyn PriceGetter>,
}

impl PriceGetterService {
    pub fn new(inner: Arc<dyn PriceGetter>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Dispatch for PriceGetterService {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    async fn dispatch(&self, method: &str, args: Value, _spawner: &Spawner) -> Result<Value> {
        match method {
            "token_prices" => {
                let p: TokenPricesParams = params(method, args)?;
                to_value(&self.inner.token_prices(p.tokens).await?)
            }
            "is_token_supported" => {
                let p: TokenParams = params(method, args)?;
                to_value(&self.inner.is_token_supported(&p.token).await?)
            }
            _ => Err(method_not_found(CAPABILITY, method)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Remote [`PriceGetter`].
#[derive(Clone, Debug)]
pub struct PriceGetterClient {
    inner: CapabilityClient,
}

impl PriceGetterClient {
    pub fn new(inner: CapabilityClient) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> crate::ResourceId {
        self.inner.id()
    }
}

#[async_trait]
impl PriceGetter for PriceGetterClient {
    async fn token_prices(&self, tokens: Vec<String>) -> Result<Vec<TokenPrice>> {
        self.inner
            .call("token_prices", &TokenPricesParams { tokens })
            .await
    }

    async fn is_token_supported(&self, token: &str) -> Result<bool> {
        self.inner
            .call(
                "is_token_supported",
                &TokenParams {
                    token: token.to_string(),
                },
            )
            .await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

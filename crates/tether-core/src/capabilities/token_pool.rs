//! Token pool rate-limit reads.

use crate::capability::{
    method_not_found, params, to_value, CapabilityClient, Dispatch, Spawner,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const CAPABILITY: &str = "TokenPoolReader";

/// State of one pool's inbound token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketRateLimit {
    #[serde(with = "super::decimal")]
    pub tokens: u128,
    /// Unix seconds of the last refill.
    pub last_updated: u32,
    pub is_enabled: bool,
    #[serde(with = "super::decimal")]
    pub capacity: u128,
    /// Tokens added per second.
    #[serde(with = "super::decimal")]
    pub rate: u128,
}

#[async_trait]
pub trait TokenPoolReader: Send + Sync {
    /// Inbound rate limits, one per pool, in request order.
    async fn inbound_rate_limits(&self, pools: Vec<String>) -> Result<Vec<TokenBucketRateLimit>>;

    async fn close(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct RateLimitParams {
    pools: Vec<String>,
}

/// Dispatch table serving a [`TokenPoolReader`].
pub struct TokenPoolReaderService {
    inner: Arc<dyn TokenPoolReader>,
}

impl TokenPoolReaderService {
    pub fn new(inner: Arc<dyn TokenPoolReader>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Dispatch for TokenPoolReaderService {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    async fn dispatch(&self, method: &str, args: Value, _spawner: &Spawner) -> Result<Value> {
        match method {
            "inbound_rate_limits" => {
                let p: RateLimitParams = params(method, args)?;
                to_value(&self.inner.inbound_rate_limits(p.pools).await?)
            }
            _ => Err(method_not_found(CAPABILITY, method)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Remote [`TokenPoolReader`].
#[derive(Clone, Debug)]
pub struct TokenPoolReaderClient {
    inner: CapabilityClient,
}

impl TokenPoolReaderClient {
    pub fn new(inner: CapabilityClient) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> crate::ResourceId {
        self.inner.id()
    }
}

#[async_trait]
impl TokenPoolReader for TokenPoolReaderClient {
    async fn inbound_rate_limits(&self, pools: Vec<String>) -> Result<Vec<TokenBucketRateLimit>> {
        self.inner
            .call("inbound_rate_limits", &RateLimitParams { pools })
            .await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

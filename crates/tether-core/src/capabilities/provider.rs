//! Root capability of a reader plugin.

use super::price_getter::{self, PriceGetter, PriceGetterClient, PriceGetterConfig, PriceGetterService};
use super::token_pool::{self, TokenPoolReader, TokenPoolReaderClient, TokenPoolReaderService};
use crate::broker::{Broker, BrokerExt};
use crate::capability::{
    method_not_found, params, to_value, CapabilityClient, Dispatch, Spawner,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const CAPABILITY: &str = "ReaderProvider";

/// Hands out readers for one chain.
#[async_trait]
pub trait ReaderProvider: Send + Sync {
    async fn name(&self) -> Result<String>;

    async fn new_price_getter(&self, config: PriceGetterConfig) -> Result<Arc<dyn PriceGetter>>;

    /// Reader for the token pools of `offramp`.
    async fn new_token_pool_reader(&self, offramp: String) -> Result<Arc<dyn TokenPoolReader>>;

    async fn close(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct PriceGetterParams {
    config: PriceGetterConfig,
}

#[derive(Serialize, Deserialize)]
struct TokenPoolParams {
    offramp: String,
}

/// Dispatch table serving a [`ReaderProvider`].
pub struct ReaderProviderService {
    inner: Arc<dyn ReaderProvider>,
}

impl ReaderProviderService {
    pub fn new(inner: Arc<dyn ReaderProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Dispatch for ReaderProviderService {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    async fn dispatch(&self, method: &str, args: Value, spawner: &Spawner) -> Result<Value> {
        match method {
            "name" => to_value(&self.inner.name().await?),
            "new_price_getter" => {
                let p: PriceGetterParams = params(method, args)?;
                let getter = self.inner.new_price_getter(p.config).await?;
                spawner.spawn(PriceGetterService::new(getter)).await
            }
            "new_token_pool_reader" => {
                let p: TokenPoolParams = params(method, args)?;
                let reader = self.inner.new_token_pool_reader(p.offramp).await?;
                spawner.spawn(TokenPoolReaderService::new(reader)).await
            }
            _ => Err(method_not_found(CAPABILITY, method)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Remote [`ReaderProvider`].
#[derive(Clone, Debug)]
pub struct ReaderProviderClient {
    inner: CapabilityClient,
}

impl ReaderProviderClient {
    pub fn new(inner: CapabilityClient) -> Self {
        Self { inner }
    }

    /// Connect to the provider served at the root of the peer's link.
    pub async fn dial_root(broker: &Broker) -> Result<Self> {
        let ext = BrokerExt::new(broker.clone(), CAPABILITY);
        let conn = broker.dial_root().await?;
        Ok(Self::new(CapabilityClient::new(CAPABILITY, conn, Some(ext))))
    }

    pub fn id(&self) -> crate::ResourceId {
        self.inner.id()
    }
}

#[async_trait]
impl ReaderProvider for ReaderProviderClient {
    async fn name(&self) -> Result<String> {
        self.inner.call("name", &Value::Null).await
    }

    async fn new_price_getter(&self, config: PriceGetterConfig) -> Result<Arc<dyn PriceGetter>> {
        let child = self
            .inner
            .call_resource(
                "new_price_getter",
                &PriceGetterParams { config },
                price_getter::CAPABILITY,
            )
            .await?;
        Ok(Arc::new(PriceGetterClient::new(child)))
    }

    async fn new_token_pool_reader(&self, offramp: String) -> Result<Arc<dyn TokenPoolReader>> {
        let child = self
            .inner
            .call_resource(
                "new_token_pool_reader",
                &TokenPoolParams { offramp },
                token_pool::CAPABILITY,
            )
            .await?;
        Ok(Arc::new(TokenPoolReaderClient::new(child)))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

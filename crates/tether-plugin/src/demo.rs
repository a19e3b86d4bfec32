//! Static reader implementations served by the demo plugin.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::capabilities::{
    PriceGetter, PriceGetterConfig, ReaderProvider, TokenBucketRateLimit, TokenPoolReader,
    TokenPrice,
};
use tether_core::{Result, TetherError};
use tracing::{debug, info};

/// Parse a `TOKEN=PRICE` flag value.
pub fn parse_price(raw: &str) -> std::result::Result<TokenPrice, String> {
    let (token, price) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=PRICE, got '{}'", raw))?;
    let price = price
        .trim()
        .parse::<u128>()
        .map_err(|e| format!("invalid price for {}: {}", token, e))?;
    Ok(TokenPrice {
        token: token.trim().to_string(),
        price,
    })
}

pub struct DemoProvider {
    name: String,
    defaults: Vec<TokenPrice>,
}

impl DemoProvider {
    pub fn new(name: impl Into<String>, defaults: Vec<TokenPrice>) -> Self {
        Self {
            name: name.into(),
            defaults,
        }
    }
}

#[async_trait]
impl ReaderProvider for DemoProvider {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn new_price_getter(&self, config: PriceGetterConfig) -> Result<Arc<dyn PriceGetter>> {
        // Config prices override the plugin defaults.
        let prices: BTreeMap<String, u128> = self
            .defaults
            .iter()
            .chain(config.static_prices.iter())
            .map(|p| (p.token.clone(), p.price))
            .collect();
        info!(
            "Price getter for chain {} with {} token(s)",
            config.chain_selector,
            prices.len()
        );
        Ok(Arc::new(StaticPriceGetter { prices }))
    }

    async fn new_token_pool_reader(&self, offramp: String) -> Result<Arc<dyn TokenPoolReader>> {
        if offramp.is_empty() {
            return Err(TetherError::Other("offramp address is empty".to_string()));
        }
        info!("Token pool reader for offramp {}", offramp);
        Ok(Arc::new(StaticPoolReader { offramp }))
    }

    async fn close(&self) -> Result<()> {
        debug!("Provider {} closed", self.name);
        Ok(())
    }
}

struct StaticPriceGetter {
    prices: BTreeMap<String, u128>,
}

#[async_trait]
impl PriceGetter for StaticPriceGetter {
    async fn token_prices(&self, tokens: Vec<String>) -> Result<Vec<TokenPrice>> {
        Ok(tokens
            .into_iter()
            .filter_map(|token| {
                let price = *self.prices.get(&token)?;
                Some(TokenPrice { token, price })
            })
            .collect())
    }

    async fn is_token_supported(&self, token: &str) -> Result<bool> {
        Ok(self.prices.contains_key(token))
    }

    async fn close(&self) -> Result<()> {
        debug!("Price getter closed");
        Ok(())
    }
}

struct StaticPoolReader {
    offramp: String,
}

/// Every pool gets the same full, enabled bucket.
const BUCKET_CAPACITY: u128 = 100_000 * 10u128.pow(18);
const BUCKET_RATE: u128 = 10u128.pow(18);

#[async_trait]
impl TokenPoolReader for StaticPoolReader {
    async fn inbound_rate_limits(&self, pools: Vec<String>) -> Result<Vec<TokenBucketRateLimit>> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        Ok(pools
            .iter()
            .map(|_| TokenBucketRateLimit {
                tokens: BUCKET_CAPACITY,
                last_updated: now,
                is_enabled: true,
                capacity: BUCKET_CAPACITY,
                rate: BUCKET_RATE,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        debug!("Token pool reader for {} closed", self.offramp);
        Ok(())
    }
}

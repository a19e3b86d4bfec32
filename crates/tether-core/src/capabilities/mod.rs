//! Built-in capability set.
//!
//! A cross-chain reader plugin exposes a [`ReaderProvider`] at the root of its
//! link. The provider creates [`PriceGetter`] and [`TokenPoolReader`]
//! resources on demand.
//!
//! Each capability has three parts:
//!
//! - a trait, implemented by the plugin's real code and by the typed client,
//! - a `*Service` dispatch table served by [`CapabilityServer`],
//! - a `*Client` wrapping [`CapabilityClient`].
//!
//! [`CapabilityServer`]: crate::capability::CapabilityServer
//! [`CapabilityClient`]: crate::capability::CapabilityClient

pub mod price_getter;
pub mod provider;
pub mod token_pool;

pub use price_getter::{
    PriceGetter, PriceGetterClient, PriceGetterConfig, PriceGetterService, TokenPrice,
};
pub use provider::{ReaderProvider, ReaderProviderClient, ReaderProviderService};
pub use token_pool::{
    TokenBucketRateLimit, TokenPoolReader, TokenPoolReaderClient, TokenPoolReaderService,
};

/// `u128` amounts travel as decimal strings; JSON numbers lose precision past 2^53.
pub(crate) mod decimal {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

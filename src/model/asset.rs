use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

#[derive(Debug, Error)]
#[cfg_attr(test, derive(Eq, PartialEq))]
pub enum AssetError {
    #[error("Empty asset identifier")]
    Empty,

    #[error("Asset identifier {0:?} contains whitespace or non-printable characters")]
    InvalidIdentifier(String),

    #[error("Trade pair {0:?} cannot be split into base and quote assets")]
    UnprocessablePair(String),
}

/// Identifies a single asset.
///
/// Identifiers are an open set: exchange tickers like `"BTC"` as well as namespaced on-chain
/// identifiers like `"eip155:1/erc20:0xdac1..."` are both valid. Construction never fails;
/// [`Asset::resolve`] is where malformed identifiers surface.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Asset(Box<str>);

impl Asset {
    /// Validate the identifier, returning a resolved copy for accounting use.
    pub fn resolve(&self) -> Result<Self, AssetError> {
        if self.0.is_empty() {
            return Err(AssetError::Empty);
        }
        if !self.0.chars().all(|ch| ch.is_ascii_graphic()) {
            return Err(AssetError::InvalidIdentifier(self.0.to_string()));
        }

        Ok(self.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Asset {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for Asset {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw market pair in `"BASE_QUOTE"` form, as imported from exchange history.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TradePair(Box<str>);

impl TradePair {
    /// Split the pair into its base and quote assets.
    pub fn assets(&self) -> Result<(Asset, Asset), AssetError> {
        let (base, quote) = self
            .0
            .split_once('_')
            .ok_or_else(|| AssetError::UnprocessablePair(self.0.to_string()))?;
        if base.is_empty() || quote.is_empty() || quote.contains('_') {
            return Err(AssetError::UnprocessablePair(self.0.to_string()));
        }

        Ok((Asset::from(base).resolve()?, Asset::from(quote).resolve()?))
    }
}

impl From<&str> for TradePair {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Display for TradePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use crate::model::asset::Asset;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::warn;

/// Price lookup failures.
#[cfg_attr(test, derive(Eq, PartialEq))]
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("No {from} price in {to} for timestamp {at}")]
    NotFound {
        from: Asset,
        to: Asset,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum PriceTableError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("RON parsing error")]
    Parse(#[from] ron::de::SpannedError),

    #[error("Price table has an invalid aggregation granularity")]
    InvalidGranularity,
}

/// The price-lookup capability the engine consumes.
///
/// Exists as a trait so that unit tests can feed fixed prices, and so callers can plug in
/// remote oracles with their own retry policy. The engine itself never retries.
pub trait PriceOracle {
    /// Price of one unit of `from` denominated in `to` at the given time.
    fn historical_price(
        &self,
        from: &Asset,
        to: &Asset,
        at: DateTime<Utc>,
    ) -> Result<Decimal, PriceError>;
}

pub type PriceMap = BTreeMap<u64, Decimal>;

/// In-memory historical price table with every series quoted in one base currency.
///
/// Series are bucketed by a uniform timestamp granularity; a lookup matches the most recent
/// entry within its bucket. Cross rates between two non-base assets go through the base.
#[derive(Debug)]
pub struct PriceTable {
    base: Asset,

    /// Timestamp granularity.
    ///
    /// Must be equal to the interval between each timestamp in the keys, minus 1 second.
    granularity: u64,

    prices: HashMap<Asset, PriceMap>,
}

#[derive(Debug, Deserialize)]
struct RawPriceTable {
    base: String,
    prices: BTreeMap<String, PriceMap>,
}

impl PriceTable {
    /// Load a price table from a RON file.
    pub fn load<P>(path: P) -> Result<Self, PriceTableError>
    where
        P: AsRef<Path>,
    {
        let data = fs::read_to_string(path.as_ref())?;
        let raw = ron::from_str::<RawPriceTable>(&data)?;

        let mut granularity = 0;
        let mut prices = HashMap::new();
        for (asset, series) in raw.prices {
            if series.is_empty() {
                warn!("Empty {asset} price series");
                continue;
            }
            granularity = check_granularity(&series, granularity)?;
            prices.insert(Asset::from(asset), series);
        }

        if granularity == 0 {
            Err(PriceTableError::InvalidGranularity)
        } else {
            Ok(Self {
                base: Asset::from(raw.base),
                // Patch the detected granularity to make lower-bound searches exclusive
                granularity: granularity - 1,
                prices,
            })
        }
    }

    pub fn from_raw(base: Asset, granularity: u64, prices: HashMap<Asset, PriceMap>) -> Self {
        Self {
            base,
            granularity,
            prices,
        }
    }

    fn get(&self, asset: &Asset, at: DateTime<Utc>) -> Option<Decimal> {
        let end = at.timestamp() as u64;
        let start = end.saturating_sub(self.granularity);
        let map = self.prices.get(asset)?;

        map.range(start..=end).next_back().map(|(_k, v)| *v)
    }
}

impl PriceOracle for PriceTable {
    fn historical_price(
        &self,
        from: &Asset,
        to: &Asset,
        at: DateTime<Utc>,
    ) -> Result<Decimal, PriceError> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        let not_found = || PriceError::NotFound {
            from: from.clone(),
            to: to.clone(),
            at,
        };
        let from_rate = if *from == self.base {
            Decimal::ONE
        } else {
            self.get(from, at).ok_or_else(not_found)?
        };
        let to_rate = if *to == self.base {
            Decimal::ONE
        } else {
            self.get(to, at).ok_or_else(not_found)?
        };

        Ok(from_rate / to_rate)
    }
}

fn check_granularity(map: &PriceMap, granularity: u64) -> Result<u64, PriceTableError> {
    let mut granularity = granularity;
    let mut previous = None;
    for timestamp in map.keys() {
        if let Some(previous) = previous {
            let gap = timestamp - previous;
            if granularity == 0 {
                granularity = gap;
            } else if gap != granularity {
                return Err(PriceTableError::InvalidGranularity);
            }
        }
        previous = Some(*timestamp);
    }

    Ok(granularity)
}

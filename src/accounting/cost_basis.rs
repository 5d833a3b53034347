use crate::model::asset::Asset;
use crate::util::fifo::FIFO;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A quantity of an asset acquired at a specific unit cost, tracked until fully disposed.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Lot {
    pub amount: Decimal,

    /// Cost of one unit at acquisition, denominated in the run's profit currency.
    ///
    /// A partially consumed lot keeps this value.
    pub unit_cost: Decimal,

    pub acquired_at: DateTime<Utc>,
}

/// Outcome of one disposal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Disposal {
    /// Acquisition cost of the lots the disposal matched, in the profit currency.
    pub cost_basis: Decimal,

    /// Portion of the requested amount no lot could cover.
    ///
    /// Non-zero means the stream implied a negative balance. The caller decides whether that
    /// is a warning or an error; the ledger itself never goes negative.
    pub shortfall: Decimal,
}

/// Per-asset FIFO queues of acquisition lots.
#[derive(Debug, Default)]
pub struct CostBasisLedger {
    pools: HashMap<Asset, FIFO<Lot>>,
}

impl CostBasisLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new lot to the asset's queue.
    pub fn acquire(
        &mut self,
        asset: Asset,
        amount: Decimal,
        unit_cost: Decimal,
        acquired_at: DateTime<Utc>,
    ) {
        debug_assert!(
            amount > Decimal::ZERO,
            "Cannot acquire a zero or negative amount of {asset}",
        );

        self.pools.entry(asset).or_default().append_back(Lot {
            amount,
            unit_cost,
            acquired_at,
        });
    }

    /// Consume lots oldest-first until `amount` is satisfied or the queue is exhausted.
    ///
    /// A lot on the amount boundary is split: the consumed part contributes to the cost basis
    /// and the remainder goes back to the queue front with its original unit cost.
    pub fn dispose(&mut self, asset: &Asset, amount: Decimal) -> Disposal {
        let mut remaining = amount;
        let mut cost_basis = Decimal::ZERO;

        let Some(pool) = self.pools.get_mut(asset) else {
            return Disposal {
                cost_basis,
                shortfall: remaining,
            };
        };

        while remaining > Decimal::ZERO {
            let Some(lot) = pool.pop_front() else {
                break;
            };

            if lot.amount <= remaining {
                cost_basis += lot.amount * lot.unit_cost;
                remaining -= lot.amount;
            } else {
                cost_basis += remaining * lot.unit_cost;
                pool.push_front(Lot {
                    amount: lot.amount - remaining,
                    ..lot
                });
                remaining = Decimal::ZERO;
            }
        }

        Disposal {
            cost_basis,
            shortfall: remaining,
        }
    }

    /// Sum of all lot amounts for the asset.
    pub fn balance(&self, asset: &Asset) -> Decimal {
        self.pools
            .get(asset)
            .map(|pool| pool.iter().map(|lot| lot.amount).sum())
            .unwrap_or_default()
    }

    /// Remaining lots for the asset, oldest first.
    pub fn lots(&self, asset: &Asset) -> impl Iterator<Item = &Lot> {
        self.pools.get(asset).into_iter().flat_map(FIFO::iter)
    }

    /// Every asset the ledger has seen, including fully disposed ones.
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.pools.keys()
    }
}

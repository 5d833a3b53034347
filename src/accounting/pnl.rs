use crate::model::events::AccountingEventType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, AddAssign, Neg};

/// Realized profit or loss, split into taxable and tax-free portions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Pnl {
    pub taxable: Decimal,
    pub free: Decimal,
}

impl Pnl {
    pub fn taxable(value: Decimal) -> Self {
        Self {
            taxable: value,
            free: Decimal::ZERO,
        }
    }

    pub fn free(value: Decimal) -> Self {
        Self {
            taxable: Decimal::ZERO,
            free: value,
        }
    }

    pub fn total(&self) -> Decimal {
        self.taxable + self.free
    }

    pub fn is_zero(&self) -> bool {
        self.taxable.is_zero() && self.free.is_zero()
    }
}

impl Add for Pnl {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            taxable: self.taxable + rhs.taxable,
            free: self.free + rhs.free,
        }
    }
}

impl AddAssign for Pnl {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Neg for Pnl {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            taxable: -self.taxable,
            free: -self.free,
        }
    }
}

/// PnL accumulated per accounting event category over one run.
///
/// Exact per-category values are retained for audit; [`PnlTotals::overview`] is the coarse
/// report projection.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PnlTotals {
    totals: HashMap<AccountingEventType, Pnl>,
}

impl PnlTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event_type: AccountingEventType, pnl: Pnl) {
        *self.totals.entry(event_type).or_default() += pnl;
    }

    /// Accumulated PnL for the category; zero when the category never contributed.
    pub fn get(&self, event_type: AccountingEventType) -> Pnl {
        self.totals.get(&event_type).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AccountingEventType, Pnl)> + '_ {
        self.totals.iter().map(|(event_type, pnl)| (*event_type, *pnl))
    }

    /// Fold categories into their overview labels, summing categories that share a label.
    ///
    /// Zero entries are omitted: a category contributing nothing is invisible in the report.
    pub fn overview(&self) -> BTreeMap<&'static str, Pnl> {
        let mut overview = BTreeMap::new();
        for (event_type, pnl) in &self.totals {
            *overview
                .entry(event_type.to_overview_label())
                .or_insert_with(Pnl::default) += *pnl;
        }
        overview.retain(|_label, pnl: &mut Pnl| !pnl.is_zero());

        overview
    }
}

impl AddAssign for PnlTotals {
    fn add_assign(&mut self, rhs: Self) {
        for (event_type, pnl) in rhs.totals {
            self.add(event_type, pnl);
        }
    }
}

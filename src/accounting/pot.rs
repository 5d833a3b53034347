use crate::accounting::cost_basis::CostBasisLedger;
use crate::accounting::pnl::{Pnl, PnlTotals};
use crate::accounting::settings::{
    ModuleSettingsRegistry, SettingsError, TxEventRules, TxEventSettings, TxMethod,
    TxMultitakeTreatment,
};
use crate::model::asset::{Asset, AssetError};
use crate::model::events::{
    AccountingEvent, AccountingEventType, ActionType, AssetMovement, HistoryEvent,
    HistoryEventType, LedgerAction, LedgerActionType, Loan, MarginPosition, PreforkAcquisition,
    StakingEvent, Trade, TradeType,
};
use crate::model::price::{PriceError, PriceOracle};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Stream contract violations. These abort the run: a partially applied event group cannot
/// be safely reconciled.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(
        "Out-of-order stream: {category} event {identifier} at {timestamp} is earlier than \
         the already processed {previous}"
    )]
    OutOfOrderTimestamp {
        identifier: String,
        timestamp: DateTime<Utc>,
        previous: DateTime<Utc>,
        category: AccountingEventType,
    },

    #[error(
        "Event group started by {category} event {identifier} at {timestamp} was truncated: \
         needed {expected} events, the stream ended after {got}"
    )]
    TruncatedMultitake {
        identifier: String,
        timestamp: DateTime<Utc>,
        category: AccountingEventType,
        expected: usize,
        got: usize,
    },

    #[error(
        "Event group started by {identifier} at {timestamp} pulled a {found} event, \
         which cannot belong to the group"
    )]
    ForeignMultitakeEvent {
        identifier: String,
        timestamp: DateTime<Utc>,
        found: AccountingEventType,
    },
}

/// Recoverable per-event conditions. The run continues; ledger and PnL reflect only what was
/// resolvable.
#[derive(Debug, Error)]
pub enum ProcessingWarning {
    #[error("Cannot resolve assets for {category} event {identifier} at {timestamp}")]
    UnresolvableAsset {
        identifier: String,
        timestamp: DateTime<Utc>,
        category: AccountingEventType,
        #[source]
        source: AssetError,
    },

    #[error("{category} event {identifier} is excluded from PnL")]
    MissingPrice {
        identifier: String,
        category: AccountingEventType,
        #[source]
        source: PriceError,
    },

    #[error(
        "Disposal of {amount} {asset} by {category} event {identifier} exceeds acquired \
         lots by {shortfall}"
    )]
    InsufficientBalance {
        identifier: String,
        category: AccountingEventType,
        asset: Asset,
        amount: Decimal,
        shortfall: Decimal,
    },
}

/// Configuration for one accounting run. Deliberately an explicit value: nothing here is
/// process-global.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Every monetary value in lots and PnL is denominated in this asset.
    pub profit_currency: Asset,

    /// Start of the tax period. Earlier events move the cost-basis ledger but never PnL.
    pub query_start: DateTime<Utc>,

    /// End of the tax period. Later events are skipped entirely.
    pub query_end: DateTime<Utc>,

    /// Ledger action types that contribute to taxable PnL. Actions outside the set still
    /// move the cost-basis ledger.
    pub taxable_ledger_actions: HashSet<LedgerActionType>,

    /// Event identifiers excluded from this run, partitioned by action type.
    pub ignored: HashMap<ActionType, HashSet<String>>,
}

impl RunSettings {
    pub fn new(
        profit_currency: Asset,
        query_start: DateTime<Utc>,
        query_end: DateTime<Utc>,
    ) -> Self {
        Self {
            profit_currency,
            query_start,
            query_end,
            taxable_ledger_actions: HashSet::from([
                LedgerActionType::Income,
                LedgerActionType::Expense,
                LedgerActionType::Loss,
                LedgerActionType::DividendsIncome,
                LedgerActionType::Grant,
            ]),
            ignored: HashMap::new(),
        }
    }

    fn in_period(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.query_start && timestamp <= self.query_end
    }
}

/// One disposal to apply to the ledger and totals.
struct Spend<'a> {
    category: AccountingEventType,
    identifier: &'a str,
    timestamp: DateTime<Utc>,
    asset: &'a Asset,
    amount: Decimal,
    /// Total disposal value in the profit currency; `None` when no price could be resolved.
    value: Option<Decimal>,
    taxable: bool,
    count_entire_amount_spend: bool,
    count_cost_basis_pnl: bool,
}

/// One acquisition to apply to the ledger and totals.
struct Acquisition<'a> {
    category: AccountingEventType,
    timestamp: DateTime<Utc>,
    asset: &'a Asset,
    amount: Decimal,
    /// Profit-currency cost of one unit; `None` when no price could be resolved.
    unit_price: Option<Decimal>,
    taxable: bool,
}

/// Owns the ledger, the totals, the warnings and the resolved settings for one run, and
/// drives the processing loop over the event stream.
///
/// A pot is single-use: create, [`process`], then read the outputs. Independent runs are
/// fully independent values and may execute in parallel.
///
/// [`process`]: AccountingPot::process
pub struct AccountingPot<'a> {
    settings: RunSettings,
    prices: &'a dyn PriceOracle,
    rules: TxEventRules,
    cost_basis: CostBasisLedger,
    pnls: PnlTotals,
    warnings: Vec<ProcessingWarning>,
    last_timestamp: Option<DateTime<Utc>>,
    events_consumed: usize,
    steps: usize,
}

impl<'a> AccountingPot<'a> {
    /// Create a pot for one run, building every registered module's rule table.
    pub fn new(
        settings: RunSettings,
        registry: &ModuleSettingsRegistry,
        prices: &'a dyn PriceOracle,
    ) -> Result<Self, SettingsError> {
        let rules = registry.build(&settings)?;
        debug!(
            "Built {count} module rules for profit currency {currency}",
            count = rules.len(),
            currency = settings.profit_currency,
        );

        Ok(Self {
            settings,
            prices,
            rules,
            cost_basis: CostBasisLedger::new(),
            pnls: PnlTotals::new(),
            warnings: Vec::new(),
            last_timestamp: None,
            events_consumed: 0,
            steps: 0,
        })
    }

    /// Run the processing loop until the event stream is exhausted.
    ///
    /// The stream must be sorted by timestamp. Dispatching an event may pull further events
    /// from the same iterator when its settings span a group; the loop advances by the
    /// consumed count so no event is processed twice.
    pub fn process<I>(&mut self, events: I) -> Result<(), ProcessError>
    where
        I: IntoIterator<Item = AccountingEvent>,
    {
        let mut events = events.into_iter();

        while let Some(event) = events.next() {
            self.check_ordering(&event)?;
            self.events_consumed += 1;

            if event.timestamp() > self.settings.query_end {
                debug!(
                    "Skipping event {identifier} after the query period",
                    identifier = event.identifier(),
                );
                continue;
            }
            if event.should_ignore(&self.settings.ignored) {
                debug!("Skipping ignored event {identifier}", identifier = event.identifier());
                continue;
            }
            if let Err(source) = event.involved_assets() {
                warn!(
                    "Skipping event {identifier} with unresolvable assets: {source}",
                    identifier = event.identifier(),
                );
                self.warnings.push(ProcessingWarning::UnresolvableAsset {
                    identifier: event.identifier().to_string(),
                    timestamp: event.timestamp(),
                    category: event.event_type(),
                    source,
                });
                continue;
            }

            let consumed = self.dispatch(event, &mut events)?;
            self.events_consumed += consumed - 1;
            self.steps += 1;
        }

        Ok(())
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn pnls(&self) -> &PnlTotals {
        &self.pnls
    }

    pub fn cost_basis(&self) -> &CostBasisLedger {
        &self.cost_basis
    }

    pub fn warnings(&self) -> &[ProcessingWarning] {
        &self.warnings
    }

    /// Total events read from the stream, including events pulled into groups.
    pub fn events_consumed(&self) -> usize {
        self.events_consumed
    }

    /// Dispatch steps taken; a consumed group counts as one step.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn check_ordering(&mut self, event: &AccountingEvent) -> Result<(), ProcessError> {
        let timestamp = event.timestamp();
        if let Some(previous) = self.last_timestamp {
            if timestamp < previous {
                return Err(ProcessError::OutOfOrderTimestamp {
                    identifier: event.identifier().to_string(),
                    timestamp,
                    previous,
                    category: event.event_type(),
                });
            }
        }
        self.last_timestamp = Some(timestamp);

        Ok(())
    }

    fn dispatch<I>(&mut self, event: AccountingEvent, events: &mut I) -> Result<usize, ProcessError>
    where
        I: Iterator<Item = AccountingEvent>,
    {
        match event {
            AccountingEvent::Trade(trade) => {
                self.handle_trade(trade);
                Ok(1)
            }
            AccountingEvent::AssetMovement(movement) => {
                self.handle_asset_movement(movement);
                Ok(1)
            }
            AccountingEvent::MarginPosition(position) => {
                self.handle_margin_position(position);
                Ok(1)
            }
            AccountingEvent::Loan(loan) => {
                self.handle_loan(loan);
                Ok(1)
            }
            AccountingEvent::PreforkAcquisition(prefork) => {
                self.handle_prefork_acquisition(prefork);
                Ok(1)
            }
            AccountingEvent::LedgerAction(action) => {
                self.handle_ledger_action(action);
                Ok(1)
            }
            AccountingEvent::Staking(staking) => {
                self.handle_staking(staking);
                Ok(1)
            }
            AccountingEvent::HistoryBaseEntry(entry) => {
                self.handle_history_event(AccountingEventType::HistoryBaseEntry, entry, events)
            }
            AccountingEvent::TransactionEvent(tx) => {
                self.handle_history_event(AccountingEventType::TransactionEvent, tx.event, events)
            }
        }
    }

    /// Both legs of a trade, priced through the quote asset: the trade rate is definitional,
    /// so only the quote needs an oracle lookup.
    fn handle_trade(&mut self, trade: Trade) {
        // Pair resolution was validated before dispatch.
        let Ok((base, quote)) = trade.pair.assets() else {
            return;
        };

        let quote_price = self.unit_price_or_warn(
            &quote,
            trade.timestamp,
            &trade.identifier,
            AccountingEventType::Trade,
        );

        match trade.trade_type {
            TradeType::Buy => {
                self.add_spend(Spend {
                    category: AccountingEventType::Trade,
                    identifier: &trade.identifier,
                    timestamp: trade.timestamp,
                    asset: &quote,
                    amount: trade.amount * trade.rate,
                    value: quote_price.map(|price| trade.amount * trade.rate * price),
                    taxable: true,
                    count_entire_amount_spend: false,
                    count_cost_basis_pnl: true,
                });
                self.add_acquisition(Acquisition {
                    category: AccountingEventType::Trade,
                    timestamp: trade.timestamp,
                    asset: &base,
                    amount: trade.amount,
                    unit_price: quote_price.map(|price| trade.rate * price),
                    taxable: false,
                });
            }
            TradeType::Sell => {
                self.add_spend(Spend {
                    category: AccountingEventType::Trade,
                    identifier: &trade.identifier,
                    timestamp: trade.timestamp,
                    asset: &base,
                    amount: trade.amount,
                    value: quote_price.map(|price| trade.amount * trade.rate * price),
                    taxable: true,
                    count_entire_amount_spend: false,
                    count_cost_basis_pnl: true,
                });
                self.add_acquisition(Acquisition {
                    category: AccountingEventType::Trade,
                    timestamp: trade.timestamp,
                    asset: &quote,
                    amount: trade.amount * trade.rate,
                    unit_price: quote_price,
                    taxable: false,
                });
            }
        }

        if let (Some(fee), Some(fee_asset)) = (trade.fee, trade.fee_asset.as_ref()) {
            if fee > Decimal::ZERO {
                let value = self
                    .unit_price_or_warn(
                        fee_asset,
                        trade.timestamp,
                        &trade.identifier,
                        AccountingEventType::Trade,
                    )
                    .map(|price| fee * price);
                self.add_spend(Spend {
                    category: AccountingEventType::Trade,
                    identifier: &trade.identifier,
                    timestamp: trade.timestamp,
                    asset: fee_asset,
                    amount: fee,
                    value,
                    taxable: true,
                    count_entire_amount_spend: true,
                    count_cost_basis_pnl: false,
                });
            }
        }
    }

    /// Only the exchange fee matters for deposits and withdrawals; the moved amount stays
    /// the user's.
    fn handle_asset_movement(&mut self, movement: AssetMovement) {
        if movement.fee <= Decimal::ZERO {
            return;
        }

        let value = self
            .unit_price_or_warn(
                &movement.asset,
                movement.timestamp,
                &movement.identifier,
                AccountingEventType::AssetMovement,
            )
            .map(|price| movement.fee * price);
        self.add_spend(Spend {
            category: AccountingEventType::AssetMovement,
            identifier: &movement.identifier,
            timestamp: movement.timestamp,
            asset: &movement.asset,
            amount: movement.fee,
            value,
            taxable: true,
            count_entire_amount_spend: true,
            count_cost_basis_pnl: false,
        });
    }

    fn handle_margin_position(&mut self, position: MarginPosition) {
        if position.profit_loss.is_zero() {
            return;
        }

        let price = self.unit_price_or_warn(
            &position.pl_currency,
            position.timestamp,
            &position.identifier,
            AccountingEventType::MarginPosition,
        );

        if position.profit_loss > Decimal::ZERO {
            self.add_acquisition(Acquisition {
                category: AccountingEventType::MarginPosition,
                timestamp: position.timestamp,
                asset: &position.pl_currency,
                amount: position.profit_loss,
                unit_price: price,
                taxable: true,
            });
        } else {
            let loss = -position.profit_loss;
            self.add_spend(Spend {
                category: AccountingEventType::MarginPosition,
                identifier: &position.identifier,
                timestamp: position.timestamp,
                asset: &position.pl_currency,
                amount: loss,
                value: price.map(|price| loss * price),
                taxable: true,
                count_entire_amount_spend: true,
                count_cost_basis_pnl: false,
            });
        }
    }

    fn handle_loan(&mut self, loan: Loan) {
        if loan.earned <= Decimal::ZERO {
            return;
        }

        let unit_price = self.unit_price_or_warn(
            &loan.asset,
            loan.timestamp,
            &loan.identifier,
            AccountingEventType::Loan,
        );
        self.add_acquisition(Acquisition {
            category: AccountingEventType::Loan,
            timestamp: loan.timestamp,
            asset: &loan.asset,
            amount: loan.earned,
            unit_price,
            taxable: true,
        });
    }

    /// A prefork acquisition establishes basis at the fork-time market price without any
    /// taxable income.
    fn handle_prefork_acquisition(&mut self, prefork: PreforkAcquisition) {
        let unit_price = self.unit_price_or_warn(
            &prefork.asset,
            prefork.timestamp,
            &prefork.identifier,
            AccountingEventType::PreforkAcquisition,
        );
        self.add_acquisition(Acquisition {
            category: AccountingEventType::PreforkAcquisition,
            timestamp: prefork.timestamp,
            asset: &prefork.asset,
            amount: prefork.amount,
            unit_price,
            taxable: false,
        });
    }

    fn handle_ledger_action(&mut self, action: LedgerAction) {
        let taxable = self
            .settings
            .taxable_ledger_actions
            .contains(&action.action_type);

        // An explicit rate overrides the oracle; a rate asset other than the profit currency
        // is converted through the oracle.
        let unit_price = match (action.rate, action.rate_asset.as_ref()) {
            (Some(rate), Some(rate_asset)) => self
                .unit_price_or_warn(
                    rate_asset,
                    action.timestamp,
                    &action.identifier,
                    AccountingEventType::LedgerAction,
                )
                .map(|price| rate * price),
            (Some(rate), None) => Some(rate),
            (None, _) => self.unit_price_or_warn(
                &action.asset,
                action.timestamp,
                &action.identifier,
                AccountingEventType::LedgerAction,
            ),
        };

        if action.action_type.is_profitable() {
            self.add_acquisition(Acquisition {
                category: AccountingEventType::LedgerAction,
                timestamp: action.timestamp,
                asset: &action.asset,
                amount: action.amount,
                unit_price,
                taxable,
            });
        } else {
            // Expenses and losses debit their entire value; there is no gain to compute.
            self.add_spend(Spend {
                category: AccountingEventType::LedgerAction,
                identifier: &action.identifier,
                timestamp: action.timestamp,
                asset: &action.asset,
                amount: action.amount,
                value: unit_price.map(|price| action.amount * price),
                taxable,
                count_entire_amount_spend: true,
                count_cost_basis_pnl: false,
            });
        }
    }

    fn handle_staking(&mut self, staking: StakingEvent) {
        let unit_price = self.unit_price_or_warn(
            &staking.asset,
            staking.timestamp,
            &staking.identifier,
            AccountingEventType::Staking,
        );
        self.add_acquisition(Acquisition {
            category: AccountingEventType::Staking,
            timestamp: staking.timestamp,
            asset: &staking.asset,
            amount: staking.amount,
            unit_price,
            taxable: true,
        });
    }

    /// Decoded history and transaction events are interpreted through the resolved
    /// [`TxEventSettings`], pulling `take - 1` further events into the group when the rule
    /// spans several raw events. The group is validated in full before anything is applied.
    fn handle_history_event<I>(
        &mut self,
        category: AccountingEventType,
        event: HistoryEvent,
        events: &mut I,
    ) -> Result<usize, ProcessError>
    where
        I: Iterator<Item = AccountingEvent>,
    {
        if event.event_type == HistoryEventType::Informational {
            debug!(
                "Informational event {identifier}, no ledger effect",
                identifier = event.identifier,
            );
            return Ok(1);
        }

        let settings = match self.rules.resolve(&event.type_key()) {
            Some(settings) => settings.clone(),
            None => {
                match TxEventSettings::conservative(event.event_type.direction()) {
                    Some(settings) => settings,
                    None => {
                        debug!(
                            "Unclaimed neutral event {identifier}, no ledger effect",
                            identifier = event.identifier,
                        );
                        return Ok(1);
                    }
                }
            }
        };

        let mut legs = Vec::new();
        for pulled in 1..settings.take {
            let Some(next) = events.next() else {
                return Err(ProcessError::TruncatedMultitake {
                    identifier: event.identifier.clone(),
                    timestamp: event.timestamp,
                    category,
                    expected: settings.take,
                    got: pulled,
                });
            };
            self.check_ordering(&next)?;

            match next {
                AccountingEvent::HistoryBaseEntry(entry) => legs.push(entry),
                AccountingEvent::TransactionEvent(tx) => legs.push(tx.event),
                other => {
                    return Err(ProcessError::ForeignMultitakeEvent {
                        identifier: event.identifier.clone(),
                        timestamp: event.timestamp,
                        found: other.event_type(),
                    });
                }
            }
        }
        let consumed = 1 + legs.len();

        // A leg with an unresolvable asset poisons the whole group: applying only one side
        // of an exchange would corrupt both legs.
        for leg in &legs {
            if let Err(source) = leg.asset.resolve() {
                self.warnings.push(ProcessingWarning::UnresolvableAsset {
                    identifier: leg.identifier.clone(),
                    timestamp: leg.timestamp,
                    category,
                    source,
                });
                return Ok(consumed);
            }
        }

        if settings.multitake_treatment == Some(TxMultitakeTreatment::Swap) && !legs.is_empty() {
            let receive = legs.remove(0);
            self.apply_swap(category, &event, &receive, &settings);
        } else {
            self.apply_history_settings(category, &event, &settings);
        }
        for leg in legs {
            self.apply_history_single(category, &leg);
        }

        Ok(consumed)
    }

    /// Apply a group member through its own rule, with nested groups suppressed.
    fn apply_history_single(&mut self, category: AccountingEventType, event: &HistoryEvent) {
        if event.event_type == HistoryEventType::Informational {
            return;
        }

        let settings = match self.rules.resolve(&event.type_key()) {
            Some(settings) => settings.clone(),
            None => match TxEventSettings::conservative(event.event_type.direction()) {
                Some(settings) => settings,
                None => return,
            },
        };

        self.apply_history_settings(category, event, &settings);
    }

    fn apply_history_settings(
        &mut self,
        category: AccountingEventType,
        event: &HistoryEvent,
        settings: &TxEventSettings,
    ) {
        match settings.method {
            TxMethod::Acquisition => {
                let unit_price = self.unit_price_or_warn(
                    &event.asset,
                    event.timestamp,
                    &event.identifier,
                    category,
                );
                self.add_acquisition(Acquisition {
                    category,
                    timestamp: event.timestamp,
                    asset: &event.asset,
                    amount: event.amount,
                    unit_price,
                    taxable: settings.taxable,
                });
            }
            TxMethod::Spend => {
                let value = self
                    .unit_price_or_warn(
                        &event.asset,
                        event.timestamp,
                        &event.identifier,
                        category,
                    )
                    .map(|price| event.amount * price);
                self.add_spend(Spend {
                    category,
                    identifier: &event.identifier,
                    timestamp: event.timestamp,
                    asset: &event.asset,
                    amount: event.amount,
                    value,
                    taxable: settings.taxable,
                    count_entire_amount_spend: settings.count_entire_amount_spend,
                    count_cost_basis_pnl: settings.count_cost_basis_pnl,
                });
            }
        }
    }

    /// A swap group is one exchange: the disposal is priced at the acquisition value of the
    /// received leg, so a single oracle call covers both legs and no oracle noise is
    /// double-counted.
    fn apply_swap(
        &mut self,
        category: AccountingEventType,
        spend: &HistoryEvent,
        receive: &HistoryEvent,
        settings: &TxEventSettings,
    ) {
        let receive_price = self.unit_price_or_warn(
            &receive.asset,
            receive.timestamp,
            &receive.identifier,
            category,
        );

        self.add_spend(Spend {
            category,
            identifier: &spend.identifier,
            timestamp: spend.timestamp,
            asset: &spend.asset,
            amount: spend.amount,
            value: receive_price.map(|price| receive.amount * price),
            taxable: settings.taxable,
            count_entire_amount_spend: settings.count_entire_amount_spend,
            count_cost_basis_pnl: settings.count_cost_basis_pnl,
        });
        self.add_acquisition(Acquisition {
            category,
            timestamp: receive.timestamp,
            asset: &receive.asset,
            amount: receive.amount,
            unit_price: receive_price,
            taxable: false,
        });
    }

    /// Profit-currency price of one unit of `asset`, or `None` with a recorded warning.
    fn unit_price_or_warn(
        &mut self,
        asset: &Asset,
        timestamp: DateTime<Utc>,
        identifier: &str,
        category: AccountingEventType,
    ) -> Option<Decimal> {
        if *asset == self.settings.profit_currency {
            return Some(Decimal::ONE);
        }

        match self
            .prices
            .historical_price(asset, &self.settings.profit_currency, timestamp)
        {
            Ok(price) => Some(price),
            Err(source) => {
                warn!("No {asset} price at {timestamp}; {identifier} is excluded from PnL");
                self.warnings.push(ProcessingWarning::MissingPrice {
                    identifier: identifier.to_string(),
                    category,
                    source,
                });
                None
            }
        }
    }

    fn add_acquisition(&mut self, acquisition: Acquisition<'_>) {
        let Acquisition {
            category,
            timestamp,
            asset,
            amount,
            unit_price,
            taxable,
        } = acquisition;

        if amount <= Decimal::ZERO {
            return;
        }

        let is_profit_currency = *asset == self.settings.profit_currency;
        let unit_price = if is_profit_currency {
            Some(Decimal::ONE)
        } else {
            // A missing price acquires at zero cost: balances stay correct and a later
            // disposal surfaces the overstated gain instead of losing the lot.
            self.cost_basis.acquire(
                asset.clone(),
                amount,
                unit_price.unwrap_or_default(),
                timestamp,
            );
            unit_price
        };

        if taxable && self.settings.in_period(timestamp) {
            if let Some(price) = unit_price {
                self.pnls.add(category, Pnl::taxable(amount * price));
            }
        }
    }

    fn add_spend(&mut self, spend: Spend<'_>) {
        let Spend {
            category,
            identifier,
            timestamp,
            asset,
            amount,
            value,
            taxable,
            count_entire_amount_spend,
            count_cost_basis_pnl,
        } = spend;

        if amount <= Decimal::ZERO {
            return;
        }

        let is_profit_currency = *asset == self.settings.profit_currency;
        let cost_basis = if is_profit_currency {
            // The profit currency is its own basis and is not tracked in the ledger.
            amount
        } else {
            let disposal = self.cost_basis.dispose(asset, amount);
            if disposal.shortfall > Decimal::ZERO {
                warn!(
                    "Disposal by {identifier} exceeds acquired {asset} lots by {shortfall}",
                    shortfall = disposal.shortfall,
                );
                self.warnings.push(ProcessingWarning::InsufficientBalance {
                    identifier: identifier.to_string(),
                    category,
                    asset: asset.clone(),
                    amount,
                    shortfall: disposal.shortfall,
                });
            }
            disposal.cost_basis
        };

        if !(taxable && self.settings.in_period(timestamp)) {
            return;
        }
        // Missing price: the ledger is already reduced, the PnL leg is skipped.
        let Some(value) = value else {
            return;
        };

        let mut pnl = Decimal::ZERO;
        if count_entire_amount_spend {
            pnl -= value;
        }
        if count_cost_basis_pnl {
            pnl += value - cost_basis;
        }
        self.pnls.add(category, Pnl::taxable(pnl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::asset::TradePair;
    use crate::model::events::{HistoryEventSubType, MovementKind, TransactionEvent};
    use crate::model::price::{PriceMap, PriceTable};
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    const DAY: i64 = 86_400;
    const DAY0: i64 = 1_500_000_000;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    /// Price table in EUR with daily granularity.
    fn price_table(series: &[(&str, &[(i64, &str)])]) -> PriceTable {
        let prices = series
            .iter()
            .map(|(asset, points)| {
                let series = points
                    .iter()
                    .map(|(timestamp, price)| (*timestamp as u64, dec(price)))
                    .collect::<PriceMap>();
                (Asset::from(*asset), series)
            })
            .collect();

        PriceTable::from_raw(Asset::from("EUR"), (DAY - 1) as u64, prices)
    }

    fn eur_settings(query_start: i64, query_end: i64) -> RunSettings {
        RunSettings::new(Asset::from("EUR"), at(query_start), at(query_end))
    }

    fn new_pot(settings: RunSettings, prices: &PriceTable) -> AccountingPot<'_> {
        let registry = ModuleSettingsRegistry::with_defaults();
        AccountingPot::new(settings, &registry, prices).unwrap()
    }

    fn ledger_action(
        identifier: &str,
        seconds: i64,
        action_type: LedgerActionType,
        asset: &str,
        amount: &str,
        rate: Option<&str>,
        rate_asset: Option<&str>,
    ) -> AccountingEvent {
        AccountingEvent::LedgerAction(LedgerAction {
            identifier: identifier.to_string(),
            timestamp: at(seconds),
            action_type,
            asset: Asset::from(asset),
            amount: dec(amount),
            rate: rate.map(dec),
            rate_asset: rate_asset.map(Asset::from),
        })
    }

    fn income(identifier: &str, seconds: i64, asset: &str, amount: &str, rate: &str) -> AccountingEvent {
        ledger_action(
            identifier,
            seconds,
            LedgerActionType::Income,
            asset,
            amount,
            Some(rate),
            None,
        )
    }

    fn tx_event(
        tx_hash: &str,
        identifier: &str,
        seconds: i64,
        event_type: HistoryEventType,
        event_subtype: HistoryEventSubType,
        counterparty: Option<&str>,
        asset: &str,
        amount: &str,
    ) -> AccountingEvent {
        AccountingEvent::TransactionEvent(TransactionEvent {
            tx_hash: tx_hash.to_string(),
            event: HistoryEvent {
                identifier: identifier.to_string(),
                timestamp: at(seconds),
                event_type,
                event_subtype,
                counterparty: counterparty.map(str::to_string),
                asset: Asset::from(asset),
                amount: dec(amount),
            },
        })
    }

    // Income of 1 BTC before the period establishes basis without PnL; the in-period loss
    // uses its explicit USD rate converted into EUR.
    #[test]
    #[traced_test]
    fn test_ledger_actions_accounting() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[
            ("BTC", &[(DAY0, "250")]),
            ("USD", &[(DAY0 + DAY, "0.9004")]),
        ]);
        let mut pot = new_pot(eur_settings(DAY0 + DAY, DAY0 + 10 * DAY), &prices);

        pot.process([
            ledger_action(
                "action-1",
                DAY0 + 100,
                LedgerActionType::Income,
                "BTC",
                "1",
                None,
                None,
            ),
            ledger_action(
                "action-2",
                DAY0 + DAY + 50,
                LedgerActionType::Loss,
                "BTC",
                "0.1",
                Some("500"),
                Some("USD"),
            ),
        ])
        .unwrap();

        // 0.1 * 500 USD * 0.9004 EUR/USD, credited as a loss.
        let expected = Pnl::taxable(dec("-45.02"));
        assert_eq!(pot.pnls().get(AccountingEventType::LedgerAction), expected);
        assert_eq!(
            pot.pnls().overview(),
            std::collections::BTreeMap::from([("ledger action", expected)]),
        );

        let btc = Asset::from("BTC");
        assert_eq!(pot.cost_basis().balance(&btc), dec("0.9"));
        assert_eq!(
            pot.cost_basis().lots(&btc).cloned().collect::<Vec<_>>(),
            vec![crate::accounting::cost_basis::Lot {
                amount: dec("0.9"),
                unit_cost: dec("250"),
                acquired_at: at(DAY0 + 100),
            }],
        );
        assert!(pot.warnings().is_empty());
    }

    // The trade rate against the profit currency is definitional: no oracle is consulted.
    #[test]
    #[traced_test]
    fn test_trade_round_trip_with_fee() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            AccountingEvent::Trade(Trade {
                identifier: "trade-1".to_string(),
                timestamp: at(DAY0 + 100),
                pair: TradePair::from("BTC_EUR"),
                trade_type: TradeType::Buy,
                amount: dec("1"),
                rate: dec("250"),
                fee: Some(dec("1")),
                fee_asset: Some(Asset::from("EUR")),
            }),
            AccountingEvent::Trade(Trade {
                identifier: "trade-2".to_string(),
                timestamp: at(DAY0 + 200),
                pair: TradePair::from("BTC_EUR"),
                trade_type: TradeType::Sell,
                amount: dec("0.5"),
                rate: dec("300"),
                fee: None,
                fee_asset: None,
            }),
        ])
        .unwrap();

        // -1 EUR fee, then 0.5 * 300 proceeds against 0.5 * 250 basis.
        let expected = Pnl::taxable(dec("24"));
        assert_eq!(pot.pnls().get(AccountingEventType::Trade), expected);

        let btc = Asset::from("BTC");
        assert_eq!(pot.cost_basis().balance(&btc), dec("0.5"));
        let lot = pot.cost_basis().lots(&btc).next().unwrap();
        assert_eq!(lot.unit_cost, dec("250"));

        // The profit currency itself is never pooled.
        assert_eq!(pot.cost_basis().balance(&Asset::from("EUR")), Decimal::ZERO);
        assert!(pot.warnings().is_empty());
    }

    // An ignored event changes nothing, not even the warning list: disposing 0.5 BTC with no
    // lots would otherwise record a shortfall.
    #[test]
    #[traced_test]
    fn test_ignored_event_is_inert() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[]);
        let mut settings = eur_settings(DAY0, DAY0 + 10 * DAY);
        settings.ignored = HashMap::from([(
            ActionType::Trade,
            HashSet::from(["trade-1".to_string()]),
        )]);
        let mut pot = new_pot(settings, &prices);

        pot.process([AccountingEvent::Trade(Trade {
            identifier: "trade-1".to_string(),
            timestamp: at(DAY0 + 100),
            pair: TradePair::from("BTC_EUR"),
            trade_type: TradeType::Sell,
            amount: dec("0.5"),
            rate: dec("300"),
            fee: None,
            fee_asset: None,
        })])
        .unwrap();

        assert_eq!(pot.pnls().iter().count(), 0);
        assert_eq!(pot.cost_basis().balance(&Asset::from("BTC")), Decimal::ZERO);
        assert!(pot.warnings().is_empty());
        assert_eq!(pot.events_consumed(), 1);
        assert_eq!(pot.steps(), 0);
    }

    // A swap group is one exchange: the disposal is priced at the received leg's acquisition
    // value, and consumption accounting shows N - (k - 1) steps.
    #[test]
    #[traced_test]
    fn test_swap_multitake() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("TOK-B", &[(DAY0 + DAY, "6")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            income("income-1", DAY0 + 10, "TOK-A", "10", "2"),
            tx_event(
                "0xswap",
                "0xswap-1",
                DAY0 + DAY + 10,
                HistoryEventType::Trade,
                HistoryEventSubType::Spend,
                Some("uniswap-v2"),
                "TOK-A",
                "10",
            ),
            tx_event(
                "0xswap",
                "0xswap-2",
                DAY0 + DAY + 10,
                HistoryEventType::Trade,
                HistoryEventSubType::Receive,
                Some("uniswap-v2"),
                "TOK-B",
                "4",
            ),
        ])
        .unwrap();

        // Swap value 4 * 6 EUR against a 10 * 2 EUR basis.
        assert_eq!(
            pot.pnls().get(AccountingEventType::TransactionEvent),
            Pnl::taxable(dec("4")),
        );
        assert_eq!(
            pot.pnls().get(AccountingEventType::LedgerAction),
            Pnl::taxable(dec("20")),
        );

        assert_eq!(pot.cost_basis().balance(&Asset::from("TOK-A")), Decimal::ZERO);
        let tok_b = Asset::from("TOK-B");
        assert_eq!(pot.cost_basis().balance(&tok_b), dec("4"));
        assert_eq!(pot.cost_basis().lots(&tok_b).next().unwrap().unit_cost, dec("6"));

        assert_eq!(pot.events_consumed(), 3);
        assert_eq!(pot.steps(), 2); // N - (k - 1)
        assert!(pot.warnings().is_empty());
    }

    // A truncated group updates neither leg.
    #[test]
    #[traced_test]
    fn test_truncated_multitake_is_atomic() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("TOK-B", &[(DAY0 + DAY, "6")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        let err = pot
            .process([
                income("income-1", DAY0 + 10, "TOK-A", "10", "2"),
                tx_event(
                    "0xswap",
                    "0xswap-1",
                    DAY0 + DAY + 10,
                    HistoryEventType::Trade,
                    HistoryEventSubType::Spend,
                    Some("uniswap-v2"),
                    "TOK-A",
                    "10",
                ),
            ])
            .unwrap_err();

        match err {
            ProcessError::TruncatedMultitake {
                identifier,
                expected,
                got,
                ..
            } => {
                assert_eq!(identifier, "0xswap-1");
                assert_eq!((expected, got), (2, 1));
            }
            other => panic!("Expected a truncated group, got {other}"),
        }

        // The spend leg was not applied.
        assert_eq!(pot.cost_basis().balance(&Asset::from("TOK-A")), dec("10"));
        assert_eq!(
            pot.pnls().get(AccountingEventType::TransactionEvent),
            Pnl::default(),
        );
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_stream_is_fatal() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        let err = pot
            .process([
                income("income-1", DAY0 + 100, "TOK-A", "1", "2"),
                income("income-2", DAY0 + 50, "TOK-A", "1", "2"),
            ])
            .unwrap_err();

        match err {
            ProcessError::OutOfOrderTimestamp {
                identifier,
                timestamp,
                previous,
                ..
            } => {
                assert_eq!(identifier, "income-2");
                assert_eq!(timestamp, at(DAY0 + 50));
                assert_eq!(previous, at(DAY0 + 100));
            }
            other => panic!("Expected an ordering violation, got {other}"),
        }
    }

    // Unclaimed on-chain interactions keep balances correct while contributing zero PnL.
    #[test]
    #[traced_test]
    fn test_conservative_default_for_unknown_events() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("TOK-C", &[(DAY0, "3")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            tx_event(
                "0xaaa",
                "0xaaa-1",
                DAY0 + 10,
                HistoryEventType::Receive,
                HistoryEventSubType::None,
                None,
                "TOK-C",
                "5",
            ),
            tx_event(
                "0xbbb",
                "0xbbb-1",
                DAY0 + 20,
                HistoryEventType::Spend,
                HistoryEventSubType::None,
                None,
                "TOK-C",
                "2",
            ),
        ])
        .unwrap();

        let tok_c = Asset::from("TOK-C");
        assert_eq!(pot.cost_basis().balance(&tok_c), dec("3"));
        assert_eq!(pot.cost_basis().lots(&tok_c).next().unwrap().unit_cost, dec("3"));
        assert_eq!(pot.pnls().iter().count(), 0);
        assert!(pot.pnls().overview().is_empty());
        assert!(pot.warnings().is_empty());
    }

    // A disposal without a price still reduces the ledger; only its PnL is skipped.
    #[test]
    #[traced_test]
    fn test_missing_price_keeps_balances_correct() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            income("income-1", DAY0 + 10, "TOK-D", "2", "2"),
            ledger_action(
                "loss-1",
                DAY0 + 20,
                LedgerActionType::Loss,
                "TOK-D",
                "1",
                None,
                None,
            ),
        ])
        .unwrap();

        assert_eq!(pot.cost_basis().balance(&Asset::from("TOK-D")), dec("1"));
        assert_eq!(
            pot.pnls().get(AccountingEventType::LedgerAction),
            Pnl::taxable(dec("4")),
        );

        match pot.warnings() {
            [ProcessingWarning::MissingPrice { identifier, .. }] => {
                assert_eq!(identifier, "loss-1");
            }
            other => panic!("Expected one missing-price warning, got {other:?}"),
        }
    }

    #[test]
    #[traced_test]
    fn test_margin_position_profit_and_loss() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("USD", &[(DAY0, "0.9")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            AccountingEvent::MarginPosition(MarginPosition {
                identifier: "margin-1".to_string(),
                timestamp: at(DAY0 + 10),
                profit_loss: dec("100"),
                pl_currency: Asset::from("USD"),
            }),
            AccountingEvent::MarginPosition(MarginPosition {
                identifier: "margin-2".to_string(),
                timestamp: at(DAY0 + 20),
                profit_loss: dec("-50"),
                pl_currency: Asset::from("USD"),
            }),
        ])
        .unwrap();

        // +100 * 0.9 profit, then -50 * 0.9 loss.
        assert_eq!(
            pot.pnls().get(AccountingEventType::MarginPosition),
            Pnl::taxable(dec("45")),
        );
        assert_eq!(pot.cost_basis().balance(&Asset::from("USD")), dec("50"));
        assert!(pot.warnings().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_staking_income_and_movement_fee() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("ETH", &[(DAY0, "10")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            AccountingEvent::Staking(StakingEvent {
                identifier: "staking-1".to_string(),
                timestamp: at(DAY0 + 10),
                asset: Asset::from("ETH"),
                amount: dec("1"),
            }),
            AccountingEvent::AssetMovement(AssetMovement {
                identifier: "withdrawal-1".to_string(),
                timestamp: at(DAY0 + 20),
                kind: MovementKind::Withdrawal,
                asset: Asset::from("ETH"),
                amount: dec("0.5"),
                fee: dec("0.1"),
            }),
        ])
        .unwrap();

        assert_eq!(
            pot.pnls().get(AccountingEventType::Staking),
            Pnl::taxable(dec("10")),
        );
        assert_eq!(
            pot.pnls().get(AccountingEventType::AssetMovement),
            Pnl::taxable(dec("-1")),
        );
        assert_eq!(pot.cost_basis().balance(&Asset::from("ETH")), dec("0.9"));
    }

    // A bad event is skipped with a warning; accounting continues.
    #[test]
    #[traced_test]
    fn test_unresolvable_asset_skips_event() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            AccountingEvent::Trade(Trade {
                identifier: "trade-bad".to_string(),
                timestamp: at(DAY0 + 10),
                pair: TradePair::from("BTCEUR"),
                trade_type: TradeType::Sell,
                amount: dec("1"),
                rate: dec("300"),
                fee: None,
                fee_asset: None,
            }),
            income("income-1", DAY0 + 20, "BTC", "1", "250"),
        ])
        .unwrap();

        match pot.warnings() {
            [ProcessingWarning::UnresolvableAsset { identifier, .. }] => {
                assert_eq!(identifier, "trade-bad");
            }
            other => panic!("Expected one unresolvable-asset warning, got {other:?}"),
        }
        assert_eq!(pot.cost_basis().balance(&Asset::from("BTC")), dec("1"));
        assert_eq!(
            pot.pnls().get(AccountingEventType::LedgerAction),
            Pnl::taxable(dec("250")),
        );
        assert_eq!(pot.events_consumed(), 2);
        assert_eq!(pot.steps(), 1);
    }

    // Gas disposes the fee asset and nets out to the basis of the spent fuel.
    #[test]
    #[traced_test]
    fn test_gas_fee_accounting() {
        let _ = tracing_log::LogTracer::init();

        let prices = price_table(&[("ETH", &[(DAY0, "10")])]);
        let mut pot = new_pot(eur_settings(DAY0, DAY0 + 10 * DAY), &prices);

        pot.process([
            income("income-1", DAY0 + 10, "ETH", "1", "10"),
            tx_event(
                "0xgas",
                "0xgas-0",
                DAY0 + 20,
                HistoryEventType::Spend,
                HistoryEventSubType::Fee,
                Some("gas"),
                "ETH",
                "0.01",
            ),
        ])
        .unwrap();

        assert_eq!(
            pot.pnls().get(AccountingEventType::TransactionEvent),
            Pnl::taxable(dec("-0.1")),
        );
        assert_eq!(pot.cost_basis().balance(&Asset::from("ETH")), dec("0.99"));
        assert!(pot.warnings().is_empty());
    }
}

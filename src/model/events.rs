use crate::model::asset::{Asset, AssetError, TradePair};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

// Overview labels for the PnL report. Categories without a label fold into `OVR_OTHER`.
pub const OVR_TRADE_PNL: &str = "trade";
pub const OVR_ASSET_MOVEMENTS_FEES: &str = "asset movement fee";
pub const OVR_MARGIN_PNL: &str = "margin position";
pub const OVR_LOAN_PROFIT: &str = "loan profit";
pub const OVR_LEDGER_ACTIONS_PNL: &str = "ledger action";
pub const OVR_STAKING: &str = "staking";
pub const OVR_OTHER: &str = "other";

/// The accounting category of an event. Fixed per event kind.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub enum AccountingEventType {
    Trade,
    AssetMovement,
    MarginPosition,
    Loan,
    PreforkAcquisition,
    LedgerAction,
    Staking,
    HistoryBaseEntry,
    TransactionEvent,
}

impl AccountingEventType {
    /// Turn the category into its PnL overview label.
    ///
    /// Categories without an explicit mapping report under `"other"`; new categories need no
    /// registry changes elsewhere.
    pub fn to_overview_label(self) -> &'static str {
        match self {
            Self::Trade => OVR_TRADE_PNL,
            Self::AssetMovement => OVR_ASSET_MOVEMENTS_FEES,
            Self::MarginPosition => OVR_MARGIN_PNL,
            Self::Loan => OVR_LOAN_PROFIT,
            Self::LedgerAction => OVR_LEDGER_ACTIONS_PNL,
            Self::Staking => OVR_STAKING,
            _ => OVR_OTHER,
        }
    }
}

impl Display for AccountingEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trade => "trade",
            Self::AssetMovement => "asset movement",
            Self::MarginPosition => "margin position",
            Self::Loan => "loan",
            Self::PreforkAcquisition => "prefork acquisition",
            Self::LedgerAction => "ledger action",
            Self::Staking => "staking",
            Self::HistoryBaseEntry => "history base entry",
            Self::TransactionEvent => "transaction event",
        })
    }
}

/// Partitions of the per-run ignore set. Events whose kind has no partition cannot be ignored.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum ActionType {
    Trade,
    AssetMovement,
    LedgerAction,
    HistoryEvent,
    EvmTransaction,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TradeType {
    Buy,
    Sell,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum MovementKind {
    Deposit,
    Withdrawal,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum LedgerActionType {
    Income,
    Expense,
    Loss,
    DividendsIncome,
    DonationReceived,
    Airdrop,
    Gift,
    Grant,
}

impl LedgerActionType {
    /// Whether the action brings assets in (acquisition) rather than spending them.
    pub fn is_profitable(self) -> bool {
        !matches!(self, Self::Expense | Self::Loss)
    }
}

/// Base type of a decoded history or on-chain event.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum HistoryEventType {
    Trade,
    Spend,
    Receive,
    Deposit,
    Withdrawal,
    Staking,
    Transfer,
    Informational,
}

impl HistoryEventType {
    pub fn direction(self) -> EventDirection {
        match self {
            Self::Trade | Self::Spend | Self::Deposit => EventDirection::Out,
            Self::Receive | Self::Withdrawal | Self::Staking => EventDirection::In,
            Self::Transfer | Self::Informational => EventDirection::Neutral,
        }
    }
}

impl Display for HistoryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trade => "trade",
            Self::Spend => "spend",
            Self::Receive => "receive",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Staking => "staking",
            Self::Transfer => "transfer",
            Self::Informational => "informational",
        })
    }
}

/// Refinement of [`HistoryEventType`] describing what the moved amount represents.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum HistoryEventSubType {
    None,
    Fee,
    Spend,
    Receive,
    Reward,
    DepositAsset,
    RemoveAsset,
    ReceiveWrapped,
    ReturnWrapped,
    Airdrop,
    Approve,
}

impl Display for HistoryEventSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Fee => "fee",
            Self::Spend => "spend",
            Self::Receive => "receive",
            Self::Reward => "reward",
            Self::DepositAsset => "deposit asset",
            Self::RemoveAsset => "remove asset",
            Self::ReceiveWrapped => "receive wrapped",
            Self::ReturnWrapped => "return wrapped",
            Self::Airdrop => "airdrop",
            Self::Approve => "approve",
        })
    }
}

/// Which way assets move for an event kind, seen from the user's side.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventDirection {
    In,
    Out,
    Neutral,
}

/// Composite key matching decoded events to interpretation rules.
///
/// A key may be registered with or without a counterparty tag; resolution prefers the tagged
/// form and falls back to the untagged one.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct TxEventTypeKey {
    pub event_type: HistoryEventType,
    pub event_subtype: HistoryEventSubType,
    pub counterparty: Option<String>,
}

impl TxEventTypeKey {
    pub fn new(event_type: HistoryEventType, event_subtype: HistoryEventSubType) -> Self {
        Self {
            event_type,
            event_subtype,
            counterparty: None,
        }
    }

    pub fn with_counterparty(
        event_type: HistoryEventType,
        event_subtype: HistoryEventSubType,
        counterparty: &str,
    ) -> Self {
        Self {
            event_type,
            event_subtype,
            counterparty: Some(counterparty.to_string()),
        }
    }

    pub(crate) fn without_counterparty(&self) -> Self {
        Self {
            event_type: self.event_type,
            event_subtype: self.event_subtype,
            counterparty: None,
        }
    }
}

impl Display for TxEventTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_type, self.event_subtype)?;
        if let Some(counterparty) = &self.counterparty {
            write!(f, "/{counterparty}")?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Trade {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub pair: TradePair,
    pub trade_type: TradeType,
    /// Amount of the base asset bought or sold.
    pub amount: Decimal,
    /// Price in quote asset per unit of base asset.
    pub rate: Decimal,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<Asset>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AssetMovement {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MovementKind,
    pub asset: Asset,
    pub amount: Decimal,
    /// Fee charged by the exchange, in the moved asset.
    pub fee: Decimal,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MarginPosition {
    pub identifier: String,
    /// Close time of the position.
    pub timestamp: DateTime<Utc>,
    /// Signed realized profit or loss, in `pl_currency`.
    pub profit_loss: Decimal,
    pub pl_currency: Asset,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Loan {
    pub identifier: String,
    /// Close time of the loan.
    pub timestamp: DateTime<Utc>,
    pub asset: Asset,
    pub earned: Decimal,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PreforkAcquisition {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub asset: Asset,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LedgerAction {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: LedgerActionType,
    pub asset: Asset,
    pub amount: Decimal,
    /// Explicit rate overriding the price oracle, denominated in `rate_asset`
    /// (profit currency when `rate_asset` is `None`).
    pub rate: Option<Decimal>,
    pub rate_asset: Option<Asset>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StakingEvent {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub asset: Asset,
    pub amount: Decimal,
}

/// A decoded history entry: one asset movement with semantic type information.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HistoryEvent {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: HistoryEventType,
    pub event_subtype: HistoryEventSubType,
    pub counterparty: Option<String>,
    pub asset: Asset,
    pub amount: Decimal,
}

impl HistoryEvent {
    pub fn type_key(&self) -> TxEventTypeKey {
        TxEventTypeKey {
            event_type: self.event_type,
            event_subtype: self.event_subtype,
            counterparty: self.counterparty.clone(),
        }
    }
}

/// A [`HistoryEvent`] decoded from an on-chain transaction. Ignored by transaction hash.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TransactionEvent {
    pub tx_hash: String,
    pub event: HistoryEvent,
}

/// Everything the accounting loop can consume, one variant per event kind.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum AccountingEvent {
    Trade(Trade),
    AssetMovement(AssetMovement),
    MarginPosition(MarginPosition),
    Loan(Loan),
    PreforkAcquisition(PreforkAcquisition),
    LedgerAction(LedgerAction),
    Staking(StakingEvent),
    HistoryBaseEntry(HistoryEvent),
    TransactionEvent(TransactionEvent),
}

impl AccountingEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Trade(trade) => trade.timestamp,
            Self::AssetMovement(movement) => movement.timestamp,
            Self::MarginPosition(position) => position.timestamp,
            Self::Loan(loan) => loan.timestamp,
            Self::PreforkAcquisition(prefork) => prefork.timestamp,
            Self::LedgerAction(action) => action.timestamp,
            Self::Staking(staking) => staking.timestamp,
            Self::HistoryBaseEntry(entry) => entry.timestamp,
            Self::TransactionEvent(tx) => tx.event.timestamp,
        }
    }

    /// Unique identifier within the event kind's namespace.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Trade(trade) => &trade.identifier,
            Self::AssetMovement(movement) => &movement.identifier,
            Self::MarginPosition(position) => &position.identifier,
            Self::Loan(loan) => &loan.identifier,
            Self::PreforkAcquisition(prefork) => &prefork.identifier,
            Self::LedgerAction(action) => &action.identifier,
            Self::Staking(staking) => &staking.identifier,
            Self::HistoryBaseEntry(entry) => &entry.identifier,
            Self::TransactionEvent(tx) => &tx.event.identifier,
        }
    }

    /// The accounting category. Always the same value for a given variant.
    pub fn event_type(&self) -> AccountingEventType {
        match self {
            Self::Trade(_) => AccountingEventType::Trade,
            Self::AssetMovement(_) => AccountingEventType::AssetMovement,
            Self::MarginPosition(_) => AccountingEventType::MarginPosition,
            Self::Loan(_) => AccountingEventType::Loan,
            Self::PreforkAcquisition(_) => AccountingEventType::PreforkAcquisition,
            Self::LedgerAction(_) => AccountingEventType::LedgerAction,
            Self::Staking(_) => AccountingEventType::Staking,
            Self::HistoryBaseEntry(_) => AccountingEventType::HistoryBaseEntry,
            Self::TransactionEvent(_) => AccountingEventType::TransactionEvent,
        }
    }

    /// The ignore-set partition this event is matched against, if it can be ignored at all.
    pub fn action_type(&self) -> Option<ActionType> {
        match self {
            Self::Trade(_) => Some(ActionType::Trade),
            Self::AssetMovement(_) => Some(ActionType::AssetMovement),
            Self::LedgerAction(_) => Some(ActionType::LedgerAction),
            Self::HistoryBaseEntry(_) => Some(ActionType::HistoryEvent),
            Self::TransactionEvent(_) => Some(ActionType::EvmTransaction),
            Self::MarginPosition(_)
            | Self::Loan(_)
            | Self::PreforkAcquisition(_)
            | Self::Staking(_) => None,
        }
    }

    /// Whether the event is excluded from processing by the per-run ignore set.
    ///
    /// Transaction events are matched by their transaction hash so that one entry removes
    /// every decoded leg of the transaction.
    pub fn should_ignore(&self, ignored: &HashMap<ActionType, HashSet<String>>) -> bool {
        let Some(action_type) = self.action_type() else {
            return false;
        };
        let Some(identifiers) = ignored.get(&action_type) else {
            return false;
        };

        match self {
            Self::TransactionEvent(tx) => identifiers.contains(&tx.tx_hash),
            _ => identifiers.contains(self.identifier()),
        }
    }

    /// Resolve every asset the event touches.
    ///
    /// Failure here is a hard per-event condition: the caller records it and skips the event
    /// rather than aborting the run.
    pub fn involved_assets(&self) -> Result<Vec<Asset>, AssetError> {
        match self {
            Self::Trade(trade) => {
                let (base, quote) = trade.pair.assets()?;
                let mut assets = vec![base, quote];
                if let Some(fee_asset) = &trade.fee_asset {
                    assets.push(fee_asset.resolve()?);
                }
                Ok(assets)
            }
            Self::AssetMovement(movement) => Ok(vec![movement.asset.resolve()?]),
            Self::MarginPosition(position) => Ok(vec![position.pl_currency.resolve()?]),
            Self::Loan(loan) => Ok(vec![loan.asset.resolve()?]),
            Self::PreforkAcquisition(prefork) => Ok(vec![prefork.asset.resolve()?]),
            Self::LedgerAction(action) => {
                let mut assets = vec![action.asset.resolve()?];
                if let Some(rate_asset) = &action.rate_asset {
                    assets.push(rate_asset.resolve()?);
                }
                Ok(assets)
            }
            Self::Staking(staking) => Ok(vec![staking.asset.resolve()?]),
            Self::HistoryBaseEntry(entry) => Ok(vec![entry.asset.resolve()?]),
            Self::TransactionEvent(tx) => Ok(vec![tx.event.asset.resolve()?]),
        }
    }
}

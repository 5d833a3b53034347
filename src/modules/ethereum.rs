use crate::accounting::pot::RunSettings;
use crate::accounting::settings::{ModuleAccountant, TxEventSettings, TxMethod};
use crate::model::events::{HistoryEventSubType, HistoryEventType, TxEventTypeKey};
use std::collections::HashMap;

/// Counterparty tag the decoder attaches to transaction fee events.
pub const CPT_GAS: &str = "gas";

/// Base-chain rules: gas spent on transactions.
pub struct EthereumAccountant;

impl ModuleAccountant for EthereumAccountant {
    fn module_key(&self) -> &'static str {
        "ethereum"
    }

    fn event_settings(&self, _run: &RunSettings) -> HashMap<TxEventTypeKey, TxEventSettings> {
        HashMap::from([(
            TxEventTypeKey::with_counterparty(
                HistoryEventType::Spend,
                HistoryEventSubType::Fee,
                CPT_GAS,
            ),
            // Gas is gone in its entirety, and disposing the fee asset realizes its gain.
            TxEventSettings {
                taxable: true,
                count_entire_amount_spend: true,
                count_cost_basis_pnl: true,
                method: TxMethod::Spend,
                take: 1,
                multitake_treatment: None,
            },
        )])
    }
}

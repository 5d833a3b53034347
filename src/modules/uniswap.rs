use crate::accounting::pot::RunSettings;
use crate::accounting::settings::{
    ModuleAccountant, TxEventSettings, TxMethod, TxMultitakeTreatment,
};
use crate::model::events::{HistoryEventSubType, HistoryEventType, TxEventTypeKey};
use std::collections::HashMap;

pub const CPT_UNISWAP_V2: &str = "uniswap-v2";
pub const CPT_UNISWAP_V3: &str = "uniswap-v3";

/// Uniswap-style DEX: a swap is one taxable disposal spanning a spend leg and a receive leg.
pub struct UniswapAccountant;

impl ModuleAccountant for UniswapAccountant {
    fn module_key(&self) -> &'static str {
        "uniswap"
    }

    fn event_settings(&self, _run: &RunSettings) -> HashMap<TxEventTypeKey, TxEventSettings> {
        let swap = TxEventSettings {
            taxable: true,
            count_entire_amount_spend: false,
            count_cost_basis_pnl: true,
            method: TxMethod::Spend,
            take: 2,
            multitake_treatment: Some(TxMultitakeTreatment::Swap),
        };

        [CPT_UNISWAP_V2, CPT_UNISWAP_V3]
            .into_iter()
            .map(|counterparty| {
                (
                    TxEventTypeKey::with_counterparty(
                        HistoryEventType::Trade,
                        HistoryEventSubType::Spend,
                        counterparty,
                    ),
                    swap.clone(),
                )
            })
            .collect()
    }
}

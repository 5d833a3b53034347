use crate::accounting::pot::RunSettings;
use crate::accounting::settings::{
    ModuleAccountant, TxEventSettings, TxMethod, TxMultitakeTreatment,
};
use crate::model::events::{HistoryEventSubType, HistoryEventType, TxEventTypeKey};
use std::collections::HashMap;

pub const CPT_COMPOUND: &str = "compound";

/// Compound-style lending: deposits and withdrawals are wrapped-token swaps, reward claims
/// are taxable income.
pub struct CompoundAccountant;

impl ModuleAccountant for CompoundAccountant {
    fn module_key(&self) -> &'static str {
        "compound"
    }

    fn event_settings(&self, _run: &RunSettings) -> HashMap<TxEventTypeKey, TxEventSettings> {
        let wrap_swap = TxEventSettings {
            taxable: false,
            count_entire_amount_spend: false,
            count_cost_basis_pnl: false,
            method: TxMethod::Spend,
            take: 2,
            multitake_treatment: Some(TxMultitakeTreatment::Swap),
        };

        HashMap::from([
            // Returning the wrapped token for the underlying asset.
            (
                TxEventTypeKey::with_counterparty(
                    HistoryEventType::Spend,
                    HistoryEventSubType::ReturnWrapped,
                    CPT_COMPOUND,
                ),
                wrap_swap.clone(),
            ),
            // Depositing the underlying asset for the wrapped token.
            (
                TxEventTypeKey::with_counterparty(
                    HistoryEventType::Deposit,
                    HistoryEventSubType::DepositAsset,
                    CPT_COMPOUND,
                ),
                wrap_swap,
            ),
            (
                TxEventTypeKey::with_counterparty(
                    HistoryEventType::Receive,
                    HistoryEventSubType::Reward,
                    CPT_COMPOUND,
                ),
                TxEventSettings {
                    taxable: true,
                    count_entire_amount_spend: false,
                    count_cost_basis_pnl: false,
                    method: TxMethod::Acquisition,
                    take: 1,
                    multitake_treatment: None,
                },
            ),
        ])
    }
}

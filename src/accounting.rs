pub use self::cost_basis::{CostBasisLedger, Disposal, Lot};
pub use self::pnl::{Pnl, PnlTotals};
pub use self::pot::{AccountingPot, ProcessError, ProcessingWarning, RunSettings};
pub use self::settings::{
    ModuleAccountant, ModuleSettingsRegistry, SettingsError, TxEventRules, TxEventSettings,
    TxMethod, TxMultitakeTreatment,
};

pub(crate) mod cost_basis;
pub(crate) mod pnl;
pub(crate) mod pot;
pub(crate) mod settings;

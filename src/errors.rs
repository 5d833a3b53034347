//! Central re-exports of every public error type.

pub use crate::accounting::pot::{ProcessError, ProcessingWarning};
pub use crate::accounting::settings::SettingsError;
pub use crate::model::asset::AssetError;
pub use crate::model::price::{PriceError, PriceTableError};

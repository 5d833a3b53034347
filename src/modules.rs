//! Built-in per-protocol accounting modules.
//!
//! Each module contributes a table of interpretation rules for the decoded events its
//! protocol emits. Custom modules implement [`ModuleAccountant`] and register through
//! [`ModuleSettingsRegistry::register`].
//!
//! [`ModuleAccountant`]: crate::accounting::ModuleAccountant
//! [`ModuleSettingsRegistry::register`]: crate::accounting::ModuleSettingsRegistry::register

pub use self::{compound::*, ethereum::*, uniswap::*};

pub(crate) mod compound;
pub(crate) mod ethereum;
pub(crate) mod uniswap;

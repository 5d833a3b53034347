pub use self::{asset::*, events::*, price::*};

pub(crate) mod asset;
pub(crate) mod events;
pub(crate) mod price;

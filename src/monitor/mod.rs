//! Link supervision loop

mod interface;
mod keeper;

pub use interface::InterfaceState;
pub use keeper::{Keeper, Mode};

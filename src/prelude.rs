pub use common_failures::prelude::*;
pub use failure::bail;

pub use crate::types::{BlockHeight, BlockInfo, Utxo};

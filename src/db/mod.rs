use crate::prelude::*;

pub mod pg;

/// A bulk-load transactional store for blocks and utxo snapshot entries.
pub trait Store {
    /// Queue a block for ingestion; may block on back-pressure.
    fn write_block_info(&self, bi: BlockInfo) -> Result<()>;
    /// Queue a utxo snapshot entry; may block on back-pressure.
    fn write_utxo(&self, u: Utxo) -> Result<()>;
    /// Greatest persisted height, -1 when the store is empty.
    fn last_height(&mut self) -> Result<BlockHeight>;
    /// Close both inputs and wait for the pipeline, fixup included.
    fn close(&mut self);
}

//! Records exchanged with the external block and utxo snapshot readers.

use bitcoin::{Block, Txid};

pub type BlockHeight = i32;

/// A parsed block plus the reader-side bookkeeping persisted next to it.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block: Block,
    pub height: BlockHeight,
    pub status: i32,
    pub filen: i32,
    pub filepos: i32,
}

/// One entry of a utxo set snapshot.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub txid: Txid,
    pub n: u32,
    pub height: BlockHeight,
    pub coinbase: bool,
    pub value: i64,
    pub scriptpubkey: Vec<u8>,
}

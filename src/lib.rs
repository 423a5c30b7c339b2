//! Bulk loader persisting the bitcoin chain and utxo snapshots into Postgres.
//!
//! The write path is a channel-coupled pipeline: a coordinator assigns
//! surrogate ids, dedupes transactions through a bounded txid cache and fans
//! records out to per-table COPY writer threads. The load deliberately
//! relaxes integrity for throughput; the fixup phase that runs once the
//! pipeline drains restores it (indexes, constraints, prevout back-fill,
//! utxo linking, orphan marking).

pub mod cache;
pub mod db;
pub mod opts;
pub mod prelude;
pub mod types;

pub use crate::types::{BlockHeight, BlockInfo, Utxo};

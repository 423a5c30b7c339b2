//! Postgres bitcoin bulk loader
//!
//! ## Loading strategy
//!
//! An initial load of the whole chain has to be fast for the loader to be
//! practical, so integrity takes a back seat until the data is in:
//!
//! * rows stream through `COPY ... FROM STDIN BINARY`, one transaction per
//!   stream, one writer thread per table
//! * on a fresh database the tables are created bare; every primary key,
//!   index and foreign key waits until the fixup phase after the load
//! * on a populated database the constraints already exist, so the
//!   coordinator hands a rendezvous channel to each block and tx record and
//!   waits for the commit confirmation before sending any children
//!
//! ## Integers
//!
//! Most integers in bitcoin structures are u32 and Postgres has no unsigned
//! types. Rather than widening everything to BIGINT, u32 fields are stored
//! bit-preserving in INT columns, so 0xFFFFFFFF reads back as -1.
//! Comparisons on the load path stay in the unsigned domain.

use log::{debug, error, info, warn};

use super::Store;
use crate::cache::TxIdCache;
use crate::prelude::*;

use bitcoin::{hashes::Hash, Block, BlockHash, BlockHeader, Transaction, Txid};
use crossbeam_channel::{bounded, Receiver, Sender};
use itertools::Itertools;
use postgres::error::SqlState;
use rayon::prelude::*;
use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// shorter `postgres` crate import names to just `pg::X`
mod pg {
    pub use postgres::{
        binary_copy::BinaryCopyInWriter,
        types::{ToSql, Type},
        Client, Transaction,
    };
}

type SyncSender = Sender<()>;

/// The vout marker of a coinbase input; such inputs have no real prevout.
const COINBASE_VOUT: u32 = 0xffff_ffff;

/// Data channels between the coordinator and the writers.
const CHANNEL_CAPACITY: usize = 64;

/// How often the deferred mode cuts a commit, in blocks.
const COMMIT_EVERY_BLOCKS: i32 = 50;

const REPORT_EVERY: Duration = Duration::from_secs(5);

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        msg.push_str("; caused by: ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Connect to the store, retrying with backoff until the server accepts us.
///
/// Expected url shape: postgres://user@host:5432/db
pub fn establish_connection(url: &str) -> pg::Client {
    match url::Url::parse(url) {
        Ok(u) => info!(
            "PG connect target: host={:?} port={:?} db={} user={}",
            u.host_str(),
            u.port_or_known_default(),
            u.path().trim_start_matches('/'),
            u.username()
        ),
        Err(e) => warn!("PG connect target: failed to parse URL: {}", e),
    }

    let mut backoff = Duration::from_millis(250);
    loop {
        match pg::Client::connect(url, postgres::NoTls) {
            Ok(client) => return client,
            Err(e) => {
                warn!("Error connecting to PG: {}", error_chain(&e));
                thread::sleep(backoff);
                let next_ms = (backoff.as_millis() as u64).saturating_mul(2).min(30_000);
                backoff = Duration::from_millis(next_ms);
            }
        }
    }
}

// TODO: fail the whole pipeline instead of leaving it to starve
fn fn_log_err<F>(name: &'static str, mut f: F) -> impl FnMut() -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    move || {
        let res = f();
        if let Err(ref e) = res {
            error!(
                "{} finished with an error: {}",
                name,
                e.display_causes_and_backtrace()
            );
        }
        res
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Mode {
    /// Fresh schema; indexes and constraints wait until fixup, writers
    /// stream freely and commits are cut every `COMMIT_EVERY_BLOCKS`.
    Deferred,
    /// The schema already existed, so foreign keys are live and every child
    /// row has to wait for its parent's commit.
    Synchronous,
}

impl Mode {
    fn is_deferred(self) -> bool {
        self == Mode::Deferred
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Mode::Deferred => "deferred",
            Mode::Synchronous => "synchronous",
        })
    }
}

struct BlockRec {
    id: i32,
    height: BlockHeight,
    hash: BlockHash,
    header: BlockHeader,
    status: i32,
    filen: i32,
    filepos: i32,
    sync: Option<SyncSender>,
}

struct TxRec {
    id: i64,
    block_id: i32,
    n: i32,
    txid: Txid,
    version: i32,
    lock_time: u32,
    /// Already seen; the tx row exists under `id` and only block_txs is new.
    dupe: bool,
    sync: Option<SyncSender>,
}

struct TxInRec {
    tx_id: i64,
    n: i32,
    tx: Arc<Transaction>,
}

struct TxOutRec {
    tx_id: i64,
    n: i32,
    tx: Arc<Transaction>,
}

const BLOCK_COLS: &[&str] = &[
    "id",
    "height",
    "hash",
    "version",
    "prevhash",
    "merkleroot",
    "time",
    "bits",
    "nonce",
    "orphan",
    "status",
    "filen",
    "filepos",
];
const TX_COLS: &[&str] = &["id", "txid", "version", "locktime"];
const BLOCK_TX_COLS: &[&str] = &["block_id", "n", "tx_id"];
const TXIN_COLS: &[&str] = &[
    "tx_id",
    "n",
    "prevout_hash",
    "prevout_n",
    "scriptsig",
    "sequence",
    "witness",
    "prevout_tx_id",
];
const TXOUT_COLS: &[&str] = &["tx_id", "n", "value", "scriptpubkey"];
const UTXO_COLS: &[&str] = &["txid", "n", "height", "coinbase", "value", "scriptpubkey"];

fn copy_statement(table: &str, cols: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN BINARY",
        table,
        cols.iter().join(", ")
    )
}

/// Open a bulk-load stream: a binary COPY against a single table with a
/// fixed column list, living inside the supplied transaction.
fn begin<'a>(
    txn: &'a mut pg::Transaction<'_>,
    table: &str,
    cols: &[&str],
    types: &[pg::Type],
) -> Result<pg::BinaryCopyInWriter<'a>> {
    let copy = copy_statement(table, cols);
    let sink = txn.copy_in(copy.as_str())?;
    Ok(pg::BinaryCopyInWriter::new(sink, types))
}

fn send<T>(ch: &Sender<T>, msg: T, what: &'static str) -> Result<()> {
    if ch.send(msg).is_err() {
        bail!("{} writer channel closed", what);
    }
    Ok(())
}

fn witness_bytes(txin: &bitcoin::TxIn) -> Option<Vec<u8>> {
    if txin.witness.is_empty() {
        None
    } else {
        Some(bitcoin::consensus::encode::serialize(&txin.witness))
    }
}

fn resolve_prevout(txin: &bitcoin::TxIn, cache: &TxIdCache) -> Option<i64> {
    if txin.previous_output.vout == COINBASE_VOUT {
        None
    } else {
        cache.check(&txin.previous_output.txid)
    }
}

fn block_writer(rx: &Receiver<Option<BlockRec>>, client: &mut pg::Client) -> Result<()> {
    let types = [
        pg::Type::INT4,
        pg::Type::INT4,
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::BYTEA,
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::INT4,
        pg::Type::INT4,
        pg::Type::BOOL,
        pg::Type::INT4,
        pg::Type::INT4,
        pg::Type::INT4,
    ];

    let mut disconnected = false;
    while !disconnected {
        let mut txn = client.transaction()?;
        let mut sync = None;
        {
            let mut w = begin(&mut txn, "blocks", BLOCK_COLS, &types)?;
            loop {
                match rx.recv() {
                    Ok(Some(br)) => {
                        let hash = br.hash.into_inner();
                        let prevhash = br.header.prev_blockhash.into_inner();
                        let merkleroot = br.header.merkle_root.into_inner();
                        if let Err(e) = w.write(&[
                            &br.id,
                            &br.height,
                            &&hash[..],
                            &br.header.version,
                            &&prevhash[..],
                            &&merkleroot[..],
                            &(br.header.time as i32),
                            &(br.header.bits as i32),
                            &(br.header.nonce as i32),
                            &false,
                            &br.status,
                            &br.filen,
                            &br.filepos,
                        ]) {
                            error!("blocks append error: {}", e);
                        }
                        if br.sync.is_some() {
                            sync = br.sync;
                            break;
                        }
                    }
                    Ok(None) => break, // commit signal
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Err(e) = w.finish() {
                error!("blocks copy finish error: {}", e);
            }
        }
        if let Err(e) = txn.commit() {
            error!("blocks commit error: {}", e);
        }
        if let Some(s) = sync {
            let _ = s.send(());
        }
    }

    debug!("block writer channel closed, leaving");
    Ok(())
}

/// Streams both `txs` and `block_txs`; two tables means two connections,
/// since a connection can carry only one COPY at a time.
fn tx_writer(
    rx: &Receiver<Option<TxRec>>,
    tx_client: &mut pg::Client,
    bt_client: &mut pg::Client,
) -> Result<()> {
    let tx_types = [
        pg::Type::INT8,
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::INT4,
    ];
    let bt_types = [pg::Type::INT4, pg::Type::INT4, pg::Type::INT8];

    let mut disconnected = false;
    while !disconnected {
        let mut txn = tx_client.transaction()?;
        let mut btxn = bt_client.transaction()?;
        let mut sync = None;
        {
            let mut tw = begin(&mut txn, "txs", TX_COLS, &tx_types)?;
            let mut bw = begin(&mut btxn, "block_txs", BLOCK_TX_COLS, &bt_types)?;
            loop {
                match rx.recv() {
                    Ok(Some(tr)) => {
                        if !tr.dupe {
                            let txid = tr.txid.into_inner();
                            if let Err(e) = tw.write(&[
                                &tr.id,
                                &&txid[..],
                                &tr.version,
                                &(tr.lock_time as i32),
                            ]) {
                                error!("txs append error: {}", e);
                            }
                            // A resumed load with a cold cache can still hit
                            // an early-chain duplicate txid here; the unique
                            // txid index rejects it at commit and the load
                            // goes on.
                        }
                        if let Err(e) = bw.write(&[&tr.block_id, &tr.n, &tr.id]) {
                            error!("block_txs append error: {}", e);
                        }
                        if tr.sync.is_some() {
                            sync = tr.sync;
                            break;
                        }
                    }
                    Ok(None) => break, // commit signal
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Err(e) = tw.finish() {
                error!("txs copy finish error: {}", e);
            }
            if let Err(e) = bw.finish() {
                error!("block_txs copy finish error: {}", e);
            }
        }
        if let Err(e) = txn.commit() {
            error!("txs commit error: {}", e);
        }
        if let Err(e) = btxn.commit() {
            error!("block_txs commit error: {}", e);
        }
        if let Some(s) = sync {
            let _ = s.send(());
        }
    }

    debug!("tx writer channel closed, leaving");
    Ok(())
}

fn txin_writer(
    rx: &Receiver<Option<TxInRec>>,
    client: &mut pg::Client,
    cache: &TxIdCache,
) -> Result<()> {
    let types = [
        pg::Type::INT8,
        pg::Type::INT4,
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::BYTEA,
        pg::Type::INT8,
    ];

    let mut disconnected = false;
    while !disconnected {
        let mut txn = client.transaction()?;
        {
            let mut w = begin(&mut txn, "txins", TXIN_COLS, &types)?;
            loop {
                match rx.recv() {
                    Ok(Some(ir)) => {
                        let txin = &ir.tx.input[ir.n as usize];
                        let prevout_hash = txin.previous_output.txid.into_inner();
                        let witness = witness_bytes(txin);
                        let prevout_tx_id = resolve_prevout(txin, cache);
                        if let Err(e) = w.write(&[
                            &ir.tx_id,
                            &ir.n,
                            &&prevout_hash[..],
                            &(txin.previous_output.vout as i32),
                            &txin.script_sig.as_bytes(),
                            &(txin.sequence.0 as i32),
                            &witness,
                            &prevout_tx_id,
                        ]) {
                            error!("txins append error: {}", e);
                        }
                    }
                    Ok(None) => break, // commit signal
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Err(e) = w.finish() {
                error!("txins copy finish error: {}", e);
            }
        }
        if let Err(e) = txn.commit() {
            error!("txins commit error: {}", e);
        }
    }

    debug!("txin writer channel closed, leaving");
    Ok(())
}

fn txout_writer(rx: &Receiver<Option<TxOutRec>>, client: &mut pg::Client) -> Result<()> {
    let types = [
        pg::Type::INT8,
        pg::Type::INT4,
        pg::Type::INT8,
        pg::Type::BYTEA,
    ];

    let mut disconnected = false;
    while !disconnected {
        let mut txn = client.transaction()?;
        {
            let mut w = begin(&mut txn, "txouts", TXOUT_COLS, &types)?;
            loop {
                match rx.recv() {
                    Ok(Some(or)) => {
                        let txout = &or.tx.output[or.n as usize];
                        if let Err(e) = w.write(&[
                            &or.tx_id,
                            &or.n,
                            &(txout.value as i64),
                            &txout.script_pubkey.as_bytes(),
                        ]) {
                            error!("txouts append error: {}", e);
                        }
                    }
                    Ok(None) => break, // commit signal
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Err(e) = w.finish() {
                error!("txouts copy finish error: {}", e);
            }
        }
        if let Err(e) = txn.commit() {
            error!("txouts commit error: {}", e);
        }
    }

    debug!("txout writer channel closed, leaving");
    Ok(())
}

/// Independent of the block pipeline: fed straight from the snapshot reader.
fn utxo_writer(rx: &Receiver<Option<Utxo>>, client: &mut pg::Client) -> Result<()> {
    let types = [
        pg::Type::BYTEA,
        pg::Type::INT4,
        pg::Type::INT4,
        pg::Type::BOOL,
        pg::Type::INT8,
        pg::Type::BYTEA,
    ];

    let mut count = 0u64;
    let start = Instant::now();
    let mut last_report = Instant::now();

    let mut disconnected = false;
    while !disconnected {
        let mut txn = client.transaction()?;
        {
            let mut w = begin(&mut txn, "utxos", UTXO_COLS, &types)?;
            loop {
                match rx.recv() {
                    Ok(Some(u)) => {
                        let txid = u.txid.into_inner();
                        if let Err(e) = w.write(&[
                            &&txid[..],
                            &(u.n as i32),
                            &u.height,
                            &u.coinbase,
                            &u.value,
                            &u.scriptpubkey,
                        ]) {
                            error!("utxos append error: {}", e);
                        }
                        count += 1;
                        if last_report.elapsed() > REPORT_EVERY {
                            info!(
                                "UTXOs: {} rows/s: {:.2}",
                                count,
                                count as f64 / start.elapsed().as_secs_f64()
                            );
                            last_report = Instant::now();
                        }
                    }
                    Ok(None) => break, // commit signal
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Err(e) = w.finish() {
                error!("utxos copy finish error: {}", e);
            }
        }
        if let Err(e) = txn.commit() {
            error!("utxos commit error: {}", e);
        }
    }

    debug!("utxo writer channel closed, leaving");
    Ok(())
}

fn last_block_row(conn: &mut pg::Client) -> Result<(i32, BlockHeight, Option<Vec<u8>>)> {
    let row = conn.query_opt(
        "SELECT id, height, hash FROM blocks ORDER BY height DESC LIMIT 1",
        &[],
    )?;
    Ok(match row {
        Some(row) => (row.get(0), row.get(1), Some(row.get(2))),
        // initial height is -1 so that the first block lands at height 0
        None => (0, -1, None),
    })
}

fn last_tx_id(conn: &mut pg::Client) -> Result<i64> {
    let row = conn.query_opt("SELECT id FROM txs ORDER BY id DESC LIMIT 1", &[])?;
    Ok(row.map(|r| r.get(0)).unwrap_or(0))
}

/// One rendezvous per record; the writer signals after it has committed.
fn rendezvous(mode: Mode) -> (Option<SyncSender>, Option<Receiver<()>>) {
    if mode.is_deferred() {
        (None, None)
    } else {
        let (s, r) = bounded(0);
        (Some(s), Some(r))
    }
}

/// The coordinator: consumes the block stream, assigns ids, dedupes txs and
/// fans records out to the writers; once the stream closes it joins the
/// writers and runs the fixup sequence.
fn block_worker(rx: &Receiver<BlockInfo>, url: &str, mode: Mode, cache_size: usize) -> Result<()> {
    let mut conn = establish_connection(url);

    let (mut bid, _, last_hash) = match last_block_row(&mut conn) {
        Ok(v) => v,
        Err(e) => bail!("resume: last block id and hash: {}", e),
    };
    let mut last_tx = match last_tx_id(&mut conn) {
        Ok(v) => v,
        Err(e) => bail!("resume: last tx id: {}", e),
    };
    let skip_to = match last_hash {
        Some(bytes) => match BlockHash::from_slice(&bytes) {
            Ok(hash) => Some(hash),
            Err(_) => bail!("resume: stored last hash {} is invalid", hex::encode(&bytes)),
        },
        None => None,
    };

    let cache = Arc::new(TxIdCache::new(cache_size));

    let (block_tx, block_rx) = bounded::<Option<BlockRec>>(CHANNEL_CAPACITY);
    let (tx_tx, tx_rx) = bounded::<Option<TxRec>>(CHANNEL_CAPACITY);
    let (txin_tx, txin_rx) = bounded::<Option<TxInRec>>(CHANNEL_CAPACITY);
    let (txout_tx, txout_rx) = bounded::<Option<TxOutRec>>(CHANNEL_CAPACITY);

    let mut workers = Vec::new();
    {
        let mut c = establish_connection(url);
        workers.push(thread::spawn(fn_log_err("pg_block_writer", move || {
            block_writer(&block_rx, &mut c)
        })));
    }
    {
        let mut tc = establish_connection(url);
        let mut bc = establish_connection(url);
        workers.push(thread::spawn(fn_log_err("pg_tx_writer", move || {
            tx_writer(&tx_rx, &mut tc, &mut bc)
        })));
    }
    {
        let mut c = establish_connection(url);
        let cache = cache.clone();
        workers.push(thread::spawn(fn_log_err("pg_txin_writer", move || {
            txin_writer(&txin_rx, &mut c, &cache)
        })));
    }
    {
        let mut c = establish_connection(url);
        workers.push(thread::spawn(fn_log_err("pg_txout_writer", move || {
            txout_writer(&txout_rx, &mut c)
        })));
    }

    if let Some(target) = skip_to {
        // Resuming: drain the input until we are past what is already
        // persisted. The matching block itself is skipped too.
        info!("Skipping to hash {}", target);
        let mut skipped = 0u64;
        let mut last_report = Instant::now();
        while let Ok(bi) = rx.recv() {
            if bi.block.block_hash() == target {
                break;
            }
            skipped += 1;
            if skipped % 10 == 0 && last_report.elapsed() > REPORT_EVERY {
                info!("Skipped {} blocks...", skipped);
                last_report = Instant::now();
            }
        }
        info!("Skipped {} total blocks.", skipped);
    }

    let mut txcnt = 0u64;
    let start = Instant::now();
    let mut last_report = Instant::now();

    while let Ok(bi) = rx.recv() {
        let BlockInfo {
            block,
            height,
            status,
            filen,
            filepos,
        } = bi;
        let Block { header, txdata } = block;
        let hash = header.block_hash();
        let txs: Vec<Arc<Transaction>> = txdata.into_iter().map(Arc::new).collect();
        // txid is a double sha256 over the whole tx and dominates the
        // coordinator's cpu time, so compute them for the block up front
        let txids: Vec<Txid> = txs.par_iter().map(|tx| tx.txid()).collect();

        bid += 1;
        let (sync, wait) = rendezvous(mode);
        send(
            &block_tx,
            Some(BlockRec {
                id: bid,
                height,
                hash,
                header,
                status,
                filen,
                filepos,
                sync,
            }),
            "block",
        )?;
        if let Some(wait) = wait {
            if wait.recv().is_err() {
                bail!("block writer dropped the commit handshake");
            }
        }

        for (n, tx) in txs.iter().enumerate() {
            last_tx += 1;
            txcnt += 1;
            let txid = txids[n];

            let recent_id = cache.add(txid, last_tx, tx.output.len() as u32);
            let dupe = recent_id != last_tx;

            let (sync, wait) = rendezvous(mode);
            send(
                &tx_tx,
                Some(TxRec {
                    id: recent_id,
                    block_id: bid,
                    n: n as i32,
                    txid,
                    version: tx.version,
                    lock_time: tx.lock_time.0,
                    dupe,
                    sync,
                }),
                "tx",
            )?;
            if let Some(wait) = wait {
                if wait.recv().is_err() {
                    bail!("tx writer dropped the commit handshake");
                }
            }

            if dupe {
                // the ins and outs were written with the first sighting
                continue;
            }

            for i in 0..tx.input.len() {
                send(
                    &txin_tx,
                    Some(TxInRec {
                        tx_id: last_tx,
                        n: i as i32,
                        tx: tx.clone(),
                    }),
                    "txin",
                )?;
            }
            for o in 0..tx.output.len() {
                send(
                    &txout_tx,
                    Some(TxOutRec {
                        tx_id: last_tx,
                        n: o as i32,
                        tx: tx.clone(),
                    }),
                    "txout",
                )?;
            }
        }

        if !mode.is_deferred() {
            // blocks and txs commit through the handshake; flush the rest
            // after every block so the foreign keys hold
            send(&txin_tx, None, "txin")?;
            send(&txout_tx, None, "txout")?;
        } else if bid % COMMIT_EVERY_BLOCKS == 0 {
            send(&block_tx, None, "block")?;
            send(&tx_tx, None, "tx")?;
            send(&txin_tx, None, "txin")?;
            send(&txout_tx, None, "txout")?;
        }

        if last_report.elapsed() > REPORT_EVERY {
            info!(
                "Height: {} Txs: {} Time: {} Tx/s: {:.2}",
                height,
                txcnt,
                header.time,
                txcnt as f64 / start.elapsed().as_secs_f64()
            );
            last_report = Instant::now();
        }
    }

    drop(block_tx);
    drop(txin_tx);
    drop(txout_tx);
    drop(tx_tx);

    info!("Closed db channels, waiting for writers to finish...");
    for handle in workers {
        // worker errors are already logged by fn_log_err
        if handle.join().is_err() {
            error!("writer thread panicked");
        }
    }
    info!("Writers finished.");

    let stats = cache.stats();
    info!(
        "Txid cache hits: {} ({:.2}%) misses: {} dupes: {} evictions: {}",
        stats.hits,
        stats.hits as f64 / ((stats.hits + stats.misses) as f64 + 0.0001) * 100.0,
        stats.misses,
        stats.dupes,
        stats.evictions
    );

    run_fixup(&mut conn, stats.misses > 0, 0, mode.is_deferred());
    Ok(())
}

fn create_tables(conn: &mut pg::Client) -> std::result::Result<(), postgres::Error> {
    conn.batch_execute(include_str!("pg/tables.sql"))
}

fn is_already_exists(e: &postgres::Error) -> bool {
    e.as_db_error()
        .map_or(false, |db| *db.code() == SqlState::DUPLICATE_TABLE)
}

/// Postgres has no `ADD CONSTRAINT IF NOT EXISTS`, so probe the catalog and
/// run `action` only while `constraint_name` is absent from `table`. Doubles
/// as the guard for the one-shot fixup steps, which are "done" once the
/// constraint that follows them exists.
fn unless_constraint_exists(table: &str, constraint_name: &str, action: &str) -> String {
    format!(
        "DO $$
         BEGIN
           IF NOT EXISTS (SELECT constraint_name FROM information_schema.constraint_column_usage
                           WHERE table_name = '{}' AND constraint_name = '{}') THEN
             {};
           END IF;
         END
         $$;",
        table, constraint_name, action
    )
}

fn step(conn: &mut pg::Client, verbose: bool, label: &str, sql: &str) -> Result<()> {
    if verbose {
        info!("  - {}...", label);
    }
    conn.batch_execute(sql)?;
    Ok(())
}

fn create_indexes_1(conn: &mut pg::Client, verbose: bool) -> Result<()> {
    step(
        conn,
        verbose,
        "blocks primary key",
        &unless_constraint_exists(
            "blocks",
            "blocks_pkey",
            "ALTER TABLE blocks ADD CONSTRAINT blocks_pkey PRIMARY KEY(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "blocks prevhash index",
        "CREATE INDEX IF NOT EXISTS blocks_prevhash_idx ON blocks(prevhash);",
    )?;
    step(
        conn,
        verbose,
        "blocks hash index",
        "CREATE INDEX IF NOT EXISTS blocks_hash_idx ON blocks(hash);",
    )?;
    step(
        conn,
        verbose,
        "blocks height index",
        "CREATE INDEX IF NOT EXISTS blocks_height_idx ON blocks(height);",
    )?;
    step(
        conn,
        verbose,
        "txs primary key",
        &unless_constraint_exists(
            "txs",
            "txs_pkey",
            "ALTER TABLE txs ADD CONSTRAINT txs_pkey PRIMARY KEY(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "txs txid unique index",
        "CREATE UNIQUE INDEX IF NOT EXISTS txs_txid_idx ON txs(txid);",
    )?;
    step(
        conn,
        verbose,
        "block_txs primary key",
        &unless_constraint_exists(
            "block_txs",
            "block_txs_pkey",
            "ALTER TABLE block_txs ADD CONSTRAINT block_txs_pkey PRIMARY KEY(block_id, n)",
        ),
    )?;
    step(
        conn,
        verbose,
        "block_txs tx_id index",
        "CREATE INDEX IF NOT EXISTS block_txs_tx_id_idx ON block_txs(tx_id);",
    )?;
    Ok(())
}

fn create_indexes_2(conn: &mut pg::Client, verbose: bool) -> Result<()> {
    step(
        conn,
        verbose,
        "utxos primary key",
        &unless_constraint_exists(
            "utxos",
            "utxos_pkey",
            "ALTER TABLE utxos ALTER COLUMN tx_id SET NOT NULL;
             ALTER TABLE utxos ADD CONSTRAINT utxos_pkey PRIMARY KEY(tx_id, n)",
        ),
    )?;
    step(
        conn,
        verbose,
        "txins (prevout_tx_id, prevout_n) index",
        "CREATE INDEX IF NOT EXISTS txins_prevout_tx_id_prevout_n_idx ON txins(prevout_tx_id, prevout_n);",
    )?;
    step(
        conn,
        verbose,
        "txins primary key",
        &unless_constraint_exists(
            "txins",
            "txins_pkey",
            "ALTER TABLE txins ADD CONSTRAINT txins_pkey PRIMARY KEY(tx_id, n)",
        ),
    )?;
    step(
        conn,
        verbose,
        "txouts primary key",
        &unless_constraint_exists(
            "txouts",
            "txouts_pkey",
            "ALTER TABLE txouts ADD CONSTRAINT txouts_pkey PRIMARY KEY(tx_id, n)",
        ),
    )?;
    Ok(())
}

fn create_constraints(conn: &mut pg::Client, verbose: bool) -> Result<()> {
    // NB: the probed table is the target/foreign table of each key
    step(
        conn,
        verbose,
        "block_txs block_id foreign key",
        &unless_constraint_exists(
            "blocks",
            "block_txs_block_id_fkey",
            "ALTER TABLE block_txs ADD CONSTRAINT block_txs_block_id_fkey FOREIGN KEY (block_id) REFERENCES blocks(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "block_txs tx_id foreign key",
        &unless_constraint_exists(
            "txs",
            "block_txs_tx_id_fkey",
            "ALTER TABLE block_txs ADD CONSTRAINT block_txs_tx_id_fkey FOREIGN KEY (tx_id) REFERENCES txs(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "txins tx_id foreign key",
        &unless_constraint_exists(
            "txs",
            "txins_tx_id_fkey",
            "ALTER TABLE txins ADD CONSTRAINT txins_tx_id_fkey FOREIGN KEY (tx_id) REFERENCES txs(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "txouts tx_id foreign key",
        &unless_constraint_exists(
            "txs",
            "txouts_tx_id_fkey",
            "ALTER TABLE txouts ADD CONSTRAINT txouts_tx_id_fkey FOREIGN KEY (tx_id) REFERENCES txs(id)",
        ),
    )?;
    step(
        conn,
        verbose,
        "utxos (tx_id, n) foreign key",
        &unless_constraint_exists(
            "txouts",
            "utxos_tx_id_n_fkey",
            "ALTER TABLE utxos ADD CONSTRAINT utxos_tx_id_n_fkey FOREIGN KEY (tx_id, n) REFERENCES txouts(tx_id, n)",
        ),
    )?;
    Ok(())
}

/// Most prevout_tx_ids resolve through the cache during the load; the rest
/// are patched here with a txins table scan. Once the txins foreign key
/// exists this has already happened and the statement is a no-op.
fn fill_prevout_tx_ids(conn: &mut pg::Client) -> Result<()> {
    conn.batch_execute(&unless_constraint_exists(
        "txs",
        "txins_tx_id_fkey",
        "UPDATE txins i
            SET prevout_tx_id = t.id
           FROM txs t
          WHERE i.prevout_hash = t.txid
            AND i.prevout_tx_id IS NULL
            AND i.n <> -1",
    ))?;
    Ok(())
}

/// Populate utxos.tx_id from the txs table. Updating the rows in place would
/// take forever, so the table is rebuilt with a join and swapped in. Guarded
/// by the utxos primary key, which only exists once linking has happened.
fn link_utxos(conn: &mut pg::Client) -> Result<()> {
    conn.batch_execute(&unless_constraint_exists(
        "utxos",
        "utxos_pkey",
        "CREATE TABLE utxos_tmp AS
           SELECT t.id AS tx_id, u.txid, u.n, u.height, u.coinbase, u.value, u.scriptpubkey
             FROM utxos u
             JOIN txs t ON t.txid = u.txid;
         DROP TABLE utxos;
         ALTER TABLE utxos_tmp RENAME TO utxos",
    ))?;
    Ok(())
}

/// Walk the chain backwards from the highest block by joining prevhash to
/// hash; whatever the walk cannot reach is an orphan. A positive limit caps
/// the recursion depth, 0 walks the whole table.
fn orphan_update_sql(limit: i32) -> String {
    let limit_sql = if limit > 0 {
        format!("WHERE n < {}", limit)
    } else {
        String::new()
    };
    format!(
        "UPDATE blocks
   SET orphan = a.orphan
  FROM (
    SELECT blocks.id, x.id IS NULL AS orphan
      FROM blocks
      LEFT JOIN (
        WITH RECURSIVE recur(id, prevhash) AS (
          SELECT id, prevhash, 0 AS n
            FROM blocks
                            -- this should be faster than MAX(height)
           WHERE height IN (SELECT height FROM blocks ORDER BY height DESC LIMIT 1)
          UNION ALL
            SELECT blocks.id, blocks.prevhash, n+1 AS n
              FROM recur
              JOIN blocks ON blocks.hash = recur.prevhash
            {}
        )
        SELECT recur.id, recur.prevhash, n
          FROM recur
      ) x ON blocks.id = x.id
   ) a
  WHERE blocks.id = a.id;",
        limit_sql
    )
}

fn set_orphans(conn: &mut pg::Client, limit: i32) -> Result<()> {
    conn.batch_execute(&orphan_update_sql(limit))?;
    Ok(())
}

/// The post-load fixup sequence. Every step is idempotent and guarded, so
/// re-running after a failure is safe; a failing step is logged and the next
/// one is still attempted.
pub fn run_fixup(conn: &mut pg::Client, backfill_prevouts: bool, orphan_limit: i32, verbose: bool) {
    info!("Creating indexes part 1 (if needed), this may take a long time...");
    if let Err(e) = create_indexes_1(conn, verbose) {
        error!("Error creating indexes: {}", e);
    }
    if backfill_prevouts {
        info!("Filling missing prevout_tx_id entries (if needed), this may take a long time...");
        if let Err(e) = fill_prevout_tx_ids(conn) {
            error!("Error filling prevout_tx_id: {}", e);
        }
    } else {
        info!("Not filling prevout_tx_id entries: no txid cache misses during the load.");
    }
    info!("Linking UTXOs (if needed), this may take a long time...");
    if let Err(e) = link_utxos(conn) {
        error!("Error linking utxos: {}", e);
    }
    info!("Creating indexes part 2 (if needed), this may take a long time...");
    if let Err(e) = create_indexes_2(conn, verbose) {
        error!("Error creating indexes: {}", e);
    }
    info!("Creating constraints (if needed), this may take a long time...");
    if let Err(e) = create_constraints(conn, verbose) {
        error!("Error creating constraints: {}", e);
    }
    info!("Marking orphan blocks...");
    if let Err(e) = set_orphans(conn, orphan_limit) {
        error!("Error marking orphans: {}", e);
    }
    info!("Indexes and constraints created.");
}

/// Write handle over the whole pipeline.
///
/// Construction provisions the schema and starts the coordinator and the
/// utxo writer; `close` (or drop) shuts both down and waits for fixup.
pub struct PgWriter {
    client: pg::Client,
    block_tx: Option<Sender<BlockInfo>>,
    utxo_tx: Option<Sender<Option<Utxo>>>,
    coordinator: Option<thread::JoinHandle<Result<()>>>,
    utxo_worker: Option<thread::JoinHandle<Result<()>>>,
}

impl PgWriter {
    /// Connect, provision the schema and start the ingestion pipeline.
    ///
    /// `cache_capacity` bounds the txid cache used for duplicate detection
    /// and prevout resolution.
    pub fn new(url: &str, cache_capacity: usize) -> Result<Self> {
        let mut client = establish_connection(url);

        let mode = match create_tables(&mut client) {
            Ok(()) => {
                info!("Tables created; indexes and constraints are deferred until after the load.");
                Mode::Deferred
            }
            Err(ref e) if is_already_exists(e) => Mode::Synchronous,
            Err(e) => return Err(e.into()),
        };
        info!("Loading in {} mode", mode);

        let (block_tx, block_rx) = bounded::<BlockInfo>(CHANNEL_CAPACITY);
        let (utxo_tx, utxo_rx) = bounded::<Option<Utxo>>(CHANNEL_CAPACITY);

        let coordinator = {
            let url = url.to_owned();
            thread::spawn(fn_log_err("pg_block_worker", move || {
                block_worker(&block_rx, &url, mode, cache_capacity)
            }))
        };
        let utxo_worker = {
            let mut conn = establish_connection(url);
            thread::spawn(fn_log_err("pg_utxo_writer", move || {
                utxo_writer(&utxo_rx, &mut conn)
            }))
        };

        Ok(PgWriter {
            client,
            block_tx: Some(block_tx),
            utxo_tx: Some(utxo_tx),
            coordinator: Some(coordinator),
            utxo_worker: Some(utxo_worker),
        })
    }

    /// Queue a block for ingestion; blocks when the pipeline is saturated.
    pub fn write_block_info(&self, bi: BlockInfo) -> Result<()> {
        let ch = match self.block_tx.as_ref() {
            Some(ch) => ch,
            None => bail!("writer is closed"),
        };
        if ch.send(bi).is_err() {
            bail!("block pipeline is shut down");
        }
        Ok(())
    }

    /// Queue a utxo snapshot entry; blocks when the pipeline is saturated.
    pub fn write_utxo(&self, u: Utxo) -> Result<()> {
        let ch = match self.utxo_tx.as_ref() {
            Some(ch) => ch,
            None => bail!("writer is closed"),
        };
        if ch.send(Some(u)).is_err() {
            bail!("utxo pipeline is shut down");
        }
        Ok(())
    }

    /// Commit whatever the utxo writer has streamed so far.
    pub fn flush_utxos(&self) -> Result<()> {
        let ch = match self.utxo_tx.as_ref() {
            Some(ch) => ch,
            None => bail!("writer is closed"),
        };
        if ch.send(None).is_err() {
            bail!("utxo pipeline is shut down");
        }
        Ok(())
    }

    /// Greatest height currently persisted, -1 when the store is empty.
    pub fn last_height(&mut self) -> Result<BlockHeight> {
        let row = self.client.query_opt(
            "SELECT height FROM blocks ORDER BY height DESC LIMIT 1",
            &[],
        )?;
        Ok(row.map(|r| r.get(0)).unwrap_or(-1))
    }

    /// Close both inputs and wait for the pipeline, including the fixup
    /// phase, to finish. Returns once the workers have joined, whatever
    /// errors they ran into on the way.
    pub fn close(&mut self) {
        drop(self.block_tx.take());
        drop(self.utxo_tx.take());
        for (name, handle) in [
            ("block worker", self.coordinator.take()),
            ("utxo writer", self.utxo_worker.take()),
        ] {
            if let Some(handle) = handle {
                // worker errors are already logged by fn_log_err
                if handle.join().is_err() {
                    error!("{} thread panicked during shutdown", name);
                }
            }
        }
    }

    /// Drop the whole schema.
    pub fn wipe(url: &str) -> Result<()> {
        info!("Wiping db schema");
        let mut conn = establish_connection(url);
        conn.batch_execute(include_str!("pg/wipe.sql"))?;
        Ok(())
    }
}

impl Drop for PgWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl Store for PgWriter {
    fn write_block_info(&self, bi: BlockInfo) -> Result<()> {
        PgWriter::write_block_info(self, bi)
    }

    fn write_utxo(&self, u: Utxo) -> Result<()> {
        PgWriter::write_utxo(self, u)
    }

    fn last_height(&mut self) -> Result<BlockHeight> {
        PgWriter::last_height(self)
    }

    fn close(&mut self) {
        PgWriter::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{OutPoint, Script, Sequence, TxIn, Witness};

    fn txin_with(prevout: OutPoint, witness: Witness) -> TxIn {
        TxIn {
            previous_output: prevout,
            script_sig: Script::new(),
            sequence: Sequence(0xffff_ffff),
            witness,
        }
    }

    #[test]
    fn copy_statement_lists_columns() {
        assert_eq!(
            copy_statement("txouts", TXOUT_COLS),
            "COPY txouts (tx_id, n, value, scriptpubkey) FROM STDIN BINARY"
        );
        assert_eq!(
            copy_statement("block_txs", BLOCK_TX_COLS),
            "COPY block_txs (block_id, n, tx_id) FROM STDIN BINARY"
        );
    }

    #[test]
    fn unsigned_ints_store_bit_preserving() {
        assert_eq!(COINBASE_VOUT as i32, -1);
        assert_eq!((COINBASE_VOUT as i32) as u32, COINBASE_VOUT);
        assert_eq!(0x8000_0000u32 as i32, i32::MIN);
    }

    #[test]
    fn empty_witness_stays_null() {
        let txin = txin_with(OutPoint::default(), Witness::default());
        assert_eq!(witness_bytes(&txin), None);
    }

    #[test]
    fn witness_serializes_canonically() {
        let txin = txin_with(
            OutPoint::default(),
            Witness::from_vec(vec![vec![0xAA, 0xBB], vec![]]),
        );
        // element count, then each element length-prefixed
        assert_eq!(witness_bytes(&txin), Some(vec![0x02, 0x02, 0xAA, 0xBB, 0x00]));
    }

    #[test]
    fn coinbase_prevout_is_never_resolved() {
        let cache = TxIdCache::new(4);
        let coinbase = txin_with(OutPoint::null(), Witness::default());
        // even a cached null txid must not resolve for a coinbase input
        cache.add(coinbase.previous_output.txid, 1, 1);
        assert_eq!(resolve_prevout(&coinbase, &cache), None);
    }

    #[test]
    fn prevout_resolution_follows_the_cache() {
        let cache = TxIdCache::new(4);
        let txid = Txid::from_slice(&[7u8; 32]).unwrap();
        let spend = txin_with(OutPoint { txid, vout: 0 }, Witness::default());
        assert_eq!(resolve_prevout(&spend, &cache), None);
        cache.add(txid, 42, 1);
        assert_eq!(resolve_prevout(&spend, &cache), Some(42));
    }

    #[test]
    fn orphan_walk_limit_is_optional() {
        let unlimited = orphan_update_sql(0);
        assert!(!unlimited.contains("WHERE n <"));
        let capped = orphan_update_sql(12);
        assert!(capped.contains("WHERE n < 12"));
    }

    #[test]
    fn constraint_guard_probes_the_catalog() {
        let sql = unless_constraint_exists("txs", "txs_pkey", "SELECT 1");
        assert!(sql.contains("information_schema.constraint_column_usage"));
        assert!(sql.contains("table_name = 'txs'"));
        assert!(sql.contains("constraint_name = 'txs_pkey'"));
        assert!(sql.contains("SELECT 1;"));
    }
}

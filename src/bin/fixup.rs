//! Re-runs the idempotent post-load fixup sequence, or wipes the schema.
//!
//! Useful after a load that logged row or commit errors: every step guards
//! itself on the constraint it produces, so running this repeatedly is safe.

use bitcoin_loader::{db, opts};
use common_failures::prelude::*;
use log::error;
use std::env;

fn run() -> Result<()> {
    dotenv::dotenv()?;

    let opts: opts::Opts = structopt::StructOpt::from_args();
    let db_url = env::var("DATABASE_URL")?;

    if opts.wipe_db {
        db::pg::PgWriter::wipe(&db_url)?;
        return Ok(());
    }

    let mut conn = db::pg::establish_connection(&db_url);
    db::pg::run_fixup(&mut conn, true, opts.orphan_limit, true);

    Ok(())
}

fn main() {
    // logger first so early failures are visible
    let _ = env_logger::try_init();
    if let Err(e) = run() {
        error!("Fatal: {}", e.display_causes_and_backtrace());
        std::process::exit(1);
    }
}

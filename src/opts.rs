use clap::Parser;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Parser, Clone)]
#[structopt(name = "fixup", about = "Post-load fixup for the bitcoin loader")]
#[command(name = "fixup", about = "Post-load fixup for the bitcoin loader")]
pub struct Opts {
    /// Depth cap for the orphan-marking chain walk; 0 walks the whole table
    #[structopt(long = "orphan-limit", default_value = "0")]
    #[arg(long = "orphan-limit", default_value = "0", value_name = "N")]
    pub orphan_limit: i32,

    /// Drop schema/data using wipe.sql and exit
    #[structopt(long = "wipe-db")]
    #[arg(long = "wipe-db")]
    pub wipe_db: bool,
}

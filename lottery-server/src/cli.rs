use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{server::ServerConfig, winners::DEFAULT_WINNING_NUMBER};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept bet batches from agencies and hand out winners once all are done.
    Serve(ServeArgs),
    /// Submit an agency's bets from a CSV file and print its winners.
    Submit(SubmitArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Accept backlog handed to listen(2).
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Number of distinct agencies that must finish before winners are sent.
    ///
    /// Agencies name themselves with one byte, so at most 255 can finish.
    #[arg(
        long,
        env = "EXPECTED_AGENCIES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    pub agencies: u8,

    /// Append-only file holding every received bet.
    #[arg(long, env = "STORAGE_FILEPATH", default_value = "./bets.csv")]
    pub store: PathBuf,

    /// Number that wins this draw.
    #[arg(
        long,
        env = "LOTTERY_WINNER_NUMBER",
        default_value_t = DEFAULT_WINNING_NUMBER,
        allow_negative_numbers = true
    )]
    pub winning_number: i64,

    /// How long in-flight connections may run after a shutdown signal.
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 1000)]
    pub grace_period_ms: u64,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            backlog: args.backlog,
            expected_agencies: args.agencies.into(),
            store_path: args.store,
            winning_number: args.winning_number,
            grace_period: Duration::from_millis(args.grace_period_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Address of the lottery server.
    #[arg(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Agency identifier stamped on every bet.
    #[arg(long, env = "CLI_ID", value_parser = clap::value_parser!(u8).range(1..))]
    pub agency: u8,

    /// CSV file with `first_name,last_name,document,birthdate,number` rows.
    #[arg(long)]
    pub bets: PathBuf,

    /// Largest number of bets sent in one batch.
    #[arg(
        long,
        env = "BATCH_MAX_AMOUNT",
        default_value_t = 100,
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    pub batch_max_amount: u8,
}

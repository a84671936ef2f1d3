use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use log::{error, LevelFilter};
use netcheck::{ProbeConfig, ProbeRunner, Store, StoreOptions};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HOST: &str = "93.184.216.34";

#[derive(Parser, Debug)]
#[command(name = "netcheck")]
#[command(author, version, about = "Check network status with ping and keep the history in SQLite")]
struct Args {
    /// More verbose logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping a host once and store the result
    Run {
        /// Database file to save to
        #[arg(short, long)]
        output: PathBuf,

        /// Host to check
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Number of pings to perform for the test
        #[arg(short, long, default_value = "3")]
        number: u32,

        /// Reset the database before storing
        #[arg(short, long)]
        reset: bool,

        /// Give up on ping after this many seconds (0 waits forever)
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Ping program to run
        #[arg(long, default_value = "ping")]
        ping: PathBuf,
    },

    /// Print statistics as JSON
    Stats {
        /// Database file to load from
        #[arg(short, long)]
        db: PathBuf,

        #[arg(value_enum)]
        kind: StatsKind,

        /// Only the first N rows
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Serve statistics over HTTP
    Serve {
        /// Database file to load from
        #[arg(short, long)]
        db: PathBuf,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "5000")]
        port: u16,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatsKind {
    ResponseTimes,
    Gaps,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_target(false)
        .init();

    let code = match run(args.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32, netcheck::Error> {
    match command {
        Command::Run {
            output,
            host,
            number,
            reset,
            timeout,
            ping,
        } => {
            let runner = ProbeRunner::new(ProbeConfig {
                program: ping,
                args: Vec::new(),
                timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            });
            let options = StoreOptions {
                clear: reset,
                create: true,
            };

            let mut store = Store::open(&output, options)?;
            let stored = netcheck::check(&mut store, &runner, &host, number)?;
            store.close();

            // 2 = host unreachable, nothing stored
            Ok(if stored.is_some() { 0 } else { 2 })
        }

        Command::Stats { db, kind, limit } => {
            if !db.is_file() {
                let missing = format!("no database at {}", db.display());
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, missing).into());
            }
            let options = StoreOptions {
                clear: false,
                create: false,
            };
            let mut store = Store::open(&db, options)?;
            let json = match kind {
                StatsKind::ResponseTimes => serde_json::to_string_pretty(&store.response_times(limit)?),
                StatsKind::Gaps => serde_json::to_string_pretty(&store.gaps(limit)?),
            }
            .map_err(std::io::Error::from)?;
            println!("{}", json);
            Ok(0)
        }

        Command::Serve { db, host, port } => {
            netcheck::serve::start(&host, port, db)?;
            Ok(0)
        }
    }
}

use std::{env, io, process};

use seat_ledger::csv::{read_commands, write_bookings};
use seat_ledger::{LedgerConfig, Replay};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        error!("usage: seat-ledger <commands.csv>");
        process::exit(2);
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match LedgerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(reason = %e, "invalid configuration");
            process::exit(1);
        }
    };

    let commands = match read_commands(path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let mut replay = Replay::new(config);
    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        for result in commands {
            match result {
                Ok(cmd) => {
                    if cmd_sender.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(cmd_receiver)).await;

    if let Err(e) = write_bookings(io::stdout().lock(), replay.bookings()) {
        error!(reason = %e, "failed to write bookings");
        process::exit(1);
    }
}

use std::{error::Error, sync::mpsc, time::Duration};

use clap::Parser;
use log::{info, warn};
use tcpmachine::{DispatchMode, Server, ServerConfig, config, handler::Echo};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// Number of worker threads handling sessions
    #[arg(short, long, default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,
    /// Give every connection its own thread instead of using the worker pool
    #[arg(long)]
    per_connection: bool,
    /// Idle polling interval of the acceptor and workers, in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    /// Read/write timeout on client connections, in milliseconds
    #[arg(long, default_value_t = 1000)]
    io_timeout_ms: u64,
    /// Largest string a client may send, in bytes
    #[arg(long, default_value_t = tcpmachine::protocol::DEFAULT_MAX_STRING_LEN)]
    max_string_len: u32,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        let dispatch = if cli.per_connection {
            DispatchMode::PerConnection
        } else {
            DispatchMode::Pool
        };

        ServerConfig::new(cli.port, cli.workers)
            .with_dispatch(dispatch)
            .with_poll_interval(Duration::from_millis(cli.poll_interval_ms))
            .with_io_timeout(Duration::from_millis(cli.io_timeout_ms))
            .with_max_string_len(cli.max_string_len)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = Server::new(cli.into(), Echo)?;

    // Every SIGINT/SIGTERM lands in the channel; only the first one is acted upon.
    let (signals, shutdown) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = signals.send(());
    })?;

    let addr = server.start()?;
    info!("listening on {addr}, waiting for SIGINT or SIGTERM");

    shutdown.recv()?;
    info!("shutting down");
    if let Err(e) = server.stop() {
        warn!("server did not stop cleanly: {e}");
    }

    Ok(())
}

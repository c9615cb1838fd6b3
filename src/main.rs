//! logecho: a shared-log echo server
//!
//! Each client sends one newline-terminated packet. The server appends it to
//! a shared data file and replies with the whole file.
//!
//! Features:
//! - One worker thread per connection, bounded by `max_connections`
//! - Periodic timestamp records in the data file
//! - Graceful shutdown on SIGINT/SIGTERM that drains workers and removes the file
//! - Optional daemon mode (`-d`), logging to the journal or a log file
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod logging;
mod runtime;
mod server;
mod signal;
mod storage;

use config::Config;
use server::{Server, ServerError};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let sink = logging::init(&config)?;

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        max_connections = config.max_connections,
        timestamp_interval = ?config.timestamp_interval,
        log_sink = ?sink,
        "Starting logecho server"
    );

    let server =
        Server::bind(config.clone()).inspect_err(|e| error!(error = %e, "Setup failed"))?;

    if config.daemon {
        info!("Detaching from terminal");
        daemon::daemonize()
            .map_err(ServerError::Daemon)
            .inspect_err(|e| error!(error = %e, "Setup failed"))?;
    }

    let _signals = signal::install(server.shutdown_handle())
        .map_err(ServerError::Signal)
        .inspect_err(|e| error!(error = %e, "Setup failed"))?;

    server.run()?;
    Ok(())
}

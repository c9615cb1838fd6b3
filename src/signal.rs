//! SIGINT/SIGTERM handling.
//!
//! Signals are received on a dedicated thread, which only triggers the
//! server's shutdown handle. All cleanup happens on the main thread.

use crate::server::ShutdownHandle;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Keeps the signal thread alive; dropping it unregisters and joins.
pub struct SignalGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

/// Start listening for termination signals.
pub fn install(shutdown: ShutdownHandle) -> io::Result<SignalGuard> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if shutdown.trigger() {
                    info!(signal, "Caught signal, exiting");
                } else {
                    debug!(signal, "Shutdown already in progress");
                }
            }
        })?;

    Ok(SignalGuard {
        handle,
        thread: Some(thread),
    })
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::Server;
    use signal_hook::low_level::raise;
    use tempfile::tempdir;

    #[test]
    fn test_sigterm_triggers_shutdown() {
        let dir = tempdir().unwrap();
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            data_file: dir.path().join("data"),
            timestamp_interval: None,
            ..Config::default()
        };

        let server = Server::bind(config).unwrap();
        let shutdown = server.shutdown_handle();
        let guard = install(server.shutdown_handle()).unwrap();
        let runner = thread::spawn(move || server.run());

        raise(SIGTERM).unwrap();
        runner.join().unwrap().unwrap();
        assert!(!shutdown.is_running());

        // A duplicate signal after shutdown is harmless.
        raise(SIGINT).unwrap();
        drop(guard);
    }
}

//! Diagnostics sink selection.
//!
//! In the foreground, records go to stdout. A configured log file always
//! wins. A daemon has no terminal, so without a file it logs to the systemd
//! journal.

use crate::config::Config;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Identifier attached to journal entries.
const SYSLOG_IDENTIFIER: &str = "logecho";

/// Where diagnostics are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    File(PathBuf),
    Journald,
}

impl LogSink {
    pub fn select(config: &Config) -> Self {
        match (&config.log_file, config.daemon) {
            (Some(path), _) => LogSink::File(path.clone()),
            (None, true) => LogSink::Journald,
            (None, false) => LogSink::Stdout,
        }
    }
}

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Build the subscriber for `sink`. RUST_LOG overrides `level`.
pub fn build(sink: &LogSink, level: &str) -> io::Result<BoxedSubscriber> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = Registry::default().with(filter);

    let subscriber: BoxedSubscriber = match sink {
        LogSink::Stdout => Box::new(registry.with(fmt::layer().with_target(false))),
        LogSink::File(path) => {
            // Opened before any daemonizing so a relative path resolves
            // against the launch directory.
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Box::new(
                registry.with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                ),
            )
        }
        LogSink::Journald => Box::new(
            registry.with(
                tracing_journald::layer()?.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string()),
            ),
        ),
    };
    Ok(subscriber)
}

/// Install the global subscriber for `config`.
///
/// A daemon on a host without a journal falls back to stdout and says so
/// on stderr while the terminal is still attached.
pub fn init(config: &Config) -> io::Result<LogSink> {
    let sink = LogSink::select(config);
    let (sink, subscriber) = match build(&sink, &config.log_level) {
        Ok(subscriber) => (sink, subscriber),
        Err(e) if sink == LogSink::Journald => {
            eprintln!("logecho: journal unavailable ({e}); use --log-file to keep daemon logs");
            (LogSink::Stdout, build(&LogSink::Stdout, &config.log_level)?)
        }
        Err(e) => return Err(e),
    };

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::info;

    #[test]
    fn test_sink_selection() {
        let foreground = Config::default();
        assert_eq!(LogSink::select(&foreground), LogSink::Stdout);

        let daemon = Config {
            daemon: true,
            ..Config::default()
        };
        assert_eq!(LogSink::select(&daemon), LogSink::Journald);

        let with_file = Config {
            daemon: true,
            log_file: Some(PathBuf::from("/tmp/logecho.log")),
            ..Config::default()
        };
        assert_eq!(
            LogSink::select(&with_file),
            LogSink::File(PathBuf::from("/tmp/logecho.log"))
        );
    }

    #[test]
    fn test_file_sink_records_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logecho.log");

        let subscriber = build(&LogSink::File(path.clone()), "info").unwrap();
        tracing::subscriber::with_default(subscriber, || {
            info!(peer = "127.0.0.1", "Accepted connection");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Accepted connection"));
        assert!(contents.contains("127.0.0.1"));
    }

    #[test]
    fn test_file_sink_unwritable_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("logecho.log");
        assert!(build(&LogSink::File(path), "info").is_err());
    }
}

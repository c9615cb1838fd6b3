//! Periodic timestamp records.

use crate::storage::SharedLog;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prefix of every timestamp record.
pub const TIMESTAMP_PREFIX: &str = "timestamp:";

/// strftime layout of the time part of a record (RFC 2822 style).
pub const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Format one timestamp record, including its trailing newline.
pub fn format_timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("{TIMESTAMP_PREFIX}{}\n", now.format(TIMESTAMP_FORMAT))
}

/// Deadline of the tick after the one due at `previous`.
///
/// Ticks stay on the `previous + n * period` grid however long an append
/// takes; ticks already missed entirely are skipped rather than bunched.
fn next_deadline(previous: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = previous + period;
    while next <= now {
        next += period;
    }
    next
}

/// Background thread appending a timestamp record to the log every period.
pub struct Timestamper {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Timestamper {
    /// Start the timer thread. The first record is written one period after
    /// this returns.
    pub fn spawn(log: Arc<SharedLog>, period: Duration) -> io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("timestamper".to_string())
            .spawn(move || {
                let mut deadline = Instant::now() + period;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match cancelled.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            let record = format_timestamp(&Local::now());
                            if let Err(e) = log.append(record.as_bytes()) {
                                warn!(error = %e, "Failed to append timestamp");
                            }
                            deadline = next_deadline(deadline, period, Instant::now());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        info!(period_secs = period.as_secs_f64(), "Timestamper started");

        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    /// Stop the timer and wait for its thread. Later calls do nothing.
    pub fn cancel(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        drop(cancel);

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Timestamper thread panicked");
            }
        }
        debug!("Timestamper cancelled");
    }
}

impl Drop for Timestamper {
    fn drop(&mut self) {
        self.cancel();
    }
}

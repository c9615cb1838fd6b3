//! Shared append-only data file.
//!
//! Every append and every full read of the file goes through one mutex, so
//! readers always observe a whole number of completed appends and appends
//! never interleave with each other.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace};

/// Size of the chunks handed to a stream sink.
pub const CHUNK_SIZE: usize = 1024;

/// Append-only log file shared by connection workers and the timestamper.
pub struct SharedLog {
    path: PathBuf,
    /// Guards every file operation; holds no data of its own.
    lock: Mutex<()>,
}

impl SharedLog {
    /// Create a handle for the log at `path`. The file itself is created on
    /// the first append.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        info!(path = %path.display(), "Initializing shared log");
        Arc::new(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no torn state.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `bytes` to the log and flush them before releasing the lock.
    ///
    /// Returns the number of bytes written; a short write is an error.
    pub fn append(&self, bytes: &[u8]) -> io::Result<usize> {
        let _guard = self.guard();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut written = 0;
        while written < bytes.len() {
            match file.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write: {written} of {} bytes", bytes.len()),
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        file.flush()?;

        trace!(bytes = written, "Appended to shared log");
        Ok(written)
    }

    /// Read the whole log from the start and pass it to `sink` in chunks of
    /// at most [`CHUNK_SIZE`] bytes.
    ///
    /// Each chunk is handed off before the next one is read, so memory use
    /// does not grow with the log. An error from the sink stops the stream
    /// and is returned. A log that does not exist yet streams nothing.
    pub fn read_and_stream<F>(&self, mut sink: F) -> io::Result<u64>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let _guard = self.guard();

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            sink(&chunk[..n])?;
            total += n as u64;
        }

        trace!(bytes = total, "Streamed shared log");
        Ok(total)
    }

    /// Delete the backing file.
    ///
    /// Returns `Ok(false)` when there was nothing to delete, so repeated
    /// calls are harmless.
    pub fn remove(&self) -> io::Result<bool> {
        let _guard = self.guard();

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed shared log");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

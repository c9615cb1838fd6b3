//! Thread-per-connection runtime.
//!
//! - `SessionRegistry`: bounded set of live connection sessions
//! - `worker`: per-connection receive/append/respond state machine
//! - `Timestamper`: periodic timestamp records in the shared log
//!
//! Everything a worker or the timer needs travels through `ServerContext`;
//! there is no process-global state.

mod connection;
mod timer;
mod worker;

pub(crate) use connection::{SessionId, SessionRegistry};
pub(crate) use timer::Timestamper;
pub(crate) use worker::serve;

use crate::storage::SharedLog;
use std::sync::Arc;

/// State shared by the accept loop and every connection worker.
pub struct ServerContext {
    pub log: Arc<SharedLog>,
    pub registry: SessionRegistry,
}

impl ServerContext {
    pub fn new(log: Arc<SharedLog>, max_connections: usize) -> Self {
        Self {
            log,
            registry: SessionRegistry::new(max_connections),
        }
    }
}

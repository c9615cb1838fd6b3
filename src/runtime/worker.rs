//! Per-connection worker.
//!
//! A worker reads one newline-terminated request, appends it to the shared
//! log as it arrives, streams the whole log back and closes the connection.
//! Failures only end the worker's own remaining steps.

use crate::runtime::connection::{CompletionGuard, ConnState, SessionId};
use crate::runtime::ServerContext;
use crate::storage::SharedLog;
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Receive chunk size.
const RECV_CHUNK: usize = 1024;

/// Outcome of scanning one received chunk for the request terminator.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// No newline yet; the whole chunk belongs to the request.
    Partial(&'a [u8]),
    /// The request ends in this chunk; holds bytes through the newline.
    Complete(&'a [u8]),
}

/// Split a received chunk at the first newline. Bytes after it are dropped.
pub fn frame(chunk: &[u8]) -> Frame<'_> {
    match chunk.iter().position(|&b| b == b'\n') {
        Some(pos) => Frame::Complete(&chunk[..=pos]),
        None => Frame::Partial(chunk),
    }
}

/// Serve one accepted connection. Runs on the connection's own thread.
///
/// The session is marked complete when this returns, including by unwinding.
pub fn serve(ctx: &ServerContext, id: SessionId, stream: TcpStream, peer: SocketAddr) {
    let complete = CompletionGuard::new(&ctx.registry, id);

    ConnectionWorker::new(id, peer, stream, Arc::clone(&ctx.log)).run();

    drop(complete);
}

struct ConnectionWorker {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    log: Arc<SharedLog>,
    state: ConnState,
}

impl ConnectionWorker {
    fn new(id: SessionId, peer: SocketAddr, stream: TcpStream, log: Arc<SharedLog>) -> Self {
        Self {
            id,
            peer,
            stream,
            log,
            state: ConnState::Receiving,
        }
    }

    /// Drive the state machine to `Done`, then close the socket.
    fn run(mut self) {
        while self.state != ConnState::Done {
            let next = match self.state {
                ConnState::Receiving => self.receive(),
                ConnState::FramingComplete => ConnState::Responding,
                ConnState::Responding => self.respond(),
                ConnState::Done => ConnState::Done,
            };
            trace!(session = self.id, from = ?self.state, to = ?next, "Connection state change");
            self.state = next;
        }

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(session = self.id, error = %e, "Socket shutdown failed");
        }
        info!(peer = %self.peer.ip(), "Closed connection");
    }

    fn receive(&mut self) -> ConnState {
        let mut buf = BytesMut::zeroed(RECV_CHUNK);

        loop {
            let n = match self.stream.read(&mut buf[..]) {
                Ok(0) => {
                    debug!(session = self.id, "Peer closed before newline");
                    return ConnState::Responding;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(session = self.id, error = %e, "Receive failed");
                    return ConnState::Responding;
                }
            };

            let (record, next) = match frame(&buf[..n]) {
                Frame::Partial(bytes) => (bytes, ConnState::Receiving),
                Frame::Complete(bytes) => (bytes, ConnState::FramingComplete),
            };

            if let Err(e) = self.log.append(record) {
                warn!(session = self.id, error = %e, "Append to shared log failed");
                return ConnState::Done;
            }

            if next != ConnState::Receiving {
                return next;
            }
        }
    }

    fn respond(&mut self) -> ConnState {
        let stream = &mut self.stream;
        match self.log.read_and_stream(|chunk| stream.write_all(chunk)) {
            Ok(bytes) => debug!(session = self.id, bytes, "Sent log contents"),
            Err(e) => warn!(session = self.id, error = %e, "Streaming log to peer failed"),
        }
        ConnState::Done
    }
}

//! TCP listener and shutdown coordination.
//!
//! The accept loop admits each connection into the session registry, hands
//! it to a dedicated worker thread and reaps finished workers after every
//! accept. Shutdown is requested through a [`ShutdownHandle`]; all cleanup
//! (draining workers, stopping the timer, removing the log) runs on the
//! thread that called [`Server::run`].

use crate::config::Config;
use crate::runtime::{self, ServerContext, SessionId, Timestamper};
use crate::storage::SharedLog;
use std::io;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long the shutdown path waits for its wake-up connection.
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// First and largest pause after a failed accept.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Errors that prevent the server from starting.
#[derive(Debug)]
pub enum ServerError {
    Address(String, io::Error),
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    Timer(io::Error),
    Signal(io::Error),
    Daemon(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Address(addr, e) => write!(f, "Failed to resolve '{addr}': {e}"),
            ServerError::Socket(e) => write!(f, "Failed to create socket: {e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Listen(e) => write!(f, "Failed to listen: {e}"),
            ServerError::Timer(e) => write!(f, "Failed to start timestamper: {e}"),
            ServerError::Signal(e) => write!(f, "Failed to register signal handlers: {e}"),
            ServerError::Daemon(e) => write!(f, "Failed to daemonize: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Cloneable trigger that stops the accept loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    listener: Arc<socket2::Socket>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Whether the accept loop should keep going.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown and unblock a pending `accept`.
    ///
    /// Returns `true` for the call that actually initiated shutdown; repeated
    /// calls are no-ops.
    pub fn trigger(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }

        // On Linux this fails the blocked accept outright. Elsewhere the
        // loopback connection below wakes it instead.
        if let Err(e) = self.listener.shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown failed");
        }
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            trace!(error = %e, "Wake-up connection failed");
        }

        info!("Shutdown requested");
        true
    }
}

/// Server instance
pub struct Server {
    config: Config,
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Resolve, bind and listen on the configured address.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let addr = resolve(&config.listen)?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(ServerError::Socket)?;

        let wake = listener.try_clone().map_err(ServerError::Socket)?;
        let shutdown = ShutdownHandle {
            running: Arc::new(AtomicBool::new(true)),
            listener: Arc::new(socket2::Socket::from(wake)),
            wake_addr: wake_address(local_addr),
        };

        let log = SharedLog::new(config.data_file.clone());
        let ctx = Arc::new(ServerContext::new(log, config.max_connections));

        info!(address = %local_addr, backlog = config.backlog, "Server listening");

        Ok(Server {
            config,
            ctx,
            listener,
            shutdown,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested, then drain all
    /// workers, stop the timestamper and remove the shared log.
    pub fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            ctx,
            listener,
            shutdown,
        } = self;

        let mut timestamper = match config.timestamp_interval {
            Some(period) => Some(
                Timestamper::spawn(Arc::clone(&ctx.log), period).map_err(ServerError::Timer)?,
            ),
            None => None,
        };

        info!(
            max_connections = ctx.registry.capacity(),
            data_file = %ctx.log.path().display(),
            "Accepting connections"
        );

        let mut backoff = AcceptBackoff::default();

        while shutdown.is_running() {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => {
                    backoff.reset();
                    pair
                }
                Err(_) if !shutdown.is_running() => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let delay = recover_from_accept_error(&ctx, &e, &mut backoff);
                    thread::sleep(delay);
                    continue;
                }
            };

            if !shutdown.is_running() {
                // Wake-up connection from the shutdown path.
                break;
            }

            info!(peer = %peer.ip(), "Accepted connection");
            admit(&ctx, stream, peer);

            let reaped = ctx.registry.reap_completed();
            if reaped > 0 {
                debug!(reaped, live = ctx.registry.len(), "Reaped finished connections");
            }
        }

        drop(listener);

        let drained = ctx.registry.drain();
        info!(drained, "All connection workers joined");

        if let Some(timer) = timestamper.as_mut() {
            timer.cancel();
        }

        match ctx.log.remove() {
            Ok(true) => info!(path = %ctx.log.path().display(), "Removed data file"),
            Ok(false) => debug!("No data file to remove"),
            Err(e) => warn!(error = %e, "Failed to remove data file"),
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Register a session and start its worker. A connection that cannot be
/// admitted is closed immediately.
fn admit(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let Some(id) = ctx.registry.insert(peer) else {
        warn!(peer = %peer, "Connection limit reached, rejecting connection");
        return;
    };

    let worker_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("conn-{id}"))
        .spawn(move || runtime::serve(&worker_ctx, id, stream, peer));

    match spawned {
        Ok(worker) => ctx.registry.attach(id, worker),
        Err(e) => reject(ctx, id, peer, e),
    }
}

/// Growing pause between failed accepts, so descriptor exhaustion does not
/// turn the accept loop into a busy spin.
#[derive(Debug, Default)]
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    fn next(&mut self) -> Duration {
        let delay = match self.delay {
            None => ACCEPT_BACKOFF_MIN,
            Some(prev) => (prev * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.delay = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

/// Log a failed accept, release finished workers (and their descriptors)
/// and return how long to wait before accepting again.
fn recover_from_accept_error(
    ctx: &ServerContext,
    e: &io::Error,
    backoff: &mut AcceptBackoff,
) -> Duration {
    let first = backoff.delay.is_none();
    let delay = backoff.next();
    if first {
        error!(error = %e, retry_ms = delay.as_millis() as u64, "Failed to accept connection");
    } else {
        debug!(error = %e, retry_ms = delay.as_millis() as u64, "Accept still failing");
    }

    let reaped = ctx.registry.reap_completed();
    if reaped > 0 {
        debug!(reaped, "Reaped finished connections after accept failure");
    }
    delay
}

fn reject(ctx: &ServerContext, id: SessionId, peer: SocketAddr, e: io::Error) {
    warn!(peer = %peer, error = %e, "Failed to spawn connection worker");
    ctx.registry.discard(id);
}

fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .map_err(|e| ServerError::Address(listen.to_string(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::Address(
                listen.to_string(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            )
        })
}

/// Create a blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket.listen(backlog).map_err(ServerError::Listen)?;

    Ok(socket.into())
}

/// Address a local client can connect to in order to reach the listener.
fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::path::PathBuf;
    use std::thread::JoinHandle;
    use tempfile::{tempdir, TempDir};

    struct TestServer {
        addr: SocketAddr,
        data_file: PathBuf,
        shutdown: ShutdownHandle,
        thread: JoinHandle<Result<(), ServerError>>,
        _dir: TempDir,
    }

    impl TestServer {
        fn start(max_connections: usize) -> Self {
            let dir = tempdir().unwrap();
            let data_file = dir.path().join("data");
            let config = Config {
                listen: "127.0.0.1:0".to_string(),
                max_connections,
                data_file: data_file.clone(),
                timestamp_interval: None,
                ..Config::default()
            };

            let server = Server::bind(config).unwrap();
            let addr = server.local_addr().unwrap();
            let shutdown = server.shutdown_handle();
            let thread = thread::spawn(move || server.run());

            TestServer {
                addr,
                data_file,
                shutdown,
                thread,
                _dir: dir,
            }
        }

        fn stop(self) {
            assert!(self.shutdown.trigger());
            self.thread.join().unwrap().unwrap();
            assert!(!self.data_file.exists());
        }
    }

    fn send(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_round_trip() {
        let server = TestServer::start(16);

        assert_eq!(send(server.addr, b"hello\n"), b"hello\n");
        assert_eq!(send(server.addr, b"world\n"), b"hello\nworld\n");

        assert!(server.data_file.exists());
        server.stop();
    }

    #[test]
    fn test_large_request_streams_back_intact() {
        let server = TestServer::start(16);

        let mut request: Vec<u8> = (0..5000).map(|i| b'a' + (i % 26) as u8).collect();
        request.push(b'\n');

        assert_eq!(send(server.addr, &request), request);
        server.stop();
    }

    #[test]
    fn test_concurrent_clients_lines_intact() {
        let server = TestServer::start(64);
        let addr = server.addr;

        let clients: Vec<_> = (0..24)
            .map(|i| {
                thread::spawn(move || {
                    let line = format!("client-{i:02}-{}\n", "x".repeat(100 + i));
                    let response = send(addr, line.as_bytes());
                    let response = String::from_utf8(response).unwrap();
                    assert!(response.contains(&line));
                    line
                })
            })
            .collect();
        let mut expected: Vec<String> = clients.into_iter().map(|c| c.join().unwrap()).collect();

        let contents = std::fs::read_to_string(&server.data_file).unwrap();
        let mut lines: Vec<String> = contents.split_inclusive('\n').map(str::to_string).collect();

        expected.sort();
        lines.sort();
        assert_eq!(lines, expected);

        server.stop();
    }

    #[test]
    fn test_shutdown_waits_for_inflight_connection() {
        let server = TestServer::start(16);

        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"slow").unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(server.shutdown.trigger());
        thread::sleep(Duration::from_millis(100));
        assert!(!server.thread.is_finished());

        client.write_all(b" request\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"slow request\n");

        server.thread.join().unwrap().unwrap();
        assert!(!server.data_file.exists());
    }

    #[test]
    fn test_shutdown_drains_many_inflight_connections() {
        let server = TestServer::start(16);

        let mut clients: Vec<TcpStream> = (0..4)
            .map(|i| {
                let mut client = TcpStream::connect(server.addr).unwrap();
                client.write_all(format!("held-{i}").as_bytes()).unwrap();
                client
            })
            .collect();
        thread::sleep(Duration::from_millis(150));

        assert!(server.shutdown.trigger());

        // Finish them last-accepted first; the server must stay up until the
        // final one is answered.
        let mut responses = Vec::new();
        while let Some(mut client) = clients.pop() {
            thread::sleep(Duration::from_millis(50));
            assert!(!server.thread.is_finished());

            client.write_all(b"\n").unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            responses.push(String::from_utf8(response).unwrap());
        }

        // Partial chunks are appended as they arrive, so every marker is
        // already in the log by the time the first newline lands.
        for response in &responses {
            for i in 0..4 {
                assert!(response.contains(&format!("held-{i}")));
            }
        }
        let newlines: Vec<usize> = responses.iter().map(|r| r.matches('\n').count()).collect();
        assert_eq!(newlines, vec![1, 2, 3, 4]);

        server.thread.join().unwrap().unwrap();
        assert!(!server.data_file.exists());
    }

    #[test]
    fn test_accept_backoff_grows_and_resets() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(40));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), ACCEPT_BACKOFF_MAX);

        backoff.reset();
        assert_eq!(backoff.next(), ACCEPT_BACKOFF_MIN);
    }

    #[test]
    fn test_accept_error_reaps_and_pauses() {
        let dir = tempdir().unwrap();
        let ctx = ServerContext::new(SharedLog::new(dir.path().join("data")), 4);

        let id = ctx.registry.insert(SocketAddr::from(([127, 0, 0, 1], 1))).unwrap();
        ctx.registry.attach(id, thread::spawn(|| {}));
        ctx.registry.mark_complete(id);

        let mut backoff = AcceptBackoff::default();
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);

        let delay = recover_from_accept_error(&ctx, &emfile, &mut backoff);
        assert!(delay >= ACCEPT_BACKOFF_MIN);
        assert_eq!(ctx.registry.len(), 0);

        let delay = recover_from_accept_error(&ctx, &emfile, &mut backoff);
        assert!(delay > ACCEPT_BACKOFF_MIN);
    }

    #[test]
    fn test_duplicate_trigger_is_noop() {
        let server = TestServer::start(16);
        send(server.addr, b"once\n");

        let extra = server.shutdown.clone();
        assert!(extra.trigger());
        assert!(!extra.trigger());
        assert!(!server.shutdown.trigger());

        server.thread.join().unwrap().unwrap();
        assert!(!server.data_file.exists());
    }

    #[test]
    fn test_connection_limit_rejects_excess() {
        let server = TestServer::start(1);

        let mut held = TcpStream::connect(server.addr).unwrap();
        held.write_all(b"held").unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut rejected = TcpStream::connect(server.addr).unwrap();
        let mut response = Vec::new();
        if rejected.read_to_end(&mut response).is_ok() {
            assert!(response.is_empty());
        }

        held.write_all(b"\n").unwrap();
        let mut response = Vec::new();
        held.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"held\n");

        server.stop();
    }

    #[test]
    fn test_bind_error_is_setup_failure() {
        let first = TestServer::start(1);
        let config = Config {
            listen: first.addr.to_string(),
            ..Config::default()
        };

        // SO_REUSEADDR does not allow two listeners on the same port.
        assert!(matches!(Server::bind(config), Err(ServerError::Bind(..))));
        first.stop();
    }

    #[test]
    fn test_unresolvable_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..Config::default()
        };
        assert!(matches!(Server::bind(config), Err(ServerError::Address(..))));
    }

    #[test]
    fn test_wake_address() {
        let any = SocketAddr::from(([0, 0, 0, 0], 9000));
        assert_eq!(wake_address(any), SocketAddr::from(([127, 0, 0, 1], 9000)));

        let local = SocketAddr::from(([10, 0, 0, 2], 9000));
        assert_eq!(wake_address(local), local);
    }
}

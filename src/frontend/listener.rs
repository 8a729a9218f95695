//! Protocol listener implementation.
//!
//! Binds a listening socket, accepts connections on the acceptor pool, and
//! runs one pipeline per connection on the worker pool.

use crate::config::Protocol;
use crate::metrics::MetricsCollector;
use crate::pipeline::{ConnectionContext, PipelineFactory, ProtocolSpec};
use crate::pools::ExecutionPools;
use crate::util::{CloseSignal, ConnectionId, DrainSignal};
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// How long force-closed connections get to unwind after the drain timeout.
const FORCE_GRACE: Duration = Duration::from_millis(500);

/// Errors that can occur while bringing up a listener.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {protocol} listener on {address}: {source}")]
    Socket {
        protocol: Protocol,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot start {protocol} listener: execution pools are closed")]
    PoolClosed { protocol: Protocol },
}

/// Socket options shared by every listener.
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub address: SocketAddr,
    pub backlog: u32,
    pub keepalive: bool,
}

/// How a drain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished within the timeout.
    Graceful,
    /// The timeout expired and `remaining` connections were force-closed.
    Forced { remaining: usize },
}

impl DrainOutcome {
    pub fn is_graceful(&self) -> bool {
        matches!(self, DrainOutcome::Graceful)
    }
}

/// A bound, accepting listener for one protocol.
pub struct Listener {
    protocol: Protocol,
    local_addr: SocketAddr,
    signal: DrainSignal,
    connections: TaskTracker,
    accept_task: JoinHandle<()>,
    close_signal: CloseSignal,
}

fn bind_socket(settings: &SocketSettings) -> io::Result<std::net::TcpListener> {
    let address = settings.address;
    let socket = Socket::new(
        Domain::for_address(address),
        Type::STREAM,
        Some(SockProtocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(settings.backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket.into())
}

impl Listener {
    /// Bind the socket for `spec` and start accepting on the acceptor pool.
    pub fn bind(
        spec: ProtocolSpec,
        settings: SocketSettings,
        factory: Arc<PipelineFactory>,
        pools: &ExecutionPools,
        metrics: MetricsCollector,
    ) -> Result<Self, BindError> {
        let protocol = spec.protocol();
        let address = SocketAddr::new(settings.address.ip(), spec.port);
        let settings = SocketSettings { address, ..settings };
        let socket_error = |source: io::Error| BindError::Socket {
            protocol,
            address,
            source,
        };

        if pools.is_closed() {
            return Err(BindError::PoolClosed { protocol });
        }

        let std_listener = bind_socket(&settings).map_err(socket_error)?;
        let listener = {
            let _guard = pools.enter_acceptor();
            TcpListener::from_std(std_listener).map_err(socket_error)?
        };
        let local_addr = listener.local_addr().map_err(socket_error)?;

        let signal = DrainSignal::new();
        let connections = TaskTracker::new();

        let accept_loop = AcceptLoop {
            protocol,
            spec,
            listener,
            factory,
            pools: pools.clone(),
            metrics,
            signal: signal.clone(),
            connections: connections.clone(),
            keepalive: settings.keepalive,
        };
        let accept_task = pools
            .spawn_acceptor(accept_loop.run())
            .map_err(|_| BindError::PoolClosed { protocol })?;

        info!(
            protocol = %protocol,
            address = %local_addr,
            backlog = settings.backlog,
            "listener bound"
        );

        Ok(Self {
            protocol,
            local_addr,
            signal,
            connections,
            accept_task,
            close_signal: CloseSignal::new(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The address actually bound, with the OS-assigned port if 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolved once [`drain`](Self::drain) completes.
    pub fn close_signal(&self) -> CloseSignal {
        self.close_signal.clone()
    }

    /// Number of connections still open.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, let live connections finish, and force-close whatever
    /// is left after `timeout`.
    #[instrument(skip_all, fields(protocol = %self.protocol, address = %self.local_addr))]
    pub async fn drain(self, timeout: Duration) -> DrainOutcome {
        self.signal.begin_drain();

        // The accept loop drops the listening socket when it exits.
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "accept loop terminated abnormally");
        }
        self.connections.close();

        let outcome = match tokio::time::timeout(timeout, self.connections.wait()).await {
            Ok(()) => DrainOutcome::Graceful,
            Err(_) => {
                let remaining = self.connections.len();
                warn!(
                    remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown timeout reached, force-closing connections"
                );
                self.signal.force();
                if tokio::time::timeout(FORCE_GRACE, self.connections.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        remaining = self.connections.len(),
                        "connections still unwinding after force-close"
                    );
                }
                DrainOutcome::Forced { remaining }
            }
        };

        self.close_signal.resolve();
        info!(graceful = outcome.is_graceful(), "listener closed");
        outcome
    }
}

struct AcceptLoop {
    protocol: Protocol,
    spec: ProtocolSpec,
    listener: TcpListener,
    factory: Arc<PipelineFactory>,
    pools: ExecutionPools,
    metrics: MetricsCollector,
    signal: DrainSignal,
    connections: TaskTracker,
    keepalive: bool,
}

impl AcceptLoop {
    async fn run(self) {
        debug!(protocol = %self.protocol, "accept loop starting");

        loop {
            tokio::select! {
                biased;

                _ = self.signal.draining() => {
                    debug!(protocol = %self.protocol, "accept loop stopping");
                    break;
                }

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            warn!(protocol = %self.protocol, error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// Hand an accepted socket to the worker pool.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if self.keepalive {
            if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                warn!(error = %e, "failed to set SO_KEEPALIVE on accepted connection");
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on accepted connection");
        }

        // Re-register on the worker side so the connection's I/O is driven
        // by the pool that runs it.
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to detach accepted connection");
                return;
            }
        };

        let ctx = ConnectionContext {
            id: ConnectionId::next(),
            peer,
            protocol: self.protocol,
            signal: self.signal.clone(),
            metrics: self.metrics.clone(),
        };
        let pipeline = self.factory.build(&self.spec);

        let work = self.connections.track_future(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => {
                    pipeline.run(stream, ctx).await;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "failed to register connection with worker");
                }
            }
        });

        if self.pools.spawn_worker(work).is_err() {
            warn!(protocol = %self.protocol, peer = %peer, "worker pool closed, rejecting connection");
            self.metrics.connection_rejected(self.protocol);
        }
    }
}

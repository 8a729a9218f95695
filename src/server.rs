//! Server lifecycle: bind every listener atomically, drain them on stop.

use crate::config::{Config, Protocol};
use crate::frontend::{BindError, DrainOutcome, Listener, SocketSettings};
use crate::metrics::{MetricsCollector, MetricsServer};
use crate::pipeline::{PipelineFactory, ProtocolSpec, Sinks};
use crate::pools::ExecutionPools;
use futures::future::join_all;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// A listener failed to bind during start. Terminal.
    Failed,
}

/// Returned by a successful [`Server::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    listeners: Vec<(Protocol, SocketAddr)>,
}

impl Ready {
    /// Bound address of the listener for `protocol`.
    pub fn addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(p, _)| *p == protocol)
            .map(|(_, addr)| *addr)
    }

    /// Every listener, in startup order.
    pub fn listeners(&self) -> &[(Protocol, SocketAddr)] {
        &self.listeners
    }
}

/// Returned by [`Server::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    /// Listeners drained by this call. Zero when there was nothing to stop.
    pub listeners_drained: usize,
    /// Whether every connection and pool task finished before the timeout.
    pub graceful: bool,
}

impl Stopped {
    fn noop() -> Self {
        Self {
            listeners_drained: 0,
            graceful: true,
        }
    }
}

/// Errors that can occur during [`Server::start`].
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to start execution pools: {0}")]
    Pools(#[source] io::Error),

    #[error("cannot start server in state {0:?}")]
    InvalidState(ServerState),
}

struct Running {
    pools: ExecutionPools,
    listeners: Vec<Listener>,
    metrics_shutdown: Option<CancellationToken>,
}

/// Owns the execution pools and all three listeners.
pub struct Server {
    config: Config,
    factory: Arc<PipelineFactory>,
    metrics: MetricsCollector,
    state: Mutex<ServerState>,
    running: Mutex<Option<Running>>,
    bound: Mutex<Vec<(Protocol, SocketAddr)>>,
}

impl Server {
    pub fn new(config: Config, sinks: Sinks) -> Self {
        Self {
            config,
            factory: Arc::new(PipelineFactory::new(sinks)),
            metrics: MetricsCollector::new(),
            state: Mutex::new(ServerState::Idle),
            running: Mutex::new(None),
            bound: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Bound address of the listener for `protocol`, while running.
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.bound
            .lock()
            .iter()
            .find(|(p, _)| *p == protocol)
            .map(|(_, addr)| *addr)
    }

    /// Number of listeners currently bound.
    pub fn bound_listeners(&self) -> usize {
        self.bound.lock().len()
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    /// Acquire the pools and bind every listener.
    ///
    /// Either all listeners end up bound, or none do: a bind failure drains
    /// the listeners bound so far and releases the pools before returning.
    pub async fn start(&self) -> Result<Ready, StartupError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Idle {
                return Err(StartupError::InvalidState(*state));
            }
            *state = ServerState::Starting;
        }
        info!("server starting");

        let pools = match ExecutionPools::acquire(&self.config.pools) {
            Ok(pools) => pools,
            Err(e) => {
                error!(error = %e, "failed to start execution pools");
                self.set_state(ServerState::Failed);
                return Err(StartupError::Pools(e));
            }
        };

        let settings = SocketSettings {
            address: self.config.listen_addr(0),
            backlog: self.config.backlog,
            keepalive: self.config.keepalive,
        };

        let mut listeners: Vec<Listener> = Vec::new();
        for spec in ProtocolSpec::all(&self.config) {
            match Listener::bind(
                spec,
                settings,
                Arc::clone(&self.factory),
                &pools,
                self.metrics.clone(),
            ) {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    error!(error = %e, bound = listeners.len(), "bind failed, rolling back");
                    join_all(listeners.into_iter().map(|l| l.drain(Duration::ZERO))).await;
                    pools.shutdown(Duration::ZERO).await;
                    self.set_state(ServerState::Failed);
                    return Err(e.into());
                }
            }
        }

        let metrics_shutdown = self.spawn_metrics_server(&pools);

        let ready = Ready {
            listeners: listeners
                .iter()
                .map(|l| (l.protocol(), l.local_addr()))
                .collect(),
        };
        *self.bound.lock() = ready.listeners.clone();
        *self.running.lock() = Some(Running {
            pools,
            listeners,
            metrics_shutdown,
        });
        self.set_state(ServerState::Running);

        for (protocol, address) in ready.listeners() {
            info!(protocol = %protocol, address = %address, "listening");
        }
        info!("server running");

        Ok(ready)
    }

    fn spawn_metrics_server(&self, pools: &ExecutionPools) -> Option<CancellationToken> {
        let metrics_config = &self.config.global.metrics;
        if !metrics_config.enabled {
            return None;
        }

        let shutdown = CancellationToken::new();
        let server = MetricsServer::new(
            metrics_config.address,
            metrics_config.path.clone(),
            self.metrics.clone(),
        );
        match pools.spawn_acceptor(server.run(shutdown.clone())) {
            Ok(_) => Some(shutdown),
            Err(e) => {
                warn!(error = %e, "metrics server not started");
                None
            }
        }
    }

    /// Drain every listener and release the pools.
    ///
    /// Always reaches [`ServerState::Stopped`] from `Running`. Calls made
    /// while already stopping or stopped return immediately.
    ///
    /// Connections still open after `timeout` are force-closed and get a
    /// short grace period to unwind. The pools only get whatever is left of
    /// `timeout` once the listeners are done.
    pub async fn stop(&self, timeout: Duration) -> Stopped {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                ServerState::Running => *state = ServerState::Stopping,
                ServerState::Idle => *state = ServerState::Stopped,
                _ => {}
            }
            previous
        };

        match previous {
            ServerState::Running => {}
            ServerState::Idle => {
                info!("server stopped before start");
                return Stopped::noop();
            }
            ServerState::Starting => {
                warn!("stop requested while starting, ignoring");
                return Stopped::noop();
            }
            ServerState::Stopping | ServerState::Stopped | ServerState::Failed => {
                return Stopped::noop();
            }
        }

        info!(timeout_ms = timeout.as_millis() as u64, "server stopping");
        let deadline = Instant::now() + timeout;

        let Some(running) = self.running.lock().take() else {
            self.set_state(ServerState::Stopped);
            return Stopped::noop();
        };

        if let Some(shutdown) = running.metrics_shutdown {
            shutdown.cancel();
        }

        let listeners_drained = running.listeners.len();
        let outcomes = join_all(running.listeners.into_iter().map(|l| l.drain(timeout))).await;
        let mut graceful = outcomes.iter().all(DrainOutcome::is_graceful);

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !running.pools.shutdown(remaining).await {
            graceful = false;
        }

        self.bound.lock().clear();
        self.set_state(ServerState::Stopped);
        info!(listeners_drained, graceful, "server stopped");

        Stopped {
            listeners_drained,
            graceful,
        }
    }
}

//! Shared acceptor and worker thread pools.
//!
//! Every listener runs its accept loop on the acceptor pool and hands each
//! accepted connection to the worker pool. Both pools are owned by the
//! server and released only after every listener has stopped.

use crate::config::PoolConfig;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{EnterGuard, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Work submitted after the pools were shut down.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("execution pool is closed")]
    Closed,
}

/// Handle to the acceptor and worker pools. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionPools {
    inner: Arc<PoolsInner>,
}

struct PoolsInner {
    acceptor: Handle,
    worker: Handle,
    runtimes: Mutex<Option<(Runtime, Runtime)>>,
    work: TaskTracker,
    closed: AtomicBool,
    acceptor_threads: usize,
    worker_threads: usize,
}

fn build_runtime(name: &str, threads: usize) -> io::Result<Runtime> {
    if threads == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{name} pool needs at least one thread"),
        ));
    }
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(name)
        .enable_all()
        .build()
}

impl ExecutionPools {
    /// Start both pools, sized from `config`.
    pub fn acquire(config: &PoolConfig) -> io::Result<Self> {
        let acceptor_threads = config.acceptor_threads();
        let worker_threads = config.worker_threads();

        let acceptor = build_runtime("netgate-acceptor", acceptor_threads)?;
        let worker = build_runtime("netgate-worker", worker_threads)?;

        info!(acceptor_threads, worker_threads, "execution pools started");

        Ok(Self {
            inner: Arc::new(PoolsInner {
                acceptor: acceptor.handle().clone(),
                worker: worker.handle().clone(),
                runtimes: Mutex::new(Some((acceptor, worker))),
                work: TaskTracker::new(),
                closed: AtomicBool::new(false),
                acceptor_threads,
                worker_threads,
            }),
        })
    }

    pub fn acceptor_threads(&self) -> usize {
        self.inner.acceptor_threads
    }

    pub fn worker_threads(&self) -> usize {
        self.inner.worker_threads
    }

    /// Run a long-lived task, such as an accept loop, on the acceptor pool.
    pub fn spawn_acceptor<F>(&self, future: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(self.inner.acceptor.spawn(future))
    }

    /// Queue connection work on the worker pool. Never waits for a free thread.
    pub fn spawn_worker<F>(&self, future: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(self.inner.worker.spawn(self.inner.work.track_future(future)))
    }

    /// Enter the acceptor runtime so new sockets register with its reactor.
    pub fn enter_acceptor(&self) -> EnterGuard<'_> {
        self.inner.acceptor.enter()
    }

    /// Number of worker tasks still running.
    pub fn in_flight(&self) -> usize {
        self.inner.work.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Refuse new work, wait up to `timeout` for in-flight work, then stop
    /// both pools. Returns `true` if all work finished in time.
    ///
    /// Calling this more than once is harmless; later calls return `true`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.inner.work.close();

        let graceful = tokio::time::timeout(timeout, self.inner.work.wait())
            .await
            .is_ok();
        if !graceful {
            warn!(
                in_flight = self.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "worker pool did not finish in time, terminating remaining work"
            );
        }

        if let Some((acceptor, worker)) = self.inner.runtimes.lock().take() {
            acceptor.shutdown_background();
            worker.shutdown_background();
        }

        info!(graceful, "execution pools released");
        graceful
    }
}

impl Drop for PoolsInner {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside another runtime.
        if let Some((acceptor, worker)) = self.runtimes.get_mut().take() {
            acceptor.shutdown_background();
            worker.shutdown_background();
        }
    }
}

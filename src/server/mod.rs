//! Listener, dispatch and lifecycle.
//!
//! A [`Server`] ties an acceptor thread to a dispatcher. In the default
//! [`DispatchMode::Pool`](crate::DispatchMode::Pool) the dispatcher is a [`WorkerPool`]: the
//! acceptor pushes every accepted [`Connection`](crate::Connection) onto a pending queue and
//! a fixed number of workers claim them one at a time. With
//! [`DispatchMode::PerConnection`](crate::DispatchMode::PerConnection) each connection gets
//! its own session thread tracked by a [`SessionRegistry`].
//!
//! Stopping the server clears the run flag and joins the acceptor; the acceptor shuts the
//! dispatcher down on its way out, so by the time [`Server::stop`] returns every worker has
//! been joined and every connection closed.
mod acceptor;
mod dispatch;
pub mod pool;
pub mod queue;
pub mod registry;

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{info, warn};
use thiserror::Error;

use crate::{Handler, ServerConfig};

pub use pool::{PoolError, PoolState, WorkerPool};
pub use queue::PendingQueue;
pub use registry::{RegistryError, SessionRegistry};

use acceptor::Acceptor;
use dispatch::Dispatcher;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("acceptor thread panicked")]
    AcceptorPanicked,
}

pub struct Server {
    config: ServerConfig,
    running: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
    // Held for the whole of start() and stop() so the two never interleave.
    lifecycle: Mutex<Option<Listening>>,
}

struct Listening {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl Handler) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::InvalidConfig)?;
        let dispatcher = Dispatcher::new(&config, Arc::new(handler))?;

        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: Arc::new(dispatcher),
            lifecycle: Mutex::new(None),
        })
    }

    /// Binds the listening socket, starts the dispatcher and launches the accept loop.
    /// Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle();
        if self.running.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        reap_failed(lifecycle.take());

        let acceptor = Acceptor::bind(&self.config)?;
        let local_addr = acceptor.local_addr();
        self.dispatcher.start()?;
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let dispatcher = Arc::clone(&self.dispatcher);
        let spawned = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run(&running, &dispatcher));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.dispatcher.shutdown();
                return Err(ServerError::Transport(e));
            }
        };

        info!(
            "server started on {local_addr} with {} workers ({:?})",
            self.config.workers, self.config.dispatch
        );
        *lifecycle = Some(Listening {
            local_addr,
            acceptor: handle,
        });
        Ok(local_addr)
    }

    /// Stops accepting, then waits for the acceptor to wind the dispatcher down.
    pub fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle();
        if !self.running.swap(false, Ordering::SeqCst) {
            reap_failed(lifecycle.take());
            return Err(ServerError::NotRunning);
        }

        let Some(listening) = lifecycle.take() else {
            return Err(ServerError::NotRunning);
        };

        listening
            .acceptor
            .join()
            .map_err(|_| ServerError::AcceptorPanicked)?;
        info!("server on {} stopped", listening.local_addr);
        Ok(())
    }

    /// False once [`stop`](Self::stop) has been called, and also after the acceptor gave up
    /// on a failed listener. Either way the server can be started again.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().as_ref().map(|l| l.local_addr)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Listening>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Joins an acceptor that exited on its own after a listener failure.
fn reap_failed(listening: Option<Listening>) {
    if let Some(listening) = listening {
        if listening.acceptor.join().is_err() {
            warn!("acceptor on {} panicked", listening.local_addr);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

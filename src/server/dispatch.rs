use std::sync::Arc;

use log::warn;

use crate::{Connection, DispatchMode, Handler, ServerConfig};

use super::{
    pool::{PoolError, WorkerPool},
    registry::SessionRegistry,
};

/// Where the acceptor sends connections, chosen by [`DispatchMode`].
pub enum Dispatcher {
    Pool(WorkerPool),
    PerConnection(SessionRegistry),
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, PoolError> {
        Ok(match config.dispatch {
            DispatchMode::Pool => Dispatcher::Pool(WorkerPool::new(config, handler)?),
            DispatchMode::PerConnection => {
                Dispatcher::PerConnection(SessionRegistry::new(config, handler))
            }
        })
    }

    pub fn start(&self) -> Result<(), PoolError> {
        match self {
            Dispatcher::Pool(pool) => pool.start_workers(),
            Dispatcher::PerConnection(_) => Ok(()),
        }
    }

    pub fn dispatch(&self, connection: Connection) {
        match self {
            Dispatcher::Pool(pool) => pool.push(connection),
            Dispatcher::PerConnection(registry) => {
                if let Err(e) = registry.add(connection) {
                    warn!("could not start session: {e}");
                }
            }
        }
    }

    /// Housekeeping done once per acceptor loop turn.
    pub fn tick(&self) {
        if let Dispatcher::PerConnection(registry) = self {
            registry.reap();
        }
    }

    pub fn shutdown(&self) {
        match self {
            Dispatcher::Pool(pool) => {
                if let Err(e) = pool.stop_workers() {
                    warn!("failed to stop worker pool: {e}");
                }
            }
            Dispatcher::PerConnection(registry) => registry.terminate_all(),
        }
    }
}

//! Sessions: one connection, its typed I/O, and a start/stop contract.
//!
//! A [`Session`] owns exactly one [`Connection`] for its whole life and closes it exactly
//! once, when the session is dropped. It can be driven two ways:
//!
//! - inline, with [`Session::run`], on whatever thread owns it (this is what pool workers do);
//! - on a dedicated handler thread, with [`Session::start`] and later [`Session::stop`] (this
//!   is what the session registry does).
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──→ Running ──stop()──→ Stopping ──join──→ Terminated
//! ```
//!
//! Transitions only move forward. A session that is never started stays `Idle` until it is
//! dropped.
//!
//! Stopping is cooperative: it cancels the session's [`CancelToken`] and joins the handler
//! thread. The handler notices at its next transfer attempt, which the connection's read
//! timeout guarantees will come around.
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    Connection, Handler,
    cancel::CancelToken,
    protocol::{Codec, WireError},
};

pub type SessionId = u64;

/// The I/O surface a handler works with.
pub type SessionIo = Codec<Connection>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyStarted,
    #[error("session was never started")]
    NotStarted,
    #[error("session has terminated")]
    Terminated,
    #[error("failed to spawn handler thread: {0}")]
    Spawn(std::io::Error),
    #[error("handler panicked")]
    HandlerPanicked,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Terminated,
}

/// Capability a session uses to tell whoever tracks it that it is finished.
///
/// It is called with the session's id when its handler returns on its own and when
/// [`Session::stop`] completes. It must not block on the session itself.
#[derive(Clone)]
pub struct Deregister(Arc<dyn Fn(SessionId) + Send + Sync>);

impl Deregister {
    pub fn new(f: impl Fn(SessionId) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn notify(&self, id: SessionId) {
        (self.0)(id)
    }
}

impl fmt::Debug for Deregister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deregister")
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: String,
    state: SessionState,
    cancel: CancelToken,
    io: Option<SessionIo>,
    handler: Option<JoinHandle<SessionIo>>,
    deregister: Option<Deregister>,
}

impl Session {
    /// Takes ownership of `connection`. `cancel` is normally a child of the owner's token so
    /// that stopping the owner also interrupts this session.
    pub fn new(id: SessionId, connection: Connection, cancel: CancelToken) -> Self {
        let peer = connection.peer_addr().to_string();
        let io = Codec::with_cancel(connection, cancel.clone());

        Self {
            id,
            peer,
            state: SessionState::Idle,
            cancel,
            io: Some(io),
            handler: None,
            deregister: None,
        }
    }

    pub fn with_max_string_len(mut self, max: u32) -> Self {
        self.io = self.io.take().map(|io| io.with_max_string_len(max));
        self
    }

    pub fn with_deregister(mut self, deregister: Deregister) -> Self {
        self.deregister = Some(deregister);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs `handler` to completion on the calling thread, then disposes of the session.
    pub fn run(mut self, handler: &dyn Handler) -> Result<(), SessionError> {
        let Some(mut io) = self.io.take() else {
            return Err(SessionError::Terminated);
        };

        let result = execute(handler, &mut io);
        report(self.id, &self.peer, &result);

        self.io = Some(io);
        result
    }

    /// Launches `handler` on a dedicated thread.
    pub fn start(&mut self, handler: Arc<dyn Handler>) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Running | SessionState::Stopping => {
                return Err(SessionError::AlreadyStarted);
            }
            SessionState::Terminated => return Err(SessionError::Terminated),
        }
        let Some(mut io) = self.io.take() else {
            return Err(SessionError::Terminated);
        };

        let id = self.id;
        let peer = self.peer.clone();
        let deregister = self.deregister.clone();

        let spawned = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                debug!("session {id} handler started for {peer}");
                let result = execute(handler.as_ref(), &mut io);
                report(id, &peer, &result);

                if let Some(deregister) = deregister {
                    deregister.notify(id);
                }
                io
            });

        match spawned {
            Ok(handle) => {
                self.handler = Some(handle);
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                // The connection went down with the closure that failed to spawn.
                self.state = SessionState::Terminated;
                Err(SessionError::Spawn(e))
            }
        }
    }

    /// Stops the handler thread, then notifies the owner through the deregistration
    /// capability.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let result = self.force_stop_local();

        if let Some(deregister) = &self.deregister {
            if !matches!(result, Err(SessionError::NotStarted | SessionError::Terminated)) {
                deregister.notify(self.id);
            }
        }
        result
    }

    /// Stops the handler thread without notifying the owner. Used when the owner is the one
    /// doing the stopping.
    pub fn force_stop_local(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Running => {}
            SessionState::Idle => return Err(SessionError::NotStarted),
            SessionState::Stopping | SessionState::Terminated => {
                return Err(SessionError::Terminated);
            }
        }

        self.state = SessionState::Stopping;
        self.cancel.cancel();

        let joined = match self.handler.take() {
            Some(handle) => handle.join(),
            None => {
                self.state = SessionState::Terminated;
                return Err(SessionError::NotStarted);
            }
        };
        self.state = SessionState::Terminated;
        debug!("session {} stopped", self.id);

        match joined {
            Ok(io) => {
                self.io = Some(io);
                Ok(())
            }
            Err(_) => Err(SessionError::HandlerPanicked),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Running {
            if let Err(e) = self.force_stop_local() {
                warn!("session {} did not stop cleanly: {e}", self.id);
            }
        }

        if let Some(io) = self.io.take() {
            io.into_inner().close();
        }
    }
}

fn execute(handler: &dyn Handler, io: &mut SessionIo) -> Result<(), SessionError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(io)))
        .unwrap_or(Err(SessionError::HandlerPanicked))
}

fn report(id: SessionId, peer: &str, result: &Result<(), SessionError>) {
    match result {
        Ok(()) => debug!("session {id} ({peer}) finished"),
        Err(SessionError::Wire(WireError::ConnectionClosed)) => {
            debug!("session {id} ({peer}) closed by peer")
        }
        Err(SessionError::Wire(WireError::Interrupted)) => {
            debug!("session {id} ({peer}) interrupted by stop request")
        }
        Err(e) => warn!("session {id} ({peer}) failed: {e}"),
    }
}

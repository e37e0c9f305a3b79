//! One handler thread per connection.
//!
//! The [`SessionRegistry`] is the unbounded alternative to the worker pool: every accepted
//! connection becomes a [`Session`] started on its own thread and tracked by id until it
//! finishes or is removed.
//!
//! Sessions never hold a reference back to the registry. Each one is handed a
//! [`Deregister`] capability that posts its id to a channel; [`SessionRegistry::reap`]
//! drains that channel and disposes of the sessions it names, so removal never re-enters
//! the registry lock from a session's own thread.
//!
//! Every session's [`CancelToken`] is a child of the registry's root token, so
//! [`SessionRegistry::terminate_all`] interrupts all of them at once before joining any.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver},
    },
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    Connection, Handler, ServerConfig,
    cancel::CancelToken,
    session::{Deregister, Session, SessionError, SessionId},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no session with id {0}")]
    NotFound(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct SessionRegistry {
    handler: Arc<dyn Handler>,
    max_string_len: u32,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Session>>,
    finished: Mutex<Receiver<SessionId>>,
    deregister: Deregister,
    // Replaced after every terminate_all so the registry can be reused.
    cancel: Mutex<CancelToken>,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let deregister = Deregister::new(move |id| {
            // The receiver only goes away with the registry itself.
            let _ = sender.send(id);
        });

        Self {
            handler,
            max_string_len: config.max_string_len,
            next_id: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(receiver),
            deregister,
            cancel: Mutex::new(CancelToken::new()),
        }
    }

    /// Wraps `connection` in a session and starts its handler thread.
    pub fn add(&self, connection: Connection) -> Result<SessionId, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel().child();
        let mut session = Session::new(id, connection, cancel)
            .with_max_string_len(self.max_string_len)
            .with_deregister(self.deregister.clone());

        // Insert before the handler can report back, so `reap` always finds the entry.
        let mut sessions = self.sessions();
        session.start(Arc::clone(&self.handler))?;
        debug!("registered session {id} for {}", session.peer_addr());
        sessions.insert(id, session);

        Ok(id)
    }

    /// Stops and disposes of one session.
    pub fn remove(&self, id: SessionId) -> Result<(), RegistryError> {
        let session = self.sessions().remove(&id);
        let mut session = session.ok_or(RegistryError::NotFound(id))?;

        // The registry is driving this stop, so the session must not call back into it.
        session.force_stop_local()?;
        Ok(())
    }

    /// Disposes of every session that has reported itself finished. Returns how many were
    /// removed.
    pub fn reap(&self) -> usize {
        let ids: Vec<SessionId> = self.finished().try_iter().collect();

        let mut reaped = 0;
        for id in ids {
            // Already removed explicitly, or stopped twice.
            let Some(mut session) = self.sessions().remove(&id) else {
                continue;
            };
            if let Err(e) = session.force_stop_local() {
                warn!("failed to stop session {id}: {e}");
            }
            reaped += 1;
        }

        if reaped > 0 {
            debug!("reaped {reaped} finished sessions");
        }
        reaped
    }

    /// Stops every tracked session and forgets any pending exit notices.
    ///
    /// All sessions are cancelled before the first join, so the whole call is bounded by a
    /// single read timeout rather than one per session.
    pub fn terminate_all(&self) {
        let root = std::mem::take(&mut *self.cancel());
        root.cancel();

        let sessions: Vec<Session> = self.sessions().drain().map(|(_, s)| s).collect();
        let count = sessions.len();

        for mut session in sessions {
            if let Err(e) = session.force_stop_local() {
                warn!("failed to stop session {}: {e}", session.id());
            }
        }
        self.finished().try_iter().for_each(drop);

        debug!("terminated {count} sessions");
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions().contains_key(&id)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) -> MutexGuard<'_, CancelToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finished(&self) -> MutexGuard<'_, Receiver<SessionId>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        thread,
        time::{Duration, Instant},
    };

    use crate::{SessionIo, connection::tests::pair};

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn registry(handler: Arc<dyn Handler>) -> SessionRegistry {
        SessionRegistry::new(&ServerConfig::default(), handler)
    }

    fn silent_reader() -> Arc<dyn Handler> {
        Arc::new(|io: &mut SessionIo| -> Result<(), SessionError> {
            loop {
                io.recv_i32()?;
            }
        })
    }

    fn assert_closed(client: &mut TcpStream) {
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn add_and_remove() {
        let registry = registry(silent_reader());
        let (conn, mut client) = pair(TIMEOUT);

        let id = registry.add(conn).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        registry.remove(id).unwrap();
        assert!(registry.is_empty());
        assert_closed(&mut client);
    }

    #[test]
    fn removing_unknown_session_is_an_error() {
        let registry = registry(silent_reader());
        let (conn, _client) = pair(TIMEOUT);
        let id = registry.add(conn).unwrap();

        assert!(matches!(
            registry.remove(id + 100),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn finished_sessions_are_reaped() {
        let registry = registry(Arc::new(
            |io: &mut SessionIo| -> Result<(), SessionError> {
                let n = io.recv_i32()?;
                io.send_i32(n * 2)?;
                Ok(())
            },
        ));
        let (conn, mut client) = pair(TIMEOUT);
        let id = registry.add(conn).unwrap();

        client.write_all(&21i32.to_be_bytes()).unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(i32::from_be_bytes(reply), 42);

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.reap() == 0 {
            assert!(Instant::now() < deadline, "session never reported back");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!registry.contains(id));
        assert_closed(&mut client);
    }

    #[test]
    fn removed_session_is_not_reaped_again() {
        let registry = registry(silent_reader());
        let (conn, _client) = pair(TIMEOUT);
        let id = registry.add(conn).unwrap();

        // The handler thread still posts its exit notice while being removed.
        registry.remove(id).unwrap();
        assert_eq!(registry.reap(), 0);
    }

    #[test]
    fn terminate_all_stops_everything() {
        let registry = registry(silent_reader());
        let mut clients = Vec::new();
        for _ in 0..4 {
            let (conn, client) = pair(TIMEOUT);
            registry.add(conn).unwrap();
            clients.push(client);
        }
        assert_eq!(registry.len(), 4);

        registry.terminate_all();
        assert!(registry.is_empty());
        assert_eq!(registry.reap(), 0);
        for client in &mut clients {
            assert_closed(client);
        }
    }

    #[test]
    fn terminate_all_cancels_sessions_together() {
        let io_timeout = Duration::from_millis(300);
        let registry = registry(silent_reader());
        let mut clients = Vec::new();
        for _ in 0..6 {
            let (conn, client) = pair(io_timeout);
            registry.add(conn).unwrap();
            clients.push(client);
        }

        let started = Instant::now();
        registry.terminate_all();
        let elapsed = started.elapsed();

        // One timeout period for all six, not one each.
        assert!(elapsed < io_timeout * 2 + io_timeout / 3, "took {elapsed:?}");
        for client in &mut clients {
            assert_closed(client);
        }
    }

    #[test]
    fn registry_is_usable_after_terminate_all() {
        let registry = registry(Arc::new(
            |io: &mut SessionIo| -> Result<(), SessionError> {
                let n = io.recv_i32()?;
                io.send_i32(n + 1)?;
                Ok(())
            },
        ));
        registry.terminate_all();

        let (conn, mut client) = pair(TIMEOUT);
        registry.add(conn).unwrap();
        client.write_all(&1i32.to_be_bytes()).unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(i32::from_be_bytes(reply), 2);
    }
}

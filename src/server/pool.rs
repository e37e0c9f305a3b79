use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{Connection, Handler, ServerConfig, Session, cancel::CancelToken};

use super::queue::PendingQueue;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Running,
    Stopping,
}

/// A fixed set of worker threads pulling connections off a shared [`PendingQueue`].
///
/// Each worker runs one session at a time, inline, so no more than `size` handlers are ever
/// active. Idle workers poll the queue every `poll_interval`.
pub struct WorkerPool {
    size: usize,
    poll_interval: Duration,
    max_string_len: u32,
    handler: Arc<dyn Handler>,
    queue: Arc<PendingQueue>,
    next_session: Arc<AtomicU64>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug)]
struct Lifecycle {
    state: PoolState,
    cancel: CancelToken,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(config: &ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        Ok(Self {
            size: config.workers,
            poll_interval: config.poll_interval,
            max_string_len: config.max_string_len,
            handler,
            queue: Arc::new(PendingQueue::new()),
            next_session: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::Stopped,
                cancel: CancelToken::new(),
                workers: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle().state
    }

    pub fn start_workers(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != PoolState::Stopped {
            return Err(PoolError::AlreadyRunning);
        }

        let cancel = CancelToken::new();
        let mut workers = Vec::with_capacity(self.size);

        for id in 0..self.size {
            let context = WorkerContext {
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                cancel: cancel.clone(),
                next_session: Arc::clone(&self.next_session),
                poll_interval: self.poll_interval,
                max_string_len: self.max_string_len,
            };

            match Worker::spawn(id, context) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    cancel.cancel();
                    for worker in workers {
                        worker.join();
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!("started {} workers", self.size);
        *lifecycle = Lifecycle {
            state: PoolState::Running,
            cancel,
            workers,
        };
        Ok(())
    }

    /// Queues a connection for the next idle worker.
    pub fn push(&self, connection: Connection) {
        self.queue.push(connection);
    }

    /// Stops every worker, then closes whatever was still waiting in the queue. Returns how
    /// many queued connections were closed without ever reaching a session.
    pub fn stop_workers(&self) -> Result<usize, PoolError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != PoolState::Running {
            return Err(PoolError::NotRunning);
        }

        lifecycle.state = PoolState::Stopping;
        lifecycle.cancel.cancel();

        for worker in lifecycle.workers.drain(..) {
            worker.join();
        }

        let pending = self.queue.drain();
        let drained = pending.len();
        for connection in pending {
            connection.close();
        }

        lifecycle.state = PoolState::Stopped;
        info!("stopped workers, closed {drained} unclaimed connections");
        Ok(drained)
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.state() == PoolState::Running {
            let _ = self.stop_workers();
        }
    }
}

struct WorkerContext {
    queue: Arc<PendingQueue>,
    handler: Arc<dyn Handler>,
    cancel: CancelToken,
    next_session: Arc<AtomicU64>,
    poll_interval: Duration,
    max_string_len: u32,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(id: usize, context: WorkerContext) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || context.work(id))?;

        Ok(Self { id, thread })
    }

    fn join(self) {
        debug!("shutting down worker {}", self.id);
        if self.thread.join().is_err() {
            warn!("worker {} panicked", self.id);
        }
    }
}

impl WorkerContext {
    fn work(self, id: usize) {
        debug!("worker {id} started");

        while !self.cancel.is_cancelled() {
            let Some(connection) = self.queue.pop() else {
                thread::sleep(self.poll_interval);
                continue;
            };

            let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
            debug!(
                "worker {id} handling session {session_id} from {}",
                connection.peer_addr()
            );

            let session = Session::new(session_id, connection, self.cancel.child())
                .with_max_string_len(self.max_string_len);
            // Failures are logged by the session and stay confined to it.
            let _ = session.run(self.handler.as_ref());
        }

        debug!("worker {id} stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::TcpStream,
        sync::atomic::AtomicUsize,
        time::Instant,
    };

    use crate::{SessionError, SessionIo, connection::tests::pair};

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn config(workers: usize) -> ServerConfig {
        ServerConfig::new(0, workers).with_poll_interval(Duration::from_millis(10))
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(|_: &mut SessionIo| -> Result<(), SessionError> { Ok(()) })
    }

    fn assert_closed(client: &mut TcpStream) {
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    fn wait_for(counter: &AtomicUsize, target: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < target {
            assert!(Instant::now() < deadline, "timed out waiting for handlers");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            WorkerPool::new(&config(0), noop()),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn lifecycle_misuse_is_rejected() {
        let pool = WorkerPool::new(&config(2), noop()).unwrap();

        assert!(matches!(pool.stop_workers(), Err(PoolError::NotRunning)));
        pool.start_workers().unwrap();
        assert!(matches!(pool.start_workers(), Err(PoolError::AlreadyRunning)));
        assert_eq!(pool.state(), PoolState::Running);

        pool.stop_workers().unwrap();
        assert!(matches!(pool.stop_workers(), Err(PoolError::NotRunning)));
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn pool_can_restart() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let pool = WorkerPool::new(
            &config(1),
            Arc::new(move |_: &mut SessionIo| -> Result<(), SessionError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        pool.start_workers().unwrap();
        pool.stop_workers().unwrap();
        pool.start_workers().unwrap();

        let (conn, mut client) = pair(TIMEOUT);
        pool.push(conn);
        wait_for(&handled, 1);
        assert_closed(&mut client);

        pool.stop_workers().unwrap();
    }

    #[test]
    fn concurrency_is_bounded_by_worker_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));

        let handler = {
            let (active, peak, handled) = (active.clone(), peak.clone(), handled.clone());
            Arc::new(move |_: &mut SessionIo| -> Result<(), SessionError> {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                active.fetch_sub(1, Ordering::SeqCst);
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let pool = WorkerPool::new(&config(2), handler).unwrap();
        let mut clients = Vec::new();
        for _ in 0..6 {
            let (conn, client) = pair(TIMEOUT);
            pool.push(conn);
            clients.push(client);
        }

        pool.start_workers().unwrap();
        wait_for(&handled, 6);
        pool.stop_workers().unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        for client in &mut clients {
            assert_closed(client);
        }
    }

    #[test]
    fn stop_closes_claimed_and_unclaimed_connections() {
        let claimed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&claimed);
        let pool = WorkerPool::new(
            &config(2),
            Arc::new(move |io: &mut SessionIo| -> Result<(), SessionError> {
                counter.fetch_add(1, Ordering::SeqCst);
                loop {
                    io.recv_i32()?;
                }
            }),
        )
        .unwrap();

        pool.start_workers().unwrap();
        let mut clients = Vec::new();
        for _ in 0..6 {
            let (conn, client) = pair(TIMEOUT);
            pool.push(conn);
            clients.push(client);
        }
        wait_for(&claimed, 2);

        let drained = pool.stop_workers().unwrap();
        assert_eq!(drained + claimed.load(Ordering::SeqCst), 6);
        assert_eq!(pool.state(), PoolState::Stopped);

        for client in &mut clients {
            assert_closed(client);
        }
    }

    #[test]
    fn handler_failure_does_not_kill_worker() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let pool = WorkerPool::new(
            &config(1),
            Arc::new(move |_: &mut SessionIo| -> Result<(), SessionError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first session blows up");
                }
                Err(SessionError::Protocol("rejected".to_string()))
            }),
        )
        .unwrap();
        pool.start_workers().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (conn, client) = pair(TIMEOUT);
            pool.push(conn);
            clients.push(client);
        }
        wait_for(&handled, 3);
        pool.stop_workers().unwrap();

        for client in &mut clients {
            assert_closed(client);
        }
    }
}

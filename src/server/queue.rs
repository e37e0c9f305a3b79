use std::sync::{
    Mutex, PoisonError,
    mpsc::{self, Receiver, Sender},
};

use crate::Connection;

/// FIFO of accepted connections waiting for a worker.
///
/// Pushing never blocks. Popping takes the receiver lock only for a non-blocking
/// `try_recv`, so a connection is handed to exactly one consumer and no lock is held while
/// anyone waits.
#[derive(Debug)]
pub struct PendingQueue {
    sender: Sender<Connection>,
    receiver: Mutex<Receiver<Connection>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn push(&self, connection: Connection) {
        // The receiver lives as long as `self`, so the channel cannot be disconnected.
        let _ = self.sender.send(connection);
    }

    pub fn pop(&self) -> Option<Connection> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<Connection> {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.try_iter().collect()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

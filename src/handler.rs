//! Per-connection protocol logic.
//!
//! A [`Handler`] is what a session runs once it owns a connection. It gets the session's
//! [`SessionIo`] and drives the wire protocol until it is done, the peer hangs up, or a
//! transfer fails. Plain closures work as handlers:
//!
//! ```rust
//! use tcpmachine::{SessionError, SessionIo};
//!
//! let ping = |io: &mut SessionIo| -> Result<(), SessionError> {
//!     let n = io.recv_i32()?;
//!     io.send_i32(n + 1)?;
//!     Ok(())
//! };
//! # let _: &dyn tcpmachine::Handler = &ping;
//! ```
use crate::{SessionError, SessionIo};

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, io: &mut SessionIo) -> Result<(), SessionError>;
}

impl<F> Handler for F
where
    F: Fn(&mut SessionIo) -> Result<(), SessionError> + Send + Sync + 'static,
{
    fn handle(&self, io: &mut SessionIo) -> Result<(), SessionError> {
        self(io)
    }
}

/// Answers every `i32` it receives with a string naming the value and the sender, until the
/// peer closes the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Echo {
    pub fn reply(value: i32, peer: &str) -> String {
        format!("received {value} from {peer}")
    }
}

impl Handler for Echo {
    fn handle(&self, io: &mut SessionIo) -> Result<(), SessionError> {
        loop {
            let value = match io.recv_i32() {
                Ok(v) => v,
                Err(e) if e.is_closed() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let reply = Echo::reply(value, io.get_ref().peer_addr());
            io.send_string(reply)?;
        }
    }
}

//! The dialing side of the protocol.
//!
//! A [`Client`] resolves `host:port`, connects to the first address that accepts, and then
//! speaks the same wire format as a server session by dereferencing to a
//! [`Codec`]:
//!
//! ```rust,no_run
//! use tcpmachine::Client;
//!
//! let mut client = Client::connect("localhost", 14005)?;
//! client.send_i32(42)?;
//! let reply = client.recv_string()?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    ops::{Deref, DerefMut},
    time::Duration,
};

use log::debug;
use thiserror::Error;

use crate::protocol::{Codec, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to resolve address: {0}")]
    Resolve(io::Error),
    #[error("unable to connect to {0}")]
    Unreachable(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug)]
pub struct Client {
    peer: SocketAddr,
    codec: Codec<TcpStream>,
}

impl Client {
    /// Tries every address `host` resolves to, IPv4 and IPv6 alike, until one connects.
    pub fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let addrs = (host, port).to_socket_addrs().map_err(ClientError::Resolve)?;

        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    debug!("connected to {addr}");
                    return Ok(Self {
                        peer: addr,
                        codec: Codec::new(stream),
                    });
                }
                Err(e) => debug!("could not connect to {addr}: {e}"),
            }
        }

        Err(ClientError::Unreachable(format!("{host}:{port}")))
    }

    /// Bounds how long a single read or write may block, so a cancelled
    /// [`cancel_token`](Codec::cancel_token) is noticed even while the server is silent.
    pub fn with_timeout(self, timeout: Duration) -> Result<Self, ClientError> {
        let stream = self.codec.get_ref();
        stream.set_read_timeout(Some(timeout)).map_err(WireError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(WireError::Io)?;
        Ok(self)
    }

    pub fn with_max_string_len(mut self, max: u32) -> Self {
        self.codec = self.codec.with_max_string_len(max);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Deref for Client {
    type Target = Codec<TcpStream>;

    fn deref(&self) -> &Self::Target {
        &self.codec
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.codec
    }
}

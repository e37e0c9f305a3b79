use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use log::trace;

/// An accepted TCP stream and the peer it talks to.
///
/// The peer identity is resolved once, when the connection is created, and rendered as
/// `ip:port`. IPv4 peers reaching a dual-stack listener show up as their plain IPv4
/// address rather than the mapped IPv6 form.
///
/// A `Connection` is owned by exactly one party at a time (the pending queue, a worker, or a
/// session). [`Connection::close`] consumes it, so it cannot be closed twice; dropping it
/// closes the descriptor too.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    /// Prepares an accepted stream for session use: blocking mode with read and write
    /// timeouts, so transfers give control back at least every `io_timeout`.
    pub fn new(stream: TcpStream, io_timeout: Duration) -> io::Result<Self> {
        let peer = format_peer(stream.peer_addr()?);

        // Accepted sockets inherit O_NONBLOCK from the listener on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;

        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    pub fn close(self) {
        trace!("closing connection to {}", self.peer);
        // The peer may already be gone; the descriptor is released on drop either way.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn format_peer(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip().to_canonical(), addr.port())
}

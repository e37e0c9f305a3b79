use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{Connection, ServerConfig};

use super::dispatch::Dispatcher;

/// Turns a non-blocking listening socket into a stream of [`Connection`]s.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    poll_interval: Duration,
    io_timeout: Duration,
}

impl Acceptor {
    /// Binds the configured port on every local address. A dual-stack IPv6 socket is tried
    /// first; hosts without IPv6 get a plain IPv4 socket.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port));
        let listener = match listen_on(v6, config.backlog) {
            Ok(listener) => listener,
            Err(e) if e.kind() != ErrorKind::AddrInUse => {
                debug!("dual-stack listener unavailable ({e}), using IPv4");
                listen_on((Ipv4Addr::UNSPECIFIED, config.port).into(), config.backlog)?
            }
            Err(e) => return Err(e),
        };
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            poll_interval: config.poll_interval,
            io_timeout: config.io_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until `running` is cleared or the listener fails, then shuts the dispatcher
    /// down and closes the listening socket. A listener failure clears `running` itself.
    pub fn run(self, running: &AtomicBool, dispatcher: &Dispatcher) {
        info!("accepting connections on {}", self.local_addr);

        while running.load(Ordering::SeqCst) {
            dispatcher.tick();

            match self.listener.accept() {
                Ok((stream, addr)) => match Connection::new(stream, self.io_timeout) {
                    Ok(connection) => {
                        debug!("accepted connection from {}", connection.peer_addr());
                        dispatcher.dispatch(connection);
                    }
                    Err(e) => warn!("dropping connection from {addr}: {e}"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                // The pending connection died before we got to it; nothing wrong with the listener.
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("accept failed on {}: {e}", self.local_addr);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        dispatcher.shutdown();
        drop(self.listener);
        info!("acceptor on {} stopped", self.local_addr);
    }
}

fn listen_on(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

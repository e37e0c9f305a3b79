pub mod cancel;
pub mod client;
pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{Client, ClientError};
pub use config::{DispatchMode, ServerConfig};
pub use connection::Connection;
pub use handler::Handler;
pub use server::{Server, ServerError};
pub use session::{Session, SessionError, SessionIo, SessionState};

//! Binary wire protocol.
//!
//! This module defines how typed values are exchanged between two peers over an ordered,
//! bidirectional byte stream. It is transport independent: anything implementing
//! [`Read`](std::io::Read) + [`Write`](std::io::Write) can be wrapped in a [`Codec`],
//! whether it is an accepted [`Connection`](crate::Connection), a client `TcpStream`, or an
//! in-memory buffer in tests.
//!
//! # Binary Format
//!
//! All integers are big-endian (network byte order) regardless of the host.
//!
//! | Value          | Encoding                                                      |
//! |----------------|---------------------------------------------------------------|
//! | `i32` / `u32`  | 4 bytes                                                       |
//! | `bool`         | 1 byte, nonzero is `true`                                     |
//! | string         | `u32` byte count, then exactly that many raw bytes            |
//!
//! Strings carry no terminator and no encoding; bytes are passed through unchanged. The
//! receiving side caps the length prefix (see [`DEFAULT_MAX_STRING_LEN`]) so a corrupted or
//! hostile peer cannot make it allocate arbitrary amounts of memory.
//!
//! # Complete transfers
//!
//! Each value is moved with [`Codec::send_exact`] / [`Codec::recv_exact`], which retry short
//! reads and writes until the full buffer has moved. A zero-length read while bytes are still
//! owed is reported as [`WireError::ConnectionClosed`], a stop request observed between
//! attempts as [`WireError::Interrupted`].
//!
//! # See Also
//!
//! - [`session`](crate::session): owns a connection and drives a codec over it.
//! - [`client`](crate::client): the dialing side, which uses the same codec.
mod codec;

pub use codec::{Codec, DEFAULT_MAX_STRING_LEN, WireError};

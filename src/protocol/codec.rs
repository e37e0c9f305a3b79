use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::cancel::CancelToken;

/// Largest string a [`Codec`] accepts from a peer unless configured otherwise.
pub const DEFAULT_MAX_STRING_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transfer interrupted by stop request")]
    Interrupted,
    #[error("string of {len} bytes exceeds the {max} byte limit")]
    StringTooLong { len: u64, max: u32 },
    #[error("wire io error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Whether the error is the peer hanging up rather than something going wrong.
    pub fn is_closed(&self) -> bool {
        matches!(self, WireError::ConnectionClosed)
    }
}

/// Typed, complete-transfer I/O over an ordered byte stream.
///
/// Every value goes through [`Codec::send_exact`] / [`Codec::recv_exact`], which keep
/// issuing reads or writes until the whole buffer has moved. Before each attempt the codec
/// checks its [`CancelToken`]; a stop request aborts the transfer with
/// [`WireError::Interrupted`]. For that check to be reached while a peer is silent the
/// underlying stream needs a read timeout, which [`Connection`](crate::Connection) sets up.
#[derive(Debug)]
pub struct Codec<T: Read + Write> {
    stream: T,
    cancel: CancelToken,
    max_string_len: u32,
}

impl<T: Read + Write> Codec<T> {
    pub fn new(stream: T) -> Self {
        Self::with_cancel(stream, CancelToken::new())
    }

    pub fn with_cancel(stream: T, cancel: CancelToken) -> Self {
        Self {
            stream,
            cancel,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    pub fn with_max_string_len(mut self, max: u32) -> Self {
        self.max_string_len = max;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn send_exact(&mut self, buf: &[u8]) -> Result<(), WireError> {
        let mut sent = 0;

        while sent < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(WireError::Interrupted);
            }

            match self.stream.write(&buf[sent..]) {
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => sent += n,
                Err(e) if is_retryable(&e) => continue,
                Err(e) if is_hangup(&e) => return Err(WireError::ConnectionClosed),
                Err(e) => return Err(e.into()),
            }
        }

        self.stream.flush()?;
        Ok(())
    }

    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        let mut received = 0;

        while received < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(WireError::Interrupted);
            }

            match self.stream.read(&mut buf[received..]) {
                // A zero-length read with bytes still owed means the peer shut down its side.
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => received += n,
                Err(e) if is_retryable(&e) => continue,
                Err(e) if is_hangup(&e) => return Err(WireError::ConnectionClosed),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn recv_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut buf = [0u8; N];
        self.recv_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn send_i32(&mut self, value: i32) -> Result<(), WireError> {
        self.send_exact(&value.to_be_bytes())
    }

    pub fn recv_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.recv_array()?))
    }

    pub fn send_u32(&mut self, value: u32) -> Result<(), WireError> {
        self.send_exact(&value.to_be_bytes())
    }

    pub fn recv_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.recv_array()?))
    }

    /// Booleans are always exactly one byte on the wire.
    pub fn send_bool(&mut self, value: bool) -> Result<(), WireError> {
        self.send_exact(&[u8::from(value)])
    }

    /// Any nonzero byte decodes as `true`.
    pub fn recv_bool(&mut self) -> Result<bool, WireError> {
        let [byte] = self.recv_array::<1>()?;
        Ok(byte != 0)
    }

    /// Sends a big-endian `u32` byte count followed by the raw bytes. No terminator is
    /// written and the bytes are not required to be valid UTF-8.
    pub fn send_string(&mut self, bytes: impl AsRef<[u8]>) -> Result<(), WireError> {
        let bytes = bytes.as_ref();
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::StringTooLong {
            len: bytes.len() as u64,
            max: u32::MAX,
        })?;

        self.send_u32(len)?;
        self.send_exact(bytes)
    }

    /// Receives a length-prefixed byte string. Prefixes above the configured limit are
    /// rejected before any buffer is allocated.
    pub fn recv_string(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.recv_u32()?;
        if len > self.max_string_len {
            return Err(WireError::StringTooLong {
                len: u64::from(len),
                max: self.max_string_len,
            });
        }

        let mut buf = vec![0u8; len as usize];
        self.recv_exact(&mut buf)?;
        Ok(buf)
    }
}

// Read timeouts surface as WouldBlock on unix and TimedOut on windows. Both just mean
// "nothing yet", so the loop goes round and re-checks the cancel token.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

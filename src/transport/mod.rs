// MIT License - Copyright (c) 2026 Peter Wright
// Bus transports

pub mod stream;

use std::time::Duration;

use crate::error::Result;

pub use stream::{SerialSettings, SerialTransport, StreamTransport, TcpTransport};

/// Duplex byte stream to the RS485 bus.
///
/// Implementations keep their own receive buffer so that "how many bytes are
/// waiting" means the same thing for a serial line and for a socket tunnel.
#[allow(async_fn_in_trait)]
pub trait BusTransport {
    /// Read exactly `n` bytes.
    ///
    /// Returns [`WallpadError::ReadTimeout`](crate::error::WallpadError::ReadTimeout)
    /// when the read timeout elapses first (buffered bytes are kept), and
    /// [`WallpadError::ConnectionLost`](crate::error::WallpadError::ConnectionLost)
    /// when the stream is closed.
    async fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Send a complete frame.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Record how many bytes are buffered-but-unread right after a write.
    async fn mark_pending_from_write(&mut self) -> Result<()>;

    /// Bytes still to be consumed before another transmission is safe.
    fn pending_count(&self) -> usize;

    /// Bytes that can be read without blocking.
    async fn bytes_available(&mut self) -> Result<usize>;

    /// Wait until at least `n` bytes are buffered or `limit` elapses.
    async fn wait_available(&mut self, n: usize, limit: Duration) -> Result<bool>;

    /// Change the read timeout.
    fn set_read_timeout(&mut self, timeout: Duration);
}

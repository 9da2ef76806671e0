//! Transport trait for PEI communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a radio
//! terminal. The serial implementation lives in `tetra-transport`; the
//! scripted mock used by unit tests lives in `tetra-test-harness`.
//!
//! The session layer in `tetra-pei` frames CR/LF terminated lines on top of
//! this byte stream, so implementations never need to know about AT syntax.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a radio.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the radio.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the radio into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if nothing arrived within the deadline. Dropping the returned future
    /// before it completes must not lose data.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

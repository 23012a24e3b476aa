//! Interfaces for the raw transport a stream runs over.
//!
//! Any reliable, ordered byte transport works: a TCP socket, a multiplexed
//! channel, an in-memory pipe. The transport moves opaque chunks; framing,
//! encryption, and authentication all happen above it.

use bytes::Bytes;
use std::{future::Future, io};

/// Interface any transport must implement to deliver inbound bytes.
pub trait RawStream: Sync + Send + 'static {
    /// Receive the next chunk of bytes.
    ///
    /// Chunk boundaries carry no meaning. `None` signals that the peer
    /// cleanly ended the transport.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    /// Hint that `bytes` more bytes are needed to complete the frame in
    /// flight. Transports that size their reads may use it; the default
    /// ignores it.
    fn expect(&mut self, bytes: usize) {
        let _ = bytes;
    }
}

/// Interface any transport must implement to accept outbound bytes.
pub trait RawSink: Sync + Send + 'static {
    /// Send a chunk of bytes.
    ///
    /// The future stays pending while the transport is backpressured and
    /// resolves once the chunk is accepted.
    fn send(&mut self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// End the outbound side after everything already sent is delivered.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

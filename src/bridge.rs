//! In-process transport bridge.
//!
//! A bounded, ordered chunk pipe implementing [`RawSink`] and [`RawStream`].
//! Useful for tests, benchmarks, and wiring two streams together inside one
//! process without a socket.

use crate::raw::{RawSink, RawStream};
use bytes::Bytes;
use futures::{channel::mpsc, SinkExt as _, StreamExt as _};
use std::io;

/// Create a one-directional bridge that buffers up to `capacity` chunks
/// beyond the slot reserved for the sender. Sends past that stay pending
/// until the receiver catches up.
pub fn channel(capacity: usize) -> (Sink, Stream) {
    let (sender, receiver) = mpsc::channel(capacity);
    (Sink { sender }, Stream { receiver })
}

/// Create two connected endpoints, each a (sink, stream) half of a duplex
/// in-process transport.
pub fn pair(capacity: usize) -> ((Sink, Stream), (Sink, Stream)) {
    let (left_sink, right_stream) = channel(capacity);
    let (right_sink, left_stream) = channel(capacity);
    ((left_sink, left_stream), (right_sink, right_stream))
}

/// Write half of an in-process bridge.
pub struct Sink {
    sender: mpsc::Sender<Bytes>,
}

impl RawSink for Sink {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.sender
            .send(data)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sender.close_channel();
        Ok(())
    }
}

/// Read half of an in-process bridge.
pub struct Stream {
    receiver: mpsc::Receiver<Bytes>,
}

impl RawStream for Stream {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.receiver.next().await)
    }
}

//! Inbound/outbound buffer pair used as the engine-mode transport.

use crate::error::BufferError;
use crate::ring::DuplexBuffer;
use bytes::Bytes;
use std::io::{self, Read, Write};
use tracing::debug;

/// Default capacity of each direction (one maximum-size TLS record plus headroom)
pub const DEFAULT_BUFFER_CAPACITY: usize = 17 * 1024 + 512;

/// Inbound and outbound ciphertext buffers owned by one session.
///
/// Seen from the engine, `Read` pulls from the inbound side and `Write`
/// pushes to the outbound side. Seen from the caller, ciphertext received
/// from the network goes in through [`BufferPair::feed`] and ciphertext to
/// send comes out through [`BufferPair::drain`].
#[derive(Debug)]
pub struct BufferPair {
    inbound: DuplexBuffer,
    outbound: DuplexBuffer,
}

impl BufferPair {
    /// Create a pair with per-direction capacities
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Result<Self, BufferError> {
        debug!(
            "Creating buffer pair (inbound={} outbound={})",
            inbound_capacity, outbound_capacity
        );
        Ok(Self {
            inbound: DuplexBuffer::new(inbound_capacity)?,
            outbound: DuplexBuffer::new(outbound_capacity)?,
        })
    }

    /// Create a pair with the same capacity in both directions
    pub fn with_capacity(capacity: usize) -> Result<Self, BufferError> {
        Self::new(capacity, capacity)
    }

    /// Accept a whole chunk of received ciphertext, or none of it
    pub fn feed(&mut self, ciphertext: &[u8]) -> usize {
        self.inbound.offer(ciphertext)
    }

    /// Take up to `max` bytes of ciphertext to send
    pub fn drain(&mut self, max: usize) -> Bytes {
        DuplexBuffer::take(&mut self.outbound, max)
    }

    /// Record that the network side will deliver no more ciphertext
    pub fn close_inbound(&mut self) {
        self.inbound.set_eof();
    }

    /// Free space for received ciphertext
    pub fn inbound_free(&self) -> usize {
        self.inbound.free()
    }

    /// Ciphertext waiting to be drained
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

impl Read for BufferPair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inbound.read(buf)
    }
}

impl Write for BufferPair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_directions_are_independent() {
        let mut pair = BufferPair::new(8, 4).unwrap();

        assert_eq!(pair.feed(b"inbound!"), 8);
        assert_eq!(pair.feed(b"x"), 0);
        assert_eq!(pair.write(b"out").unwrap(), 3);
        assert_eq!(pair.outbound_len(), 3);

        let mut buf = [0u8; 8];
        assert_eq!(pair.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"inbound!");
        assert_eq!(pair.drain(10).as_ref(), b"out");
    }

    #[test]
    fn test_inbound_close_turns_would_block_into_eof() {
        let mut pair = BufferPair::with_capacity(4).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(pair.read(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
        pair.close_inbound();
        assert_eq!(pair.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_invalid_capacity() {
        assert_eq!(BufferPair::new(0, 16).unwrap_err(), BufferError::ZeroCapacity);
    }
}

//! Fixed-capacity ring buffer with non-blocking `Read`/`Write` adapters.

use crate::error::BufferError;
use bytes::{Bytes, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use tracing::trace;

/// Largest capacity a single buffer may be created with
pub const MAX_CAPACITY: usize = 64 * 1024 * 1024;

/// Fixed-capacity byte ring
#[derive(Debug)]
pub struct DuplexBuffer {
    data: Box<[u8]>,
    /// Index of the first readable byte
    head: usize,
    /// Number of readable bytes
    len: usize,
    /// Writer side will not produce more bytes
    eof: bool,
}

impl DuplexBuffer {
    /// Create an empty buffer with a fixed capacity
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        if capacity > MAX_CAPACITY {
            return Err(BufferError::TooLarge {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }
        Ok(Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            eof: false,
        })
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Readable bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is readable
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writable bytes
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Mark that no further bytes will be written
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Whether the writer side has finished and everything was read
    pub fn is_finished(&self) -> bool {
        self.eof && self.len == 0
    }

    /// Copy all of `src` in, or nothing when it does not fit.
    ///
    /// Returns the number of bytes accepted: `src.len()` or `0`.
    pub fn offer(&mut self, src: &[u8]) -> usize {
        if src.len() > self.free() {
            trace!(
                "Rejected offer of {} bytes ({} free of {})",
                src.len(),
                self.free(),
                self.capacity()
            );
            return 0;
        }
        self.push(src)
    }

    /// Copy as much of `src` as fits
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.data[tail..tail + first].copy_from_slice(&src[..first]);
        if first < n {
            self.data[..n - first].copy_from_slice(&src[first..n]);
        }
        self.len += n;
        n
    }

    /// Move up to `dst.len()` bytes out
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        dst[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        if first < n {
            dst[first..n].copy_from_slice(&self.data[..n - first]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }

    /// Move up to `max` bytes out into a new `Bytes`
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.len);
        let mut out = BytesMut::zeroed(n);
        let moved = self.pop(&mut out);
        out.truncate(moved);
        out.freeze()
    }
}

impl Read for DuplexBuffer {
    /// Empty buffers report `WouldBlock` until [`DuplexBuffer::set_eof`] is called.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Err(ErrorKind::WouldBlock.into());
        }
        Ok(self.pop(buf))
    }
}

impl Write for DuplexBuffer {
    /// Full buffers report `WouldBlock`; otherwise as much as fits is taken.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.push(buf) {
            0 => Err(ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(DuplexBuffer::new(0).unwrap_err(), BufferError::ZeroCapacity);
        assert!(matches!(
            DuplexBuffer::new(MAX_CAPACITY + 1),
            Err(BufferError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_offer_is_all_or_nothing() {
        let mut buf = DuplexBuffer::new(8).unwrap();
        assert_eq!(buf.offer(b"hello"), 5);
        assert_eq!(buf.offer(b"world"), 0);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.offer(b"abc"), 3);
        assert_eq!(buf.free(), 0);

        let mut out = [0u8; 8];
        assert_eq!(buf.pop(&mut out), 8);
        assert_eq!(&out, b"helloabc");
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut buf = DuplexBuffer::new(6).unwrap();
        assert_eq!(buf.push(b"abcd"), 4);
        let mut out = [0u8; 3];
        assert_eq!(buf.pop(&mut out), 3);
        assert_eq!(&out, b"abc");
        // Tail wraps past the end of storage
        assert_eq!(buf.push(b"efghi"), 5);
        assert_eq!(DuplexBuffer::take(&mut buf, 16).as_ref(), b"defghi");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_write_adapters() {
        let mut buf = DuplexBuffer::new(4).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out).unwrap_err().kind(), ErrorKind::WouldBlock);

        assert_eq!(buf.write(b"123456").unwrap(), 4);
        assert_eq!(buf.write(b"7").unwrap_err().kind(), ErrorKind::WouldBlock);
        assert_eq!(buf.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"1234");

        buf.set_eof();
        assert_eq!(buf.read(&mut out).unwrap(), 0);
        assert!(buf.is_finished());
    }

    #[test]
    fn test_take_never_exceeds_contents() {
        let mut buf = DuplexBuffer::new(16).unwrap();
        buf.push(b"xyz");
        assert_eq!(DuplexBuffer::take(&mut buf, 100).len(), 3);
        assert_eq!(DuplexBuffer::take(&mut buf, 100).len(), 0);
    }

    proptest! {
        #[test]
        fn prop_feed_drain_cycles_preserve_bytes(
            capacity in 1usize..64,
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..48), 0..40),
            drains in prop::collection::vec(0usize..80, 0..40),
        ) {
            let mut buf = DuplexBuffer::new(capacity).unwrap();
            let mut fed = Vec::new();
            let mut drained = Vec::new();

            for (i, chunk) in chunks.iter().enumerate() {
                let free_before = buf.free();
                let accepted = buf.offer(chunk);
                prop_assert!(accepted <= free_before);
                prop_assert!(accepted == 0 || accepted == chunk.len());
                if chunk.len() <= free_before {
                    prop_assert_eq!(accepted, chunk.len());
                }
                fed.extend_from_slice(&chunk[..accepted]);

                let max = drains.get(i).copied().unwrap_or(0);
                let present = buf.len();
                let out = DuplexBuffer::take(&mut buf, max);
                prop_assert!(out.len() <= present);
                prop_assert!(out.len() <= max);
                drained.extend_from_slice(&out);
            }
            drained.extend_from_slice(&DuplexBuffer::take(&mut buf, usize::MAX));

            prop_assert_eq!(fed, drained);
        }
    }
}

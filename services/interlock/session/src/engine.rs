//! Engine abstraction consumed by the operation loop.
//!
//! An engine is a non-blocking TLS state machine. Each call performs as much
//! work as it can without waiting and then reports a [`Classification`] that
//! tells the loop whether to return, retry, or wait for the transport.

use interlock_wakeup::Direction;
use std::io;

/// Outcome of a single engine call
#[derive(Debug)]
pub enum Classification {
    /// Call completed; bytes moved (0 for handshake/flush/shutdown)
    Success(usize),
    /// Engine needs the transport to become readable
    WantRead,
    /// Engine needs the transport to become writable
    WantWrite,
    /// Peer closed the TLS stream cleanly
    ZeroReturn,
    /// Transient OS condition, call again without waiting
    SyscallRetry,
    /// Fatal transport error
    SyscallFatal(io::Error),
    /// Engine rejected the peer's data or failed internally
    Protocol(String),
    /// A caller callback failed inside the engine
    CallbackException,
}

/// Map a transport error onto a classification
pub fn classify_io(err: io::Error, direction: Direction) -> Classification {
    match err.kind() {
        io::ErrorKind::WouldBlock => match direction {
            Direction::Read => Classification::WantRead,
            Direction::Write => Classification::WantWrite,
        },
        io::ErrorKind::Interrupted => Classification::SyscallRetry,
        _ => Classification::SyscallFatal(err),
    }
}

/// Non-blocking TLS engine driven by the operation loop.
///
/// Implementations are not thread-safe for concurrent invocation; the loop
/// serialises calls through a mutex.
pub trait Engine: Send {
    /// Advance the handshake; `Success(0)` once it is complete
    fn handshake(&mut self) -> Classification;

    /// Read decrypted application data
    fn read(&mut self, buf: &mut [u8]) -> Classification;

    /// Queue application data for encryption
    fn write(&mut self, buf: &[u8]) -> Classification;

    /// Push queued ciphertext to the transport; `Success(0)` when nothing is left
    fn flush(&mut self) -> Classification;

    /// Queue close_notify and push it out
    fn shutdown(&mut self) -> Classification;

    /// Whether the handshake has completed
    fn is_handshake_complete(&self) -> bool;

    /// Monotonic count of ciphertext bytes moved to or from the transport
    fn io_progress(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_would_block_by_direction() {
        let err = || io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(classify_io(err(), Direction::Read), Classification::WantRead));
        assert!(matches!(classify_io(err(), Direction::Write), Classification::WantWrite));
    }

    #[test]
    fn test_classify_eintr_and_fatal() {
        assert!(matches!(
            classify_io(io::Error::from(io::ErrorKind::Interrupted), Direction::Read),
            Classification::SyscallRetry
        ));
        match classify_io(io::Error::from_raw_os_error(104), Direction::Write) {
            Classification::SyscallFatal(e) => assert_eq!(e.raw_os_error(), Some(104)),
            other => panic!("unexpected {:?}", other),
        }
    }
}

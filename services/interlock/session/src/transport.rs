//! Transport capabilities the operation loop waits on.

use crate::state::SessionState;
use crate::wait::{transport_wait, WaitOutcome};
use interlock_wakeup::{Direction, WaitTimeout};
use std::os::fd::BorrowedFd;

/// Something the loop can wait on when the engine wants more I/O
pub trait Transport {
    /// Wait until the transport is ready in `direction`
    fn await_ready(
        &self,
        state: &SessionState,
        direction: Direction,
        timeout: WaitTimeout,
    ) -> WaitOutcome;
}

/// Socket descriptor polled together with the session's wakeup channel
#[derive(Debug, Clone, Copy)]
pub struct SocketTransport<'a> {
    fd: BorrowedFd<'a>,
}

impl<'a> SocketTransport<'a> {
    /// Wrap a socket descriptor
    pub fn new(fd: BorrowedFd<'a>) -> Self {
        Self { fd }
    }
}

impl Transport for SocketTransport<'_> {
    fn await_ready(
        &self,
        state: &SessionState,
        direction: Direction,
        timeout: WaitTimeout,
    ) -> WaitOutcome {
        transport_wait(state, self.fd, direction, timeout)
    }
}

/// In-memory buffers: the caller moves ciphertext, so waiting is never possible
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferTransport;

impl Transport for BufferTransport {
    fn await_ready(&self, _: &SessionState, _: Direction, _: WaitTimeout) -> WaitOutcome {
        WaitOutcome::WouldBlock
    }
}

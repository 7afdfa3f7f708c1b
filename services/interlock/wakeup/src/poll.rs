//! Two-descriptor readiness polling.
//!
//! The session layer waits on exactly two sources at once: the transport
//! descriptor (for the requested direction) and the wakeup channel's read
//! endpoint. Both are handed to a single `poll(2)` call.

use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Direction a blocked operation is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Transport readable
    Read,
    /// Transport writable
    Write,
}

impl Direction {
    fn poll_events(self) -> libc::c_short {
        match self {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// State of the transport descriptor after a poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportReadiness {
    /// Nothing reported for the transport
    Pending,
    /// Requested direction is ready
    Ready,
    /// Peer hung up or the socket has a pending error; the next I/O call reports it
    Hangup,
    /// Descriptor is not open (closed concurrently)
    Invalid,
}

/// Events reported by one [`poll_pair`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairEvents {
    /// Transport readiness
    pub transport: TransportReadiness,
    /// Whether the wakeup endpoint fired
    pub wakeup: bool,
}

/// Poll the transport and the wakeup endpoint once.
///
/// `timeout_ms` uses the OS convention: `-1` blocks indefinitely and `0`
/// returns immediately. Returns `Ok(None)` when the timeout elapsed with no
/// events. `EINTR` is surfaced as an [`io::ErrorKind::Interrupted`] error so
/// the caller can re-arm with its remaining time.
pub fn poll_pair(
    transport: BorrowedFd<'_>,
    wakeup: BorrowedFd<'_>,
    direction: Direction,
    timeout_ms: libc::c_int,
) -> io::Result<Option<PairEvents>> {
    let mut fds = [
        libc::pollfd {
            fd: transport.as_raw_fd(),
            events: direction.poll_events(),
            revents: 0,
        },
        libc::pollfd {
            fd: wakeup.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    // SAFETY: `fds` is a valid array of two pollfd entries for the whole call.
    let ready = Errno::result(unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
    })?;
    if ready == 0 {
        return Ok(None);
    }

    let revents = fds[0].revents;
    let transport = if revents & libc::POLLNVAL != 0 {
        TransportReadiness::Invalid
    } else if revents & direction.poll_events() != 0 {
        TransportReadiness::Ready
    } else if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        TransportReadiness::Hangup
    } else {
        TransportReadiness::Pending
    };

    Ok(Some(PairEvents {
        transport,
        wakeup: fds[1].revents & libc::POLLIN != 0,
    }))
}

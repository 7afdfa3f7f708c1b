//! Wakeup channels used to abort a thread parked in a readiness wait.
//!
//! A channel has a writer side (`signal`) and a reader side that is watched
//! by the poller. Signalling is idempotent-safe: extra signals only produce an
//! extra, harmless wakeup.

use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, trace};

/// Cross-thread notification primitive watched by the readiness poller
pub trait WakeupChannel: Send + Sync + fmt::Debug {
    /// Make the read endpoint readable. Never blocks.
    fn signal(&self) -> io::Result<()>;

    /// Consume any pending tokens. Best-effort and never blocks.
    fn drain(&self);

    /// Endpoint to include in the poll set
    fn read_fd(&self) -> BorrowedFd<'_>;
}

/// Which wakeup implementation to open
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeupKind {
    /// `eventfd` where available, self-pipe elsewhere
    #[default]
    Auto,
    /// POSIX self-pipe
    Pipe,
    /// Linux `eventfd` counter
    EventFd,
}

/// Error returned when parsing an unknown wakeup kind
#[derive(Error, Debug)]
#[error("unknown wakeup kind: {0}")]
pub struct UnknownWakeupKind(pub String);

impl FromStr for WakeupKind {
    type Err = UnknownWakeupKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(WakeupKind::Auto),
            "pipe" => Ok(WakeupKind::Pipe),
            "eventfd" => Ok(WakeupKind::EventFd),
            other => Err(UnknownWakeupKind(other.to_string())),
        }
    }
}

impl fmt::Display for WakeupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeupKind::Auto => write!(f, "auto"),
            WakeupKind::Pipe => write!(f, "pipe"),
            WakeupKind::EventFd => write!(f, "eventfd"),
        }
    }
}

/// Open a wakeup channel of the requested kind
pub fn open_channel(kind: WakeupKind) -> io::Result<Box<dyn WakeupChannel>> {
    match kind {
        WakeupKind::Pipe => Ok(Box::new(PipeWakeup::new()?)),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        WakeupKind::EventFd | WakeupKind::Auto => Ok(Box::new(EventFdWakeup::new()?)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        WakeupKind::Auto => Ok(Box::new(PipeWakeup::new()?)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        WakeupKind::EventFd => Err(io::Error::new(
            ErrorKind::Unsupported,
            "eventfd wakeup is not available on this platform",
        )),
    }
}

/// Self-pipe wakeup channel
#[derive(Debug)]
pub struct PipeWakeup {
    reader: File,
    writer: File,
}

impl PipeWakeup {
    /// Create a pipe with both ends non-blocking and close-on-exec
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        set_nonblocking_cloexec(reader.as_fd())?;
        set_nonblocking_cloexec(writer.as_fd())?;
        debug!("Opened self-pipe wakeup channel (r={}, w={})", fds[0], fds[1]);

        Ok(Self {
            reader: File::from(reader),
            writer: File::from(writer),
        })
    }
}

impl WakeupChannel for PipeWakeup {
    fn signal(&self) -> io::Result<()> {
        loop {
            match (&self.writer).write(&[1u8]) {
                Ok(_) => return Ok(()),
                // A full pipe is already signalled
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn drain(&self) {
        let mut scratch = [0u8; 64];
        let mut total = 0usize;
        loop {
            match (&self.reader).read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        trace!("Drained {} wakeup tokens from pipe", total);
    }

    fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// `eventfd` wakeup channel
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub struct EventFdWakeup {
    counter: File,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl EventFdWakeup {
    /// Create a non-blocking, close-on-exec eventfd with a zero counter
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd(2) takes no pointers.
        let fd = Errno::result(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        debug!("Opened eventfd wakeup channel (fd={})", fd);
        // SAFETY: eventfd(2) succeeded, the descriptor is open and owned by us.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            counter: File::from(owned),
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl WakeupChannel for EventFdWakeup {
    fn signal(&self) -> io::Result<()> {
        loop {
            match (&self.counter).write(&1u64.to_ne_bytes()) {
                Ok(_) => return Ok(()),
                // Counter saturated, already readable
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn drain(&self) {
        let mut value = [0u8; 8];
        loop {
            match (&self.counter).read(&mut value) {
                Ok(_) => {
                    trace!("Drained eventfd counter {}", u64::from_ne_bytes(value));
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn read_fd(&self) -> BorrowedFd<'_> {
        self.counter.as_fd()
    }
}

fn set_nonblocking_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl(2) on a descriptor we borrow; no pointers involved.
    unsafe {
        let flags = Errno::result(libc::fcntl(raw, libc::F_GETFL))?;
        Errno::result(libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let fd_flags = Errno::result(libc::fcntl(raw, libc::F_GETFD))?;
        Errno::result(libc::fcntl(raw, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{poll_pair, Direction};

    fn is_readable(channel: &dyn WakeupChannel) -> bool {
        // Poll the read endpoint against itself with a zero timeout
        let fd = channel.read_fd();
        poll_pair(fd, fd, Direction::Read, 0)
            .unwrap()
            .map(|events| events.wakeup)
            .unwrap_or(false)
    }

    fn exercise(channel: Box<dyn WakeupChannel>) {
        assert!(!is_readable(channel.as_ref()));

        channel.signal().unwrap();
        assert!(is_readable(channel.as_ref()));

        channel.drain();
        assert!(!is_readable(channel.as_ref()));

        // Extra signals collapse into a single readable state
        for _ in 0..5 {
            channel.signal().unwrap();
        }
        assert!(is_readable(channel.as_ref()));
        channel.drain();
        assert!(!is_readable(channel.as_ref()));

        // Draining an empty channel is harmless
        channel.drain();
    }

    #[test]
    fn test_pipe_signal_and_drain() {
        exercise(Box::new(PipeWakeup::new().unwrap()));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_eventfd_signal_and_drain() {
        exercise(Box::new(EventFdWakeup::new().unwrap()));
    }

    #[test]
    fn test_pipe_never_blocks_when_full() {
        let channel = PipeWakeup::new().unwrap();
        // Far more than the default pipe buffer
        for _ in 0..200_000 {
            channel.signal().unwrap();
        }
        channel.drain();
        assert!(!is_readable(&channel));
    }

    #[test]
    fn test_open_channel_kinds() {
        exercise(open_channel(WakeupKind::Pipe).unwrap());
        exercise(open_channel(WakeupKind::Auto).unwrap());
    }

    #[test]
    fn test_wakeup_kind_parse() {
        assert_eq!("pipe".parse::<WakeupKind>().unwrap(), WakeupKind::Pipe);
        assert_eq!("EventFd".parse::<WakeupKind>().unwrap(), WakeupKind::EventFd);
        assert_eq!("auto".parse::<WakeupKind>().unwrap(), WakeupKind::Auto);
        assert!("signal".parse::<WakeupKind>().is_err());
        assert_eq!(WakeupKind::EventFd.to_string(), "eventfd");
    }
}

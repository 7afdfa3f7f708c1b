//! Waiting for transport readiness while staying interruptible.
//!
//! One `poll(2)` covers both the transport descriptor and the session's
//! wakeup endpoint, so a concurrent [`SessionState::mark_dead`] always ends
//! the wait.

use crate::state::SessionState;
use interlock_wakeup::{poll_pair, Direction, TransportReadiness, WaitTimeout};
use std::io;
use std::os::fd::BorrowedFd;
use tracing::{debug, trace, warn};

/// Result of one readiness wait
#[derive(Debug)]
pub enum WaitOutcome {
    /// Transport ready in the requested direction, or a progress wakeup
    Ready(Direction),
    /// Timeout elapsed with no readiness and no interruption
    TimedOut,
    /// Session dead or transport descriptor invalid
    Interrupted,
    /// Transport cannot wait (in-memory buffers)
    WouldBlock,
    /// Unrecoverable OS error
    Error(io::Error),
}

/// Suspend until `fd` is ready for `direction`, the timeout elapses, or the
/// session is interrupted.
///
/// The calling thread is counted as a waiter for the whole call. A dead
/// session returns [`WaitOutcome::Interrupted`] without polling, and a
/// session built without a wakeup channel returns [`WaitOutcome::WouldBlock`].
pub fn transport_wait(
    state: &SessionState,
    fd: BorrowedFd<'_>,
    direction: Direction,
    timeout: WaitTimeout,
) -> WaitOutcome {
    let Some(wakeup) = state.wakeup() else {
        debug!("Session {} has no wakeup channel and cannot wait", state.id());
        return WaitOutcome::WouldBlock;
    };
    let Some(_waiter) = state.register_waiter() else {
        debug!("Session {} dead before {} wait", state.id(), direction);
        return WaitOutcome::Interrupted;
    };

    let deadline = timeout.start();
    trace!(
        "Session {} waiting for {} (timeout {:?})",
        state.id(),
        direction,
        timeout
    );

    loop {
        let events = match poll_pair(fd, wakeup.read_fd(), direction, deadline.poll_millis()) {
            Ok(Some(events)) => events,
            Ok(None) => {
                if deadline.expired() {
                    debug!("Session {} {} wait timed out", state.id(), direction);
                    return WaitOutcome::TimedOut;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return WaitOutcome::Error(e),
        };

        if events.wakeup {
            wakeup.drain();
            if !state.is_alive() {
                // Leave a token behind for the other direction's waiter
                if let Err(e) = wakeup.signal() {
                    warn!("Session {} failed to re-signal wakeup: {}", state.id(), e);
                }
                debug!("Session {} {} wait interrupted", state.id(), direction);
                return WaitOutcome::Interrupted;
            }
        }

        match events.transport {
            TransportReadiness::Invalid => {
                debug!("Session {} transport closed during wait", state.id());
                return WaitOutcome::Interrupted;
            }
            TransportReadiness::Ready | TransportReadiness::Hangup => {
                return WaitOutcome::Ready(direction);
            }
            TransportReadiness::Pending if events.wakeup => {
                trace!("Session {} woken by progress", state.id());
                return WaitOutcome::Ready(direction);
            }
            TransportReadiness::Pending => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interlock_wakeup::WakeupKind;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn session() -> Arc<SessionState> {
        SessionState::new(WakeupKind::Auto, Vec::new()).unwrap()
    }

    #[test]
    fn test_ready_when_transport_readable() {
        let state = session();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let outcome = transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::Infinite);
        assert!(matches!(outcome, WaitOutcome::Ready(Direction::Read)));
        assert_eq!(state.waiting_threads(), 0);
        state.mark_dead();
    }

    #[test]
    fn test_timeout_never_early() {
        let state = session();
        let (a, _b) = UnixStream::pair().unwrap();

        let start = Instant::now();
        let outcome = transport_wait(
            &state,
            a.as_fd(),
            Direction::Read,
            WaitTimeout::from_millis(40),
        );
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(40));
        state.mark_dead();
    }

    #[test]
    fn test_dead_session_skips_poll() {
        let state = session();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        state.mark_dead();

        let outcome = transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::Infinite);
        assert!(matches!(outcome, WaitOutcome::Interrupted));
    }

    #[test]
    fn test_interrupt_wakes_infinite_wait() {
        let state = session();
        let (a, _b) = UnixStream::pair().unwrap();

        let killer = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                state.mark_dead();
            })
        };

        let start = Instant::now();
        let outcome = transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::Infinite);
        assert!(matches!(outcome, WaitOutcome::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(2));
        killer.join().unwrap();
    }

    #[test]
    fn test_interrupt_wakes_both_directions() {
        let state = session();
        let (a, _b) = UnixStream::pair().unwrap();
        let a = Arc::new(a);

        let reader = {
            let (state, a) = (state.clone(), a.clone());
            thread::spawn(move || {
                transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::Infinite)
            })
        };
        // Blocked write: fill the socket buffer first
        let (w, _w_peer) = UnixStream::pair().unwrap();
        w.set_nonblocking(true).unwrap();
        let chunk = [0u8; 4096];
        while (&w).write(&chunk).is_ok() {}
        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                transport_wait(&state, w.as_fd(), Direction::Write, WaitTimeout::Infinite)
            })
        };

        thread::sleep(Duration::from_millis(50));
        state.mark_dead();

        assert!(matches!(reader.join().unwrap(), WaitOutcome::Interrupted));
        assert!(matches!(writer.join().unwrap(), WaitOutcome::Interrupted));
        assert_eq!(state.waiting_threads(), 0);
    }

    #[test]
    fn test_session_without_wakeup_never_waits() {
        let state = SessionState::without_wakeup(Vec::new());
        let (a, _b) = UnixStream::pair().unwrap();

        let outcome = transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::Infinite);
        assert!(matches!(outcome, WaitOutcome::WouldBlock));
        assert_eq!(state.waiting_threads(), 0);
        state.mark_dead();
    }

    #[test]
    fn test_progress_wakeup_reports_ready() {
        let state = session();
        let (a, _b) = UnixStream::pair().unwrap();

        let notifier = {
            let state = state.clone();
            thread::spawn(move || {
                while state.waiting_threads() == 0 {
                    thread::sleep(Duration::from_millis(5));
                }
                state.notify_progress();
            })
        };

        let outcome = transport_wait(&state, a.as_fd(), Direction::Read, WaitTimeout::from_millis(5000));
        assert!(matches!(outcome, WaitOutcome::Ready(Direction::Read)));
        notifier.join().unwrap();
        state.mark_dead();
    }
}

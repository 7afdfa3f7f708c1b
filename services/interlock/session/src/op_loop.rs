//! Generic blocking operation loop.
//!
//! Handshake, read, write and shutdown all run the same cycle: invoke the
//! engine once, classify the result, then return, retry immediately, or
//! suspend on the transport and retry once it reports readiness.

use crate::callbacks::CallbackContext;
use crate::engine::{Classification, Engine};
use crate::error::{CallbackError, TlsIoError};
use crate::state::SessionState;
use crate::transport::Transport;
use crate::wait::WaitOutcome;
use interlock_wakeup::{Direction, WaitTimeout};
use parking_lot::Mutex;
use std::io;
use tracing::{debug, trace};

/// Terminal success of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Bytes moved (0 only for a 0-byte request, or a completed handshake)
    Bytes(usize),
    /// Peer closed the TLS stream cleanly
    EndOfStream,
    /// In-memory transport needs the caller to move ciphertext first
    WouldBlock,
}

/// One blocking operation against a session
pub struct OperationLoop<'a, E: Engine, T: Transport> {
    state: &'a SessionState,
    engine: &'a Mutex<E>,
    transport: T,
    timeout: WaitTimeout,
    callbacks: Option<&'a CallbackContext>,
}

impl<'a, E: Engine, T: Transport> OperationLoop<'a, E, T> {
    /// Create a loop that waits forever and installs no callbacks
    pub fn new(state: &'a SessionState, engine: &'a Mutex<E>, transport: T) -> Self {
        Self {
            state,
            engine,
            transport,
            timeout: WaitTimeout::Infinite,
            callbacks: None,
        }
    }

    /// Timeout applied to each transport wait
    pub fn timeout(mut self, timeout: WaitTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Callbacks installed around each engine call
    pub fn callbacks(mut self, callbacks: Option<&'a CallbackContext>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Call the engine exactly once.
    ///
    /// A callback error raised during this call is taken while the engine lock
    /// is still held, so a concurrent call can neither see nor clear it.
    fn invoke<F>(&self, op: &mut F) -> Result<(Classification, Option<CallbackError>), TlsIoError>
    where
        F: FnMut(&mut E) -> Classification,
    {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }

        let mut engine = self.engine.lock();
        self.state.clear_pending_callback_error();
        let before = engine.io_progress();
        let classification = {
            let _scope = self.state.enter_callbacks(self.callbacks);
            op(&mut engine)
        };
        let callback_error = match classification {
            Classification::Success(_)
            | Classification::WantRead
            | Classification::WantWrite
            | Classification::ZeroReturn
            | Classification::SyscallRetry => None,
            _ => self.state.take_pending_callback_error(),
        };
        let moved = engine.io_progress() != before;
        drop(engine);

        if moved {
            self.state.notify_progress();
        }
        trace!("Session {} engine call -> {:?}", self.state.id(), classification);
        Ok((classification, callback_error))
    }

    /// Suspend on the transport. `Ok(None)` means retry the engine.
    fn wait(&self, direction: Direction) -> Result<Option<Progress>, TlsIoError> {
        match self.transport.await_ready(self.state, direction, self.timeout) {
            WaitOutcome::Ready(_) => Ok(None),
            WaitOutcome::WouldBlock => Ok(Some(Progress::WouldBlock)),
            WaitOutcome::TimedOut => Err(TlsIoError::Timeout),
            WaitOutcome::Interrupted => Err(TlsIoError::Closed),
            WaitOutcome::Error(e) => Err(TlsIoError::io(e)),
        }
    }

    /// Terminal error for a failed engine call
    fn failure(&self, classification: Classification, pending: Option<CallbackError>) -> TlsIoError {
        match (classification, pending) {
            (Classification::SyscallFatal(e), None) => TlsIoError::io(e),
            (Classification::Protocol(msg), None) => TlsIoError::Protocol(msg),
            (Classification::CallbackException, None) => {
                TlsIoError::Protocol("callback failed without reporting an error".to_string())
            }
            (_, Some(err)) => TlsIoError::Callback(err),
            (other, None) => TlsIoError::Protocol(format!("unexpected engine result {:?}", other)),
        }
    }

    /// Run one engine operation to a terminal result
    pub fn run<F>(&self, mut op: F) -> Result<Progress, TlsIoError>
    where
        F: FnMut(&mut E) -> Classification,
    {
        loop {
            let (classification, callback_error) = self.invoke(&mut op)?;
            match classification {
                Classification::Success(n) => return Ok(Progress::Bytes(n)),
                Classification::ZeroReturn => return Ok(Progress::EndOfStream),
                Classification::SyscallRetry => continue,
                Classification::WantRead => {
                    if let Some(progress) = self.wait(Direction::Read)? {
                        return Ok(progress);
                    }
                }
                Classification::WantWrite => {
                    if let Some(progress) = self.wait(Direction::Write)? {
                        return Ok(progress);
                    }
                }
                other => {
                    let err = self.failure(other, callback_error);
                    debug!("Session {} operation failed: {}", self.state.id(), err);
                    return Err(err);
                }
            }
        }
    }

    /// Drive the handshake to completion
    pub fn handshake(&self) -> Result<Progress, TlsIoError> {
        match self.run(|engine| engine.handshake())? {
            Progress::EndOfStream => Err(TlsIoError::io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the handshake",
            ))),
            progress => Ok(progress),
        }
    }

    /// Read decrypted data into `buf`
    pub fn read(&self, buf: &mut [u8]) -> Result<Progress, TlsIoError> {
        if buf.is_empty() {
            return Ok(Progress::Bytes(0));
        }
        self.run(|engine| engine.read(buf))
    }

    /// Write all of `buf`, resuming partial writes, then flush.
    ///
    /// With an in-memory transport the bytes accepted so far are returned
    /// once the engine cannot take more.
    pub fn write(&self, buf: &[u8]) -> Result<Progress, TlsIoError> {
        if buf.is_empty() {
            return Ok(Progress::Bytes(0));
        }

        let mut written = 0;
        while written < buf.len() {
            match self.run(|engine| engine.write(&buf[written..]))? {
                Progress::Bytes(n) => written += n,
                Progress::WouldBlock if written == 0 => return Ok(Progress::WouldBlock),
                Progress::WouldBlock => return Ok(Progress::Bytes(written)),
                Progress::EndOfStream => return Err(broken_pipe()),
            }
        }

        match self.run(|engine| engine.flush())? {
            Progress::EndOfStream => Err(broken_pipe()),
            // Queued ciphertext waits for the caller to drain it
            Progress::Bytes(_) | Progress::WouldBlock => Ok(Progress::Bytes(written)),
        }
    }

    /// Queue close_notify and make one attempt to send it
    pub fn shutdown(&self) -> Result<(), TlsIoError> {
        let mut op = |engine: &mut E| engine.shutdown();
        loop {
            let (classification, callback_error) = self.invoke(&mut op)?;
            match classification {
                Classification::Success(_) | Classification::ZeroReturn => return Ok(()),
                Classification::SyscallRetry => continue,
                Classification::WantRead | Classification::WantWrite => {
                    debug!("Session {} close_notify left queued", self.state.id());
                    return Ok(());
                }
                other => return Err(self.failure(other, callback_error)),
            }
        }
    }
}

fn broken_pipe() -> TlsIoError {
    TlsIoError::io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "peer closed the TLS stream",
    ))
}

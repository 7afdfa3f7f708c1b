//! Blocking TLS over a TCP socket, interruptible from another thread.
//!
//! The socket is put in non-blocking mode; all blocking happens inside the
//! operation loop's transport wait, which also watches the session's wakeup
//! channel. [`TlsSocket::interrupt`] and [`TlsSocket::close`] may be called
//! from any thread while another thread is blocked in an operation.

use crate::callbacks::{CallbackContext, HandshakeInfo};
use crate::config::SessionConfig;
use crate::context::{ClientSettings, ContextError, EngineContext, ServerSettings};
use crate::engine::Engine;
use crate::error::TlsIoError;
use crate::op_loop::{OperationLoop, Progress};
use crate::state::SessionState;
use crate::tls::RustlsEngine;
use crate::transport::SocketTransport;
use interlock_wakeup::WaitTimeout;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, ServerConnection};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared handle to the TCP stream used as the engine's transport
#[derive(Debug, Clone)]
pub struct SocketIo(Arc<TcpStream>);

impl Read for SocketIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(buf)
    }
}

impl Write for SocketIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

type SocketEngine = RustlsEngine<SocketIo>;

/// TLS session over a TCP socket
pub struct TlsSocket {
    state: Arc<SessionState>,
    engine: Mutex<SocketEngine>,
    stream: Arc<TcpStream>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
    closed: AtomicBool,
}

impl TlsSocket {
    /// Client session over a connected stream
    pub fn connect(
        context: &EngineContext,
        stream: TcpStream,
        server_name: &str,
        settings: &ClientSettings,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ContextError::ServerName(server_name.to_string()))?;
        let state = SessionState::new(config.wakeup, config.alpn_wire())?;
        let tls = context.client_config(settings, &state)?;
        let conn = ClientConnection::new(tls, name)?;
        info!("Session {} connecting to {}", state.id(), server_name);
        Self::from_parts(state, Connection::Client(conn), stream, config)
    }

    /// Server session over an accepted stream
    pub fn accept(
        context: &EngineContext,
        stream: TcpStream,
        settings: &ServerSettings,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        let state = SessionState::new(config.wakeup, config.alpn_wire())?;
        let tls = context.server_config(settings, &state)?;
        let conn = ServerConnection::new(tls)?;
        info!("Session {} accepted from {:?}", state.id(), stream.peer_addr().ok());
        Self::from_parts(state, Connection::Server(conn), stream, config)
    }

    fn from_parts(
        state: Arc<SessionState>,
        conn: Connection,
        stream: TcpStream,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        stream.set_nonblocking(true)?;
        let stream = Arc::new(stream);
        let engine = RustlsEngine::new(
            conn,
            SocketIo(stream.clone()),
            state.clone(),
            config.max_pending_plaintext,
        );

        Ok(Self {
            state,
            engine: Mutex::new(engine),
            stream,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            read_timeout_ms: AtomicU64::new(config.read_timeout_ms),
            write_timeout_ms: AtomicU64::new(config.write_timeout_ms),
            closed: AtomicBool::new(false),
        })
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    /// Shared session state
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    fn op<'a>(
        &'a self,
        timeout: WaitTimeout,
        callbacks: Option<&'a CallbackContext>,
    ) -> OperationLoop<'a, SocketEngine, SocketTransport<'a>> {
        OperationLoop::new(&self.state, &self.engine, SocketTransport::new(self.stream.as_fd()))
            .timeout(timeout)
            .callbacks(callbacks)
    }

    /// Run the handshake to completion.
    ///
    /// `timeout_ms` bounds each wait for the peer; `0` waits forever.
    pub fn do_handshake(
        &self,
        timeout_ms: u64,
        callbacks: Option<&CallbackContext>,
    ) -> Result<(), TlsIoError> {
        let _read = self.read_lock.lock();
        let _write = self.write_lock.lock();
        self.handshake_locked(WaitTimeout::from_millis(timeout_ms), callbacks)
    }

    fn handshake_locked(
        &self,
        timeout: WaitTimeout,
        callbacks: Option<&CallbackContext>,
    ) -> Result<(), TlsIoError> {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }
        if self.engine.lock().is_handshake_complete() {
            return Ok(());
        }
        debug!("Session {} starting handshake", self.state.id());
        self.op(timeout, callbacks).handshake().map(|_| ())
    }

    fn ensure_handshake(
        &self,
        timeout: WaitTimeout,
        callbacks: Option<&CallbackContext>,
    ) -> Result<(), TlsIoError> {
        if self.engine.lock().is_handshake_complete() {
            return Ok(());
        }
        let _read = self.read_lock.lock();
        let _write = self.write_lock.lock();
        self.handshake_locked(timeout, callbacks)
    }

    /// Read decrypted data, handshaking first if needed
    pub fn read(
        &self,
        buf: &mut [u8],
        timeout_ms: u64,
        callbacks: Option<&CallbackContext>,
    ) -> Result<Progress, TlsIoError> {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }
        if buf.is_empty() {
            return Ok(Progress::Bytes(0));
        }
        let timeout = WaitTimeout::from_millis(timeout_ms);
        self.ensure_handshake(timeout, callbacks)?;

        let _read = self.read_lock.lock();
        self.op(timeout, callbacks).read(buf)
    }

    /// Write all of `buf`, handshaking first if needed
    pub fn write(
        &self,
        buf: &[u8],
        timeout_ms: u64,
        callbacks: Option<&CallbackContext>,
    ) -> Result<usize, TlsIoError> {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = WaitTimeout::from_millis(timeout_ms);
        self.ensure_handshake(timeout, callbacks)?;

        let _write = self.write_lock.lock();
        match self.op(timeout, callbacks).write(buf)? {
            Progress::Bytes(n) => Ok(n),
            Progress::EndOfStream | Progress::WouldBlock => Err(TlsIoError::io(
                io::Error::from(io::ErrorKind::WriteZero),
            )),
        }
    }

    /// Read into `buf[offset..offset + len]`
    pub fn read_range(
        &self,
        buf: &mut [u8],
        offset: usize,
        len: usize,
        timeout_ms: u64,
        callbacks: Option<&CallbackContext>,
    ) -> Result<Progress, TlsIoError> {
        let end = checked_range(buf.len(), offset, len)?;
        self.read(&mut buf[offset..end], timeout_ms, callbacks)
    }

    /// Write `buf[offset..offset + len]`
    pub fn write_range(
        &self,
        buf: &[u8],
        offset: usize,
        len: usize,
        timeout_ms: u64,
        callbacks: Option<&CallbackContext>,
    ) -> Result<usize, TlsIoError> {
        let end = checked_range(buf.len(), offset, len)?;
        self.write(&buf[offset..end], timeout_ms, callbacks)
    }

    /// Abort every blocked and future operation on this session
    pub fn interrupt(&self) {
        if self.state.mark_dead() {
            info!("Session {} interrupted", self.state.id());
        }
    }

    /// Send close_notify once, without waiting for the transport
    pub fn shutdown(&self, callbacks: Option<&CallbackContext>) -> Result<(), TlsIoError> {
        let _write = self.write_lock.lock();
        self.op(WaitTimeout::Infinite, callbacks).shutdown()
    }

    /// Close the session.
    ///
    /// With no operation in flight a close_notify is attempted first. Then the
    /// session is marked dead and the TCP stream is shut down, which wakes any
    /// thread still blocked in an operation. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(_read) = self.read_lock.try_lock() {
            if let Some(_write) = self.write_lock.try_lock() {
                if self.state.is_alive() && self.engine.lock().is_handshake_complete() {
                    if let Err(e) = self.op(WaitTimeout::Infinite, None).shutdown() {
                        debug!("Session {} close_notify failed: {}", self.state.id(), e);
                    }
                }
            }
        }

        self.state.mark_dead();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Session {} socket shutdown: {}", self.state.id(), e);
        }
        info!("Session {} closed", self.state.id());
    }

    /// Whether [`TlsSocket::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the handshake has completed
    pub fn is_handshake_complete(&self) -> bool {
        self.engine.lock().is_handshake_complete()
    }

    /// Parameters negotiated by the handshake
    pub fn handshake_info(&self) -> Option<&HandshakeInfo> {
        self.state.handshake_info()
    }

    /// Timeout used by the `io::Read` adapter; `0` waits forever
    pub fn set_read_timeout(&self, timeout_ms: u64) {
        self.read_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Timeout used by the `io::Write` adapter; `0` waits forever
    pub fn set_write_timeout(&self, timeout_ms: u64) {
        self.write_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Current read timeout
    pub fn read_timeout(&self) -> u64 {
        self.read_timeout_ms.load(Ordering::Relaxed)
    }

    /// Current write timeout
    pub fn write_timeout(&self) -> u64 {
        self.write_timeout_ms.load(Ordering::Relaxed)
    }
}

pub(crate) fn checked_range(buf_len: usize, offset: usize, len: usize) -> Result<usize, TlsIoError> {
    offset
        .checked_add(len)
        .filter(|end| *end <= buf_len)
        .ok_or_else(|| {
            TlsIoError::InvalidArgument(format!(
                "range {}+{} outside buffer of {} bytes",
                offset, len, buf_len
            ))
        })
}

impl Read for &TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket: &TlsSocket = self;
        match socket.read(buf, socket.read_timeout(), None)? {
            Progress::Bytes(n) => Ok(n),
            Progress::EndOfStream => Ok(0),
            Progress::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for &TlsSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let socket: &TlsSocket = self;
        Ok(socket.write(buf, socket.write_timeout(), None)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }
}

impl Write for TlsSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        self.close();
    }
}

//! Engine mode: TLS without socket ownership.
//!
//! The caller owns the network loop. Received ciphertext goes in through
//! [`BufferPairSession::feed_ciphertext`], ciphertext to send comes out of
//! [`BufferPairSession::drain_ciphertext`], and plaintext operations never
//! block: when the engine needs more ciphertext moved they return
//! [`Progress::WouldBlock`].

use crate::callbacks::{CallbackContext, HandshakeInfo};
use crate::config::SessionConfig;
use crate::context::{ClientSettings, ContextError, EngineContext, ServerSettings};
use crate::engine::Engine;
use crate::error::TlsIoError;
use crate::op_loop::{OperationLoop, Progress};
use crate::socket::checked_range;
use crate::state::SessionState;
use crate::tls::RustlsEngine;
use crate::transport::BufferTransport;
use bytes::Bytes;
use interlock_buffer::BufferPair;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, ServerConnection};
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

type PairEngine = RustlsEngine<BufferPair>;

/// TLS session exchanging ciphertext through in-memory buffers
pub struct BufferPairSession {
    state: Arc<SessionState>,
    engine: Mutex<PairEngine>,
}

impl BufferPairSession {
    /// Client session
    pub fn client(
        context: &EngineContext,
        server_name: &str,
        settings: &ClientSettings,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ContextError::ServerName(server_name.to_string()))?;
        let state = SessionState::without_wakeup(config.alpn_wire());
        let tls = context.client_config(settings, &state)?;
        let conn = ClientConnection::new(tls, name)?;
        Self::from_parts(state, Connection::Client(conn), config)
    }

    /// Server session
    pub fn server(
        context: &EngineContext,
        settings: &ServerSettings,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        let state = SessionState::without_wakeup(config.alpn_wire());
        let tls = context.server_config(settings, &state)?;
        let conn = ServerConnection::new(tls)?;
        Self::from_parts(state, Connection::Server(conn), config)
    }

    fn from_parts(
        state: Arc<SessionState>,
        conn: Connection,
        config: &SessionConfig,
    ) -> Result<Self, ContextError> {
        let buffers = BufferPair::with_capacity(config.engine_buffer_capacity)?;
        info!(
            "Session {} created in engine mode ({} byte buffers)",
            state.id(),
            config.engine_buffer_capacity
        );
        let engine = RustlsEngine::new(conn, buffers, state.clone(), config.max_pending_plaintext);
        Ok(Self {
            state,
            engine: Mutex::new(engine),
        })
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    fn op<'a>(
        &'a self,
        callbacks: Option<&'a CallbackContext>,
    ) -> OperationLoop<'a, PairEngine, BufferTransport> {
        OperationLoop::new(&self.state, &self.engine, BufferTransport).callbacks(callbacks)
    }

    /// Hand received ciphertext to the engine.
    ///
    /// All-or-nothing: returns `data.len()`, or `0` without copying anything
    /// when the inbound buffer cannot hold the whole chunk.
    pub fn feed_ciphertext(&self, data: &[u8]) -> usize {
        let accepted = self.engine.lock().io_mut().feed(data);
        trace!(
            "Session {} fed {}/{} ciphertext bytes",
            self.state.id(),
            accepted,
            data.len()
        );
        accepted
    }

    /// Feed `data[offset..offset + len]`
    pub fn feed_ciphertext_range(
        &self,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<usize, TlsIoError> {
        let end = checked_range(data.len(), offset, len)?;
        Ok(self.feed_ciphertext(&data[offset..end]))
    }

    /// Take up to `max` bytes of ciphertext to send
    pub fn drain_ciphertext(&self, max: usize) -> Bytes {
        let mut engine = self.engine.lock();
        Self::pump(&mut engine);
        let out = engine.io_mut().drain(max);
        if !out.is_empty() {
            // Room freed in the outbound buffer; move more along for next time
            Self::pump(&mut engine);
        }
        out
    }

    /// Ciphertext ready to drain
    pub fn pending_ciphertext(&self) -> usize {
        let mut engine = self.engine.lock();
        Self::pump(&mut engine);
        engine.io().outbound_len()
    }

    /// Free space for received ciphertext
    pub fn inbound_free(&self) -> usize {
        self.engine.lock().io().inbound_free()
    }

    fn pump(engine: &mut PairEngine) {
        if let Err(c) = engine.flush_pending() {
            trace!("Outbound ciphertext pump stopped: {:?}", c);
        }
    }

    /// Advance the handshake with the ciphertext fed so far
    pub fn handshake(&self, callbacks: Option<&CallbackContext>) -> Result<Progress, TlsIoError> {
        self.op(callbacks).handshake()
    }

    fn ensure_handshake(&self, callbacks: Option<&CallbackContext>) -> Result<bool, TlsIoError> {
        if self.engine.lock().is_handshake_complete() {
            return Ok(true);
        }
        Ok(self.handshake(callbacks)? != Progress::WouldBlock)
    }

    /// Read decrypted data without blocking
    pub fn read_plaintext(
        &self,
        buf: &mut [u8],
        callbacks: Option<&CallbackContext>,
    ) -> Result<Progress, TlsIoError> {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }
        if buf.is_empty() {
            return Ok(Progress::Bytes(0));
        }
        if !self.ensure_handshake(callbacks)? {
            return Ok(Progress::WouldBlock);
        }
        self.op(callbacks).read(buf)
    }

    /// Encrypt as much of `buf` as fits without blocking
    pub fn write_plaintext(
        &self,
        buf: &[u8],
        callbacks: Option<&CallbackContext>,
    ) -> Result<Progress, TlsIoError> {
        if !self.state.is_alive() {
            return Err(TlsIoError::Closed);
        }
        if buf.is_empty() {
            return Ok(Progress::Bytes(0));
        }
        if !self.ensure_handshake(callbacks)? {
            return Ok(Progress::WouldBlock);
        }
        self.op(callbacks).write(buf)
    }

    /// Queue close_notify; drain it with [`BufferPairSession::drain_ciphertext`]
    pub fn shutdown(&self, callbacks: Option<&CallbackContext>) -> Result<(), TlsIoError> {
        self.op(callbacks).shutdown()
    }

    /// Record that the network will deliver no more ciphertext
    pub fn close_inbound(&self) {
        debug!("Session {} inbound ciphertext closed", self.state.id());
        self.engine.lock().io_mut().close_inbound();
    }

    /// Abort the session; later operations fail with `Closed`
    pub fn interrupt(&self) {
        if self.state.mark_dead() {
            info!("Session {} interrupted", self.state.id());
        }
    }

    /// Whether the handshake has completed
    pub fn is_handshake_complete(&self) -> bool {
        self.engine.lock().is_handshake_complete()
    }

    /// Protocol selected through ALPN
    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.engine.lock().alpn_protocol().map(|p| p.to_vec())
    }

    /// Parameters negotiated by the handshake
    pub fn handshake_info(&self) -> Option<&HandshakeInfo> {
        self.state.handshake_info()
    }
}

impl std::fmt::Debug for BufferPairSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPairSession")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for BufferPairSession {
    fn drop(&mut self) {
        self.state.mark_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::SessionCallbacks;
    use crate::error::CallbackError;
    use crate::signer::{DelegatedSigner, Identity, Signer};
    use crate::testutil::TestPki;
    use rustls::{SignatureAlgorithm, SignatureScheme};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Move ciphertext between two sessions until neither has anything to send
    fn shuttle(a: &BufferPairSession, b: &BufferPairSession) {
        for _ in 0..64 {
            let mut moved = false;
            for (from, to) in [(a, b), (b, a)] {
                let room = to.inbound_free();
                let chunk = from.drain_ciphertext(room);
                if !chunk.is_empty() {
                    assert_eq!(to.feed_ciphertext(&chunk), chunk.len());
                    moved = true;
                }
            }
            if !moved {
                return;
            }
        }
        panic!("ciphertext kept flowing");
    }

    fn connect(
        client: &BufferPairSession,
        server: &BufferPairSession,
        callbacks: Option<&CallbackContext>,
    ) -> Result<(), TlsIoError> {
        for _ in 0..16 {
            let c = client.handshake(callbacks)?;
            shuttle(client, server);
            let s = server.handshake(None)?;
            shuttle(client, server);
            if c == Progress::Bytes(0) && s == Progress::Bytes(0) {
                return Ok(());
            }
        }
        panic!("handshake did not converge");
    }

    fn sessions(pki: &TestPki, config: &SessionConfig) -> (BufferPairSession, BufferPairSession) {
        let context = EngineContext::new();
        let client =
            BufferPairSession::client(&context, "localhost", &pki.client_settings(), config)
                .unwrap();
        let server =
            BufferPairSession::server(&context, &pki.server_settings(&context), config).unwrap();
        (client, server)
    }

    #[test]
    fn test_engine_mode_handshake_and_echo() {
        let pki = TestPki::generate();
        let config = SessionConfig {
            alpn_protocols: vec!["interlock/1".to_string()],
            ..Default::default()
        };
        let (client, server) = sessions(&pki, &config);

        // Nothing to read before the peer spoke
        assert_eq!(client.handshake(None).unwrap(), Progress::WouldBlock);
        connect(&client, &server, None).unwrap();

        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
        assert_eq!(client.negotiated_protocol(), Some(b"interlock/1".to_vec()));
        assert_eq!(
            server.handshake_info().unwrap().alpn_str(),
            Some("interlock/1")
        );

        assert_eq!(
            client.write_plaintext(b"hello", None).unwrap(),
            Progress::Bytes(5)
        );
        shuttle(&client, &server);

        let mut buf = [0u8; 32];
        assert_eq!(server.read_plaintext(&mut buf, None).unwrap(), Progress::Bytes(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(server.read_plaintext(&mut buf, None).unwrap(), Progress::WouldBlock);
    }

    #[test]
    fn test_feed_is_all_or_nothing() {
        let pki = TestPki::generate();
        let config = SessionConfig {
            engine_buffer_capacity: 64,
            ..Default::default()
        };
        let (client, _server) = sessions(&pki, &config);

        assert_eq!(client.inbound_free(), 64);
        assert_eq!(client.feed_ciphertext(&[0u8; 65]), 0);
        assert_eq!(client.inbound_free(), 64);
        assert_eq!(client.feed_ciphertext(&[0u8; 40]), 40);
        assert_eq!(client.feed_ciphertext(&[0u8; 40]), 0);
        assert!(client.feed_ciphertext_range(&[0u8; 8], 4, 8).is_err());
    }

    #[test]
    fn test_drain_never_exceeds_request() {
        let pki = TestPki::generate();
        let (client, _server) = sessions(&pki, &SessionConfig::default());

        assert_eq!(client.handshake(None).unwrap(), Progress::WouldBlock);
        let pending = client.pending_ciphertext();
        assert!(pending > 0);

        let first = client.drain_ciphertext(10);
        assert_eq!(first.len(), 10);
        let rest = client.drain_ciphertext(usize::MAX);
        assert_eq!(first.len() + rest.len(), pending);
        assert_eq!(client.pending_ciphertext(), 0);
        // A TLS handshake record
        assert_eq!(first[0], 0x16);
    }

    #[test]
    fn test_shutdown_delivers_end_of_stream() {
        let pki = TestPki::generate();
        let (client, server) = sessions(&pki, &SessionConfig::default());
        connect(&client, &server, None).unwrap();

        client.shutdown(None).unwrap();
        shuttle(&client, &server);
        let mut buf = [0u8; 8];
        assert_eq!(server.read_plaintext(&mut buf, None).unwrap(), Progress::EndOfStream);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let pki = TestPki::generate();
        let (client, server) = sessions(&pki, &SessionConfig::default());
        connect(&client, &server, None).unwrap();

        server.close_inbound();
        let mut buf = [0u8; 8];
        let err = server.read_plaintext(&mut buf, None).unwrap_err();
        assert!(matches!(err, TlsIoError::Io { .. }));
    }

    #[test]
    fn test_interrupted_session_refuses_work() {
        let pki = TestPki::generate();
        let (client, _server) = sessions(&pki, &SessionConfig::default());
        client.interrupt();
        client.interrupt();

        let mut buf = [0u8; 8];
        assert!(client.read_plaintext(&mut buf, None).unwrap_err().is_closed());
        assert!(client.write_plaintext(b"x", None).unwrap_err().is_closed());
        assert!(client.handshake(None).unwrap_err().is_closed());
    }

    #[test]
    fn test_write_reports_partial_progress_when_buffers_fill() {
        let pki = TestPki::generate();
        let config = SessionConfig {
            max_pending_plaintext: 4096,
            ..Default::default()
        };
        let (client, server) = sessions(&pki, &config);
        connect(&client, &server, None).unwrap();

        let data = vec![0x5au8; 256 * 1024];
        let written = match client.write_plaintext(&data, None).unwrap() {
            Progress::Bytes(n) => n,
            other => panic!("unexpected {:?}", other),
        };
        assert!(written > 0 && written < data.len());
        assert_eq!(client.write_plaintext(&data, None).unwrap(), Progress::WouldBlock);
    }

    struct CountingCallbacks {
        completed: AtomicUsize,
    }

    impl SessionCallbacks for CountingCallbacks {
        fn handshake_completed(&self, info: &HandshakeInfo) -> Result<(), CallbackError> {
            assert!(!info.peer_certificates.is_empty());
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_handshake_completed_called_once() {
        let pki = TestPki::generate();
        let (client, server) = sessions(&pki, &SessionConfig::default());
        let counting = Arc::new(CountingCallbacks {
            completed: AtomicUsize::new(0),
        });
        let callbacks: CallbackContext = counting.clone();

        connect(&client, &server, Some(&callbacks)).unwrap();
        client.handshake(Some(&callbacks)).unwrap();
        assert_eq!(counting.completed.load(Ordering::SeqCst), 1);
    }

    struct RejectingCallbacks;

    impl SessionCallbacks for RejectingCallbacks {
        fn handshake_completed(&self, _info: &HandshakeInfo) -> Result<(), CallbackError> {
            Err(CallbackError::new("policy rejects peer"))
        }
    }

    #[test]
    fn test_rejected_handshake_leaves_session_unusable() {
        let pki = TestPki::generate();
        let (client, server) = sessions(&pki, &SessionConfig::default());
        let callbacks: CallbackContext = Arc::new(RejectingCallbacks);

        match connect(&client, &server, Some(&callbacks)).unwrap_err() {
            TlsIoError::Callback(cb) => assert_eq!(cb.to_string(), "policy rejects peer"),
            other => panic!("unexpected {:?}", other),
        }
        shuttle(&client, &server);
        assert_eq!(server.handshake(None).unwrap(), Progress::Bytes(0));

        assert!(!client.is_handshake_complete());
        assert!(matches!(client.handshake(None), Err(TlsIoError::Protocol(_))));
        assert!(client.write_plaintext(b"secret", None).is_err());
        assert_eq!(client.pending_ciphertext(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(server.read_plaintext(&mut buf, None).unwrap(), Progress::WouldBlock);
    }

    #[test]
    fn test_close_notify_during_handshake_fails_instead_of_waiting() {
        let pki = TestPki::generate();
        let (client, _server) = sessions(&pki, &SessionConfig::default());
        assert_eq!(client.handshake(None).unwrap(), Progress::WouldBlock);
        client.drain_ciphertext(usize::MAX);

        // Plaintext warning-level close_notify alert record
        let alert = [0x15, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00];
        assert_eq!(client.feed_ciphertext(&alert), alert.len());

        let err = client.handshake(None).unwrap_err();
        assert!(matches!(err, TlsIoError::Protocol(_)), "unexpected {:?}", err);
        assert!(!client.is_handshake_complete());
    }

    #[test]
    fn test_delegated_signer_failure_propagates() {
        let pki = TestPki::generate();
        let context = EngineContext::new();
        let signer: Arc<dyn Signer> = Arc::new(DelegatedSigner::new(
            SignatureAlgorithm::ECDSA,
            vec![SignatureScheme::ECDSA_NISTP256_SHA256],
            |_, _| Err(CallbackError::new("hsm offline")),
        ));
        let settings = ServerSettings {
            identity: Identity::new(vec![pki.leaf_der.clone()], signer),
            client_auth_roots: None,
        };
        let config = SessionConfig::default();
        let client =
            BufferPairSession::client(&context, "localhost", &pki.client_settings(), &config)
                .unwrap();
        let server = BufferPairSession::server(&context, &settings, &config).unwrap();

        assert_eq!(client.handshake(None).unwrap(), Progress::WouldBlock);
        shuttle(&client, &server);
        match server.handshake(None).unwrap_err() {
            TlsIoError::Callback(cb) => assert_eq!(cb.to_string(), "hsm offline"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

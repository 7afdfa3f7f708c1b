//! rustls binding of the [`Engine`] trait.
//!
//! rustls is driven purely as a state machine: ciphertext moves with
//! `read_tls`/`write_tls` over a non-blocking transport (a socket or a
//! [`BufferPair`](interlock_buffer::BufferPair)) and every `WouldBlock` is
//! reported to the loop, which owns all waiting.

use crate::callbacks::HandshakeInfo;
use crate::engine::{classify_io, Classification, Engine};
use crate::error::CallbackError;
use crate::state::SessionState;
use interlock_wakeup::Direction;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{Connection, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// rustls connection bound to a non-blocking transport
pub struct RustlsEngine<T> {
    conn: Connection,
    io: T,
    state: Arc<SessionState>,
    progress: u64,
    handshake_reported: bool,
    /// Set once the session can no longer be trusted; every later call fails
    failure: Option<String>,
}

impl<T: Read + Write + Send> RustlsEngine<T> {
    /// Bind a connection to its transport.
    ///
    /// `max_pending` bounds the ciphertext rustls queues ahead of the transport.
    pub fn new(
        mut conn: Connection,
        io: T,
        state: Arc<SessionState>,
        max_pending: usize,
    ) -> Self {
        conn.set_buffer_limit(Some(max_pending));
        Self {
            conn,
            io,
            state,
            progress: 0,
            handshake_reported: false,
            failure: None,
        }
    }

    /// The transport
    pub fn io(&self) -> &T {
        &self.io
    }

    /// The transport, mutably
    pub fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Protocol selected through ALPN
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// Push queued ciphertext into the transport
    pub fn flush_pending(&mut self) -> Result<(), Classification> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(0) => break,
                Ok(n) => {
                    self.progress += n as u64;
                    trace!("Session {} sent {} ciphertext bytes", self.state.id(), n);
                }
                Err(e) => return Err(classify_io(e, Direction::Write)),
            }
        }
        Ok(())
    }

    /// Pull ciphertext from the transport and process it.
    ///
    /// Returns the number of bytes read; `0` means the transport hit EOF.
    fn fill(&mut self) -> Result<usize, Classification> {
        let n = match self.conn.read_tls(&mut self.io) {
            Ok(n) => n,
            Err(e) => return Err(classify_io(e, Direction::Read)),
        };
        self.progress += n as u64;
        trace!("Session {} received {} ciphertext bytes", self.state.id(), n);

        if let Err(err) = self.conn.process_new_packets() {
            // Let the peer see the alert if the transport takes it
            if let Err(e) = self.conn.write_tls(&mut self.io) {
                debug!("Session {} could not send alert: {}", self.state.id(), e);
            }
            let classification = self.protocol_failure(&err);
            self.poison(err.to_string());
            return Err(classification);
        }
        Ok(n)
    }

    fn protocol_failure(&self, err: &rustls::Error) -> Classification {
        if self.state.has_pending_callback_error() {
            Classification::CallbackException
        } else {
            Classification::Protocol(err.to_string())
        }
    }

    fn poison(&mut self, reason: String) {
        if self.failure.is_none() {
            warn!("Session {} failed: {}", self.state.id(), reason);
            self.failure = Some(reason);
        }
    }

    fn failed(&self) -> Option<Classification> {
        self.failure.clone().map(Classification::Protocol)
    }

    fn report_handshake(&mut self) -> Classification {
        if self.handshake_reported {
            return Classification::Success(0);
        }
        self.handshake_reported = true;

        let info = self.state.record_handshake(HandshakeInfo {
            protocol_version: self.conn.protocol_version().map(|v| format!("{:?}", v)),
            cipher_suite: self
                .conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            alpn_protocol: self.conn.alpn_protocol().map(|p| p.to_vec()),
            peer_certificates: self
                .conn
                .peer_certificates()
                .map(|chain| chain.to_vec())
                .unwrap_or_default(),
        });
        info!(
            "Session {} handshake complete ({} / {})",
            self.state.id(),
            info.protocol_version.as_deref().unwrap_or("unknown"),
            info.cipher_suite.as_deref().unwrap_or("unknown")
        );

        if let Some(callbacks) = self.state.callbacks() {
            if let Err(e) = callbacks.handshake_completed(info) {
                self.poison(format!("handshake rejected by callback: {}", e));
                self.state.set_pending_callback_error(e);
                return Classification::CallbackException;
            }
        }
        Classification::Success(0)
    }
}

impl<T: Read + Write + Send> Engine for RustlsEngine<T> {
    fn handshake(&mut self) -> Classification {
        if let Some(c) = self.failed() {
            return c;
        }
        loop {
            if let Err(c) = self.flush_pending() {
                return c;
            }
            if self.conn.wants_write() {
                return Classification::WantWrite;
            }
            if !self.conn.is_handshaking() {
                return self.report_handshake();
            }
            if !self.conn.wants_read() {
                // Nothing to send and nothing more will be accepted
                let reason = "handshake stalled: peer closed before completing it".to_string();
                self.poison(reason.clone());
                return Classification::Protocol(reason);
            }
            match self.fill() {
                Ok(0) => {
                    return Classification::SyscallFatal(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection during the handshake",
                    ))
                }
                Ok(_) => continue,
                Err(c) => return c,
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Classification {
        if let Some(c) = self.failed() {
            return c;
        }
        if buf.is_empty() {
            return Classification::Success(0);
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Classification::ZeroReturn,
                Ok(n) => return Classification::Success(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // Transport EOF without close_notify is truncation
                Err(e) => return Classification::SyscallFatal(e),
            }

            // Handshake or key-update replies may be queued
            match self.flush_pending() {
                Ok(()) | Err(Classification::WantWrite) => {}
                Err(c) => return c,
            }

            if let Err(c) = self.fill() {
                return c;
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Classification {
        if let Some(c) = self.failed() {
            return c;
        }
        if buf.is_empty() {
            return Classification::Success(0);
        }

        // Make room first; a full transport is fine while rustls can still queue
        match self.flush_pending() {
            Ok(()) | Err(Classification::WantWrite) => {}
            Err(c) => return c,
        }

        match self.conn.writer().write(buf) {
            Ok(0) => Classification::WantWrite,
            Ok(n) => {
                match self.flush_pending() {
                    Ok(()) | Err(Classification::WantWrite) => {}
                    Err(c) => return c,
                }
                Classification::Success(n)
            }
            Err(e) => classify_io(e, Direction::Write),
        }
    }

    fn flush(&mut self) -> Classification {
        if let Some(c) = self.failed() {
            return c;
        }
        match self.flush_pending() {
            Ok(()) => Classification::Success(0),
            Err(c) => c,
        }
    }

    fn shutdown(&mut self) -> Classification {
        if let Some(c) = self.failed() {
            return c;
        }
        debug!("Session {} sending close_notify", self.state.id());
        self.conn.send_close_notify();
        self.flush()
    }

    fn is_handshake_complete(&self) -> bool {
        self.failure.is_none() && !self.conn.is_handshaking()
    }

    fn io_progress(&self) -> u64 {
        self.progress
    }
}

/// Run the session's `verify_peer` callback, if one is installed
fn run_verify_callback(
    state: &Weak<SessionState>,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<(), rustls::Error> {
    let Some(state) = state.upgrade() else {
        return Ok(());
    };
    let Some(callbacks) = state.callbacks() else {
        return Ok(());
    };

    let mut chain = Vec::with_capacity(1 + intermediates.len());
    chain.push(end_entity.clone());
    chain.extend(intermediates.iter().cloned());

    callbacks.verify_peer(&chain).map_err(|e: CallbackError| {
        debug!("Session {} peer rejected by callback: {}", state.id(), e);
        state.set_pending_callback_error(e);
        rustls::Error::General("peer verification callback failed".to_string())
    })
}

/// Server verifier that runs the session's callback after webpki accepts the chain
#[derive(Debug)]
pub struct CallbackServerVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    state: Weak<SessionState>,
}

impl CallbackServerVerifier {
    /// Wrap a verifier for one session
    pub fn new(inner: Arc<dyn ServerCertVerifier>, state: Weak<SessionState>) -> Self {
        Self { inner, state }
    }
}

impl ServerCertVerifier for CallbackServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;
        run_verify_callback(&self.state, end_entity, intermediates)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client verifier that runs the session's callback after webpki accepts the chain
#[derive(Debug)]
pub struct CallbackClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    state: Weak<SessionState>,
}

impl CallbackClientVerifier {
    /// Wrap a verifier for one session
    pub fn new(inner: Arc<dyn ClientCertVerifier>, state: Weak<SessionState>) -> Self {
        Self { inner, state }
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        run_verify_callback(&self.state, end_entity, intermediates)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

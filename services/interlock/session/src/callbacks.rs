//! Caller callbacks invoked from inside engine calls.
//!
//! A callback context is installed on the session immediately before an
//! engine call and removed immediately after it, so callbacks only ever run
//! within the dynamic extent of one handshake/read/write invocation.

use crate::error::CallbackError;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;

/// Hooks the engine may call back into during an operation
pub trait SessionCallbacks: Send + Sync {
    /// Inspect the peer's certificate chain after the engine's own verification passed
    fn verify_peer(&self, _chain: &[CertificateDer<'_>]) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Called once when the handshake completes
    fn handshake_completed(&self, _info: &HandshakeInfo) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Shared callback context passed to blocking and engine-mode operations
pub type CallbackContext = Arc<dyn SessionCallbacks>;

/// Callbacks that accept everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl SessionCallbacks for NoCallbacks {}

/// Parameters negotiated by a completed handshake
#[derive(Clone, Debug)]
pub struct HandshakeInfo {
    /// Negotiated protocol version
    pub protocol_version: Option<String>,
    /// Negotiated cipher suite
    pub cipher_suite: Option<String>,
    /// Protocol selected through ALPN
    pub alpn_protocol: Option<Vec<u8>>,
    /// Peer certificate chain, end entity first
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl HandshakeInfo {
    /// ALPN protocol as UTF-8, if it is valid UTF-8
    pub fn alpn_str(&self) -> Option<&str> {
        self.alpn_protocol
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }
}

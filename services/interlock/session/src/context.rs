//! Engine context: crypto provider and per-session TLS configuration.
//!
//! An [`EngineContext`] is constructed explicitly and shared by reference
//! count. Independent contexts (for example with different providers) can
//! coexist in one process.

use crate::signer::{
    ClientIdentityResolver, Identity, LocalKeySigner, ServerIdentityResolver, Signer,
};
use crate::state::SessionState;
use crate::tls::{CallbackClientVerifier, CallbackServerVerifier};
use interlock_buffer::BufferError;
use rustls::client::{VerifierBuilderError, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised while building TLS configuration
#[derive(Error, Debug)]
pub enum ContextError {
    /// rustls rejected the configuration
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate verifier could not be built
    #[error("certificate verifier error: {0}")]
    Verifier(#[from] VerifierBuilderError),

    /// I/O failure reading key material or setting up the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Engine-mode buffers could not be allocated
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// PEM input held no certificates
    #[error("no certificates found in PEM data")]
    MissingCertificates,

    /// PEM input held no private key
    #[error("no private key found in PEM data")]
    MissingKey,

    /// Server name is not a valid DNS name or IP address
    #[error("invalid server name: {0}")]
    ServerName(String),
}

/// Client-side trust and optional client certificate
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Trust anchors for the server certificate
    pub roots: RootCertStore,
    /// Client certificate, if the server asks for one
    pub identity: Option<Identity>,
}

/// Server-side certificate and optional client authentication
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Server certificate and signer
    pub identity: Identity,
    /// Trust anchors for client certificates; `None` disables client auth
    pub client_auth_roots: Option<RootCertStore>,
}

#[derive(Debug)]
struct ContextInner {
    provider: Arc<CryptoProvider>,
}

/// Shared crypto provider and configuration builder
#[derive(Debug, Clone)]
pub struct EngineContext {
    inner: Arc<ContextInner>,
}

impl EngineContext {
    /// Context using the `ring` provider
    pub fn new() -> Self {
        Self::with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    }

    /// Context using a specific provider
    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self {
            inner: Arc::new(ContextInner { provider }),
        }
    }

    /// The crypto provider
    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.inner.provider
    }

    /// Load a private key into a local signer
    pub fn load_local_signer(&self, key: PrivateKeyDer<'static>) -> Result<LocalKeySigner, ContextError> {
        let key = self.provider().key_provider.load_private_key(key)?;
        Ok(LocalKeySigner::new(key))
    }

    /// Certificate chain and key from PEM data
    pub fn load_pem_identity(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity, ContextError> {
        let chain = load_pem_certs(cert_pem)?;
        let key = rustls_pemfile::private_key(&mut io::BufReader::new(key_pem))?
            .ok_or(ContextError::MissingKey)?;
        let signer: Arc<dyn Signer> = Arc::new(self.load_local_signer(key)?);
        Ok(Identity::new(chain, signer))
    }

    /// Client configuration for one session
    pub fn client_config(
        &self,
        settings: &ClientSettings,
        state: &Arc<SessionState>,
    ) -> Result<Arc<ClientConfig>, ContextError> {
        let webpki = WebPkiServerVerifier::builder_with_provider(
            Arc::new(settings.roots.clone()),
            self.provider().clone(),
        )
        .build()?;
        let verifier = CallbackServerVerifier::new(webpki, Arc::downgrade(state));

        let builder = ClientConfig::builder_with_provider(self.provider().clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let mut config = match &settings.identity {
            Some(identity) => builder.with_client_cert_resolver(Arc::new(
                ClientIdentityResolver::new(identity.certified_key(state)),
            )),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = state.protocols().to_vec();

        debug!(
            "Built client config for session {} (client auth: {})",
            state.id(),
            settings.identity.is_some()
        );
        Ok(Arc::new(config))
    }

    /// Server configuration for one session
    pub fn server_config(
        &self,
        settings: &ServerSettings,
        state: &Arc<SessionState>,
    ) -> Result<Arc<ServerConfig>, ContextError> {
        let builder = ServerConfig::builder_with_provider(self.provider().clone())
            .with_safe_default_protocol_versions()?;

        let builder = match &settings.client_auth_roots {
            Some(roots) => {
                let webpki = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(roots.clone()),
                    self.provider().clone(),
                )
                .build()?;
                builder.with_client_cert_verifier(Arc::new(CallbackClientVerifier::new(
                    webpki,
                    Arc::downgrade(state),
                )))
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(Arc::new(ServerIdentityResolver::new(
            settings.identity.certified_key(state),
        )));
        config.alpn_protocols = state.protocols().to_vec();

        debug!(
            "Built server config for session {} (client auth: {})",
            state.id(),
            settings.client_auth_roots.is_some()
        );
        Ok(Arc::new(config))
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificates from PEM data
pub fn load_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ContextError> {
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ContextError::MissingCertificates);
    }
    Ok(certs)
}

/// Trust anchors from PEM data
pub fn load_pem_roots(pem: &[u8]) -> Result<RootCertStore, ContextError> {
    let mut roots = RootCertStore::empty();
    for cert in load_pem_certs(pem)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

//! Signing capability used for the local certificate.
//!
//! A [`Signer`] is either backed by a private key loaded through the crypto
//! provider ([`LocalKeySigner`]) or delegates every signature to caller code
//! ([`DelegatedSigner`], e.g. an HSM or remote key service). Either way it is
//! bridged into rustls' `SigningKey`, and a failing delegated signature is
//! propagated to the caller unchanged.

use crate::error::CallbackError;
use crate::state::SessionState;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Produces signatures for the local end of the handshake
pub trait Signer: Send + Sync + fmt::Debug {
    /// Key algorithm
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Pick a scheme from those the peer offered
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme>;

    /// Sign `message` with `scheme`
    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CallbackError>;
}

/// Signer backed by a key held in process memory
#[derive(Debug, Clone)]
pub struct LocalKeySigner {
    key: Arc<dyn sign::SigningKey>,
}

impl LocalKeySigner {
    /// Wrap a key loaded by a crypto provider
    pub fn new(key: Arc<dyn sign::SigningKey>) -> Self {
        Self { key }
    }
}

impl Signer for LocalKeySigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.key.algorithm()
    }

    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        self.key.choose_scheme(offered).map(|signer| signer.scheme())
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CallbackError> {
        let signer = self.key.choose_scheme(&[scheme]).ok_or_else(|| {
            CallbackError::new(format!("key cannot sign with {:?}", scheme))
        })?;
        signer.sign(message).map_err(CallbackError::new)
    }
}

type SignFn = dyn Fn(SignatureScheme, &[u8]) -> Result<Vec<u8>, CallbackError> + Send + Sync;

/// Signer that hands every signature to caller code
#[derive(Clone)]
pub struct DelegatedSigner {
    algorithm: SignatureAlgorithm,
    schemes: Vec<SignatureScheme>,
    sign_fn: Arc<SignFn>,
}

impl DelegatedSigner {
    /// Create a delegated signer supporting `schemes`, in preference order
    pub fn new<F>(algorithm: SignatureAlgorithm, schemes: Vec<SignatureScheme>, sign_fn: F) -> Self
    where
        F: Fn(SignatureScheme, &[u8]) -> Result<Vec<u8>, CallbackError> + Send + Sync + 'static,
    {
        Self {
            algorithm,
            schemes,
            sign_fn: Arc::new(sign_fn),
        }
    }
}

impl fmt::Debug for DelegatedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedSigner")
            .field("algorithm", &self.algorithm)
            .field("schemes", &self.schemes)
            .finish_non_exhaustive()
    }
}

impl Signer for DelegatedSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        self.schemes.iter().copied().find(|s| offered.contains(s))
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CallbackError> {
        (self.sign_fn)(scheme, message)
    }
}

/// Local certificate chain plus the signer for its key
#[derive(Debug, Clone)]
pub struct Identity {
    /// Certificate chain, end entity first
    pub chain: Vec<CertificateDer<'static>>,
    /// Signer for the end entity key
    pub signer: Arc<dyn Signer>,
}

impl Identity {
    /// Create an identity
    pub fn new(chain: Vec<CertificateDer<'static>>, signer: Arc<dyn Signer>) -> Self {
        Self { chain, signer }
    }

    /// rustls view of this identity, bound to one session
    pub(crate) fn certified_key(&self, state: &Arc<SessionState>) -> Arc<CertifiedKey> {
        let key = SessionSigningKey {
            signer: self.signer.clone(),
            state: Arc::downgrade(state),
        };
        Arc::new(CertifiedKey::new(self.chain.clone(), Arc::new(key)))
    }
}

/// Bridge from [`Signer`] into rustls
#[derive(Debug)]
struct SessionSigningKey {
    signer: Arc<dyn Signer>,
    state: Weak<SessionState>,
}

impl sign::SigningKey for SessionSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn sign::Signer>> {
        let scheme = self.signer.choose_scheme(offered)?;
        Some(Box::new(SchemeSigner {
            signer: self.signer.clone(),
            scheme,
            state: self.state.clone(),
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.signer.algorithm()
    }
}

#[derive(Debug)]
struct SchemeSigner {
    signer: Arc<dyn Signer>,
    scheme: SignatureScheme,
    state: Weak<SessionState>,
}

impl sign::Signer for SchemeSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        self.signer.sign(self.scheme, message).map_err(|e| {
            warn!("Signing with {:?} failed: {}", self.scheme, e);
            if let Some(state) = self.state.upgrade() {
                state.set_pending_callback_error(e);
            }
            rustls::Error::General("signing callback failed".to_string())
        })
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

/// Serves the same certificate to every client
#[derive(Debug)]
pub(crate) struct ServerIdentityResolver {
    key: Arc<CertifiedKey>,
}

impl ServerIdentityResolver {
    pub(crate) fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesServerCert for ServerIdentityResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        debug!(
            "Resolving server certificate for {:?}",
            client_hello.server_name()
        );
        Some(self.key.clone())
    }
}

/// Presents the same certificate whenever the server asks for one
#[derive(Debug)]
pub(crate) struct ClientIdentityResolver {
    key: Arc<CertifiedKey>,
}

impl ClientIdentityResolver {
    pub(crate) fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesClientCert for ClientIdentityResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interlock_wakeup::WakeupKind;
    use rustls::sign::SigningKey;

    fn delegated(fail: bool) -> DelegatedSigner {
        DelegatedSigner::new(
            SignatureAlgorithm::ECDSA,
            vec![
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP256_SHA256,
            ],
            move |_scheme, message| {
                if fail {
                    Err(CallbackError::new("token removed"))
                } else {
                    Ok(message.iter().rev().copied().collect())
                }
            },
        )
    }

    #[test]
    fn test_delegated_scheme_preference() {
        let signer = delegated(false);
        assert_eq!(
            signer.choose_scheme(&[
                SignatureScheme::ED25519,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
            ]),
            Some(SignatureScheme::ECDSA_NISTP384_SHA384)
        );
        assert_eq!(signer.choose_scheme(&[SignatureScheme::ED25519]), None);
        assert_eq!(
            signer.sign(SignatureScheme::ECDSA_NISTP256_SHA256, b"abc").unwrap(),
            b"cba"
        );
    }

    #[test]
    fn test_bridge_records_signing_failure() {
        let state = SessionState::new(WakeupKind::Pipe, Vec::new()).unwrap();
        let key = SessionSigningKey {
            signer: Arc::new(delegated(true)),
            state: Arc::downgrade(&state),
        };

        let signer = key
            .choose_scheme(&[SignatureScheme::ECDSA_NISTP256_SHA256])
            .unwrap();
        assert_eq!(signer.scheme(), SignatureScheme::ECDSA_NISTP256_SHA256);
        assert!(signer.sign(b"transcript").is_err());

        let err = state.take_pending_callback_error().unwrap();
        assert_eq!(err.to_string(), "token removed");
        state.mark_dead();
    }
}

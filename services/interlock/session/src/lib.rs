//! Interruptible blocking TLS sessions for interlock.
//!
//! This crate drives a TLS engine through blocking handshake, read and write
//! calls while keeping every blocked thread cancellable from a second thread
//! and bounded by caller timeouts.
//!
//! ## Features
//!
//! - **Operation Loop**: one generic retry loop for handshake, read, write and shutdown
//! - **Interruption**: `interrupt()`/`close()` wake any thread blocked on the transport
//! - **Socket Mode**: [`TlsSocket`] over a non-blocking TCP stream
//! - **Engine Mode**: [`BufferPairSession`] exchanging ciphertext through memory
//! - **Callbacks**: peer verification, handshake notification and delegated signing,
//!   with callback errors propagated unchanged
//!
//! ## Example
//!
//! ```rust,no_run
//! use interlock_session::{ClientSettings, EngineContext, SessionConfig, TlsSocket};
//! use std::net::TcpStream;
//!
//! # fn example(settings: ClientSettings) -> Result<(), Box<dyn std::error::Error>> {
//! let context = EngineContext::new();
//! let stream = TcpStream::connect("127.0.0.1:8443")?;
//! let socket = TlsSocket::connect(&context, stream, "localhost", &settings, &SessionConfig::default())?;
//!
//! socket.do_handshake(5_000, None)?;
//! socket.write(b"hello", 5_000, None)?;
//! socket.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod config;
pub mod context;
pub mod engine;
pub mod engine_mode;
pub mod error;
pub mod op_loop;
pub mod signer;
pub mod socket;
pub mod state;
pub mod tls;
pub mod transport;
pub mod wait;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use callbacks::{CallbackContext, HandshakeInfo, NoCallbacks, SessionCallbacks};
pub use config::SessionConfig;
pub use context::{
    load_pem_certs, load_pem_roots, ClientSettings, ContextError, EngineContext, ServerSettings,
};
pub use engine::{classify_io, Classification, Engine};
pub use engine_mode::BufferPairSession;
pub use error::{CallbackError, TlsIoError};
pub use op_loop::{OperationLoop, Progress};
pub use signer::{DelegatedSigner, Identity, LocalKeySigner, Signer};
pub use socket::TlsSocket;
pub use state::SessionState;
pub use tls::RustlsEngine;
pub use transport::{BufferTransport, SocketTransport, Transport};
pub use wait::{transport_wait, WaitOutcome};

pub use interlock_wakeup::{Direction, WaitTimeout, WakeupKind};

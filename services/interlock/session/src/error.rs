//! Error types surfaced by blocking and engine-mode operations.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Terminal failure of a handshake, read, write or shutdown
#[derive(Error, Debug)]
pub enum TlsIoError {
    /// The caller's timeout elapsed with no progress
    #[error("operation timed out")]
    Timeout,

    /// The session was interrupted or closed
    #[error("session closed")]
    Closed,

    /// Fatal transport error, OS code kept for diagnostics
    #[error("I/O error (os code {code:?}): {source}")]
    Io {
        /// Raw OS error code, if any
        code: Option<i32>,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The engine rejected the peer's data or failed internally
    #[error("TLS protocol error: {0}")]
    Protocol(String),

    /// A caller callback failed during an engine call
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// Bad buffer range or other caller mistake
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TlsIoError {
    /// Wrap an I/O error, keeping its OS code
    pub fn io(source: io::Error) -> Self {
        TlsIoError::Io {
            code: source.raw_os_error(),
            source,
        }
    }

    /// Whether the session was closed under the operation
    pub fn is_closed(&self) -> bool {
        matches!(self, TlsIoError::Closed)
    }

    /// Whether the timeout elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, TlsIoError::Timeout)
    }

    /// OS error code of a fatal I/O error
    pub fn os_code(&self) -> Option<i32> {
        match self {
            TlsIoError::Io { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<TlsIoError> for io::Error {
    fn from(err: TlsIoError) -> Self {
        match err {
            TlsIoError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            TlsIoError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            TlsIoError::Io { source, .. } => source,
            TlsIoError::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            TlsIoError::Protocol(_) | TlsIoError::Callback(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
        }
    }
}

/// Error raised by a caller callback, carried through the engine unchanged
pub struct CallbackError {
    inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl CallbackError {
    /// Wrap any error raised by a callback
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self { inner: err.into() }
    }

    /// Downcast to the original error type
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Unwrap the original error
    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.inner
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for CallbackError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("certificate pinned to another key")]
    struct PinMismatch;

    #[test]
    fn test_callback_error_keeps_original() {
        let err = TlsIoError::from(CallbackError::new(PinMismatch));
        assert_eq!(err.to_string(), "certificate pinned to another key");
        match err {
            TlsIoError::Callback(cb) => {
                assert!(cb.downcast_ref::<PinMismatch>().is_some());
                assert!(cb.into_inner().downcast::<PinMismatch>().is_ok());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let err = TlsIoError::io(io::Error::from_raw_os_error(104));
        assert_eq!(err.os_code(), Some(104));
        assert!(!err.is_closed());
        assert!(TlsIoError::Closed.is_closed());
        assert!(TlsIoError::Timeout.is_timeout());
    }

    #[test]
    fn test_into_io_error_kinds() {
        let timeout: io::Error = TlsIoError::Timeout.into();
        assert_eq!(timeout.kind(), io::ErrorKind::TimedOut);
        let closed: io::Error = TlsIoError::Closed.into();
        assert_eq!(closed.kind(), io::ErrorKind::NotConnected);
        let reset: io::Error = TlsIoError::io(io::Error::from(io::ErrorKind::ConnectionReset)).into();
        assert_eq!(reset.kind(), io::ErrorKind::ConnectionReset);
    }
}

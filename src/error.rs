use std::io;
use std::io::ErrorKind;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ErrConfigInvalid(String),
    #[error("unable to bind listening socket")]
    ErrBind(#[source] io::Error),
    #[error("key store entry is malformed: {0}")]
    ErrMalformedKey(String),
    #[error("key store backend unavailable: {0}")]
    ErrStoreUnavailable(String),
    #[error("identity is not known to the key store")]
    ErrIdentityUnknown,
    #[error("script queue is full for this identity")]
    ErrQueueFull,
    #[error("handshake deadline exceeded")]
    ErrHandshakeTimeout,
    #[error("peer offered an unknown psk identity")]
    ErrPskUnknownIdentity,
    #[error("negotiated cipher suite is not permitted: {0}")]
    ErrCipherRejected(String),
    #[error("tls failure: {0}")]
    ErrTls(String),
    #[error("request body exceeds the configured maximum")]
    ErrRequestTooLarge,
    #[error("header block exceeds the configured maximum")]
    ErrHeaderBlockTooLarge,
    #[error("malformed http request: {0}")]
    ErrMalformedRequest(String),
    #[error("unsupported http method: {0}")]
    ErrUnsupportedMethod(String),
    #[error("connection closed by peer")]
    ErrConnClosed,
    #[error("connection closed mid-request")]
    ErrConnReset,
    #[error("read/write deadline exceeded")]
    ErrDeadlineExceeded,
    #[error("no request arrived within the session idle timeout")]
    ErrIdleTimeout,
    #[error("server is shutting down")]
    ErrShuttingDown,
    #[error("io error: {0}")]
    Io(#[source] io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::UnexpectedEof => Error::ErrConnReset,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                Error::ErrConnReset
            }
            _ => Error::Io(e),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::ErrTls(e.to_string())
    }
}

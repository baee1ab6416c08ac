//! Error types shared across the engine.
//!
//! `SmtpError` is the currency backends use to report a specific wire
//! response; `ServerError` is the transport/session-loop failure family.

use std::fmt;

/// An RFC 5321 / RFC 2034 status: a three-digit code plus an enhanced
/// status code triple (`class.subject.detail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u16, pub u16, pub u16);

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// An error a [`Session`](crate::backend::Session) returns that should be
/// surfaced to the client verbatim, instead of being mapped to a generic
/// `451`/`554`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code} {enhanced} {message}")]
pub struct SmtpError {
    pub code: u16,
    pub enhanced: EnhancedCode,
    pub message: String,
}

impl SmtpError {
    pub fn new(code: u16, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        SmtpError {
            code,
            enhanced,
            message: message.into(),
        }
    }

    pub fn auth_required() -> Self {
        Self::new(502, EnhancedCode(5, 7, 0), "Please authenticate first")
    }

    pub fn auth_unsupported() -> Self {
        Self::new(502, EnhancedCode(5, 7, 0), "Authentication not supported")
    }

    pub fn tls_required() -> Self {
        Self::new(523, EnhancedCode(5, 7, 10), "Must issue a STARTTLS command first")
    }
}

impl From<std::io::Error> for SmtpError {
    fn from(e: std::io::Error) -> Self {
        SmtpError::new(451, EnhancedCode(4, 0, 0), e.to_string())
    }
}

/// Maps a backend result to the `(code, enhanced, message)` triple written
/// on the wire: typed errors surface verbatim, anything else defaults to
/// `451 4.0.0` (or `554 5.0.0` for the DATA-completion path, selected by
/// `opaque_code`).
pub fn to_smtp_status(result: &Result<(), SmtpError>, opaque_code: u16) -> (u16, EnhancedCode, String) {
    match result {
        Ok(()) => (250, EnhancedCode(2, 0, 0), "OK: queued".to_string()),
        Err(e) if e.code != 0 => (e.code, e.enhanced, e.message.clone()),
        Err(e) => (
            opaque_code,
            EnhancedCode(opaque_code / 100, 0, 0),
            format!("Transaction failed: {}", e.message),
        ),
    }
}

/// Transport/session-loop failures: everything that ends the connection
/// without necessarily being the client's fault.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("connection closed by peer")]
    Eof,
    #[error("line exceeded the configured length limit")]
    TooLongLine,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server is shutting down")]
    Shutdown,
    #[error("pipelined command after STARTTLS")]
    Pipelining,
    #[error("backend task panicked")]
    BackendPanic,
}

/// The error returned through a BDAT/DATA body reader when the client
/// resets or disconnects mid-transfer, or the server is shutting down.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("smtp: message transfer aborted")]
pub struct ErrDataReset;

/// The internal-error reply used when a backend task panics.
pub fn panic_smtp_error() -> SmtpError {
    SmtpError::new(421, EnhancedCode(4, 0, 0), "Internal server error")
}

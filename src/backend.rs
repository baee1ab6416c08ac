//! The contract the core consumes from a mail backend.
//!
//! Everything in this module is implemented by the crate's consumer, never
//! by the engine itself.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::SmtpError;
use crate::lmtp::StatusCollector;

/// Per-connection state visible to the backend at `NewSession` time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub hostname: String,
    pub local_addr: Option<std::net::SocketAddr>,
    pub remote_addr: Option<std::net::SocketAddr>,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
    BinaryMime,
}

impl BodyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyType::SevenBit => "7BIT",
            BodyType::EightBitMime => "8BITMIME",
            BodyType::BinaryMime => "BINARYMIME",
        }
    }
}

/// Parsed `MAIL FROM` parameters.
#[derive(Debug, Clone, Default)]
pub struct MailOptions {
    pub body: Option<BodyType>,
    pub size: Option<usize>,
    pub require_tls: bool,
    pub utf8: bool,
    pub auth: Option<String>,
}

/// Creates a [`Session`] for each EHLO/HELO/LHLO, and again after
/// STARTTLS.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn new_session(&self, conn: &ConnectionState) -> Result<Box<dyn Session>, SmtpError>;
}

/// One mail transaction's worth of backend state, scoped to a connection.
#[async_trait]
pub trait Session: Send {
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SmtpError>;

    async fn mail(&mut self, from: &str, opts: &MailOptions) -> Result<(), SmtpError>;

    async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError>;

    /// Called once per message; `r` yields the dot-unstuffed DATA body or
    /// the concatenated BDAT chunks, depending on which transfer mode the
    /// client used.
    async fn data(&mut self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<(), SmtpError>;

    /// Clears any in-progress transaction; called on RSET, after a
    /// completed DATA/BDAT transfer, and before STARTTLS replaces the
    /// session outright.
    async fn reset(&mut self);

    async fn logout(&mut self) -> Result<(), SmtpError>;

    /// A session that wants per-recipient LMTP statuses overrides this to
    /// return itself; sessions that don't get the core's single-status
    /// fallback, broadcasting the one `data()` result to every recipient.
    fn as_lmtp(&mut self) -> Option<&mut dyn LmtpSession> {
        None
    }
}

/// The per-recipient reporting extension used in LMTP mode.
#[async_trait]
pub trait LmtpSession: Send {
    async fn lmtp_data(
        &mut self,
        r: &mut (dyn AsyncRead + Unpin + Send),
        status: &StatusCollector,
    ) -> Result<(), SmtpError>;
}

//! An embeddable asynchronous SMTP/LMTP protocol engine: listener
//! lifecycle, per-connection state machine, DATA/BDAT body transfer,
//! STARTTLS, SASL, and LMTP per-recipient status reporting. Message
//! acceptance, storage, and delivery are the consumer's responsibility,
//! supplied through the [`backend`] traits.

pub mod backend;
pub mod body;
pub mod config;
pub mod conn;
pub mod error;
pub mod line;
pub mod lmtp;
pub mod parse;
pub mod reply;
pub mod sasl;
pub mod server;

pub use backend::{Backend, BodyType, ConnectionState, LmtpSession, MailOptions, Session};
pub use config::ServerConfig;
pub use conn::Connection;
pub use error::{EnhancedCode, ServerError, SmtpError};
pub use lmtp::StatusCollector;
pub use reply::Reply;
pub use server::Server;

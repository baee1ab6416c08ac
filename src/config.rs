//! Server configuration, immutable once a `Server` is built. A plain
//! struct with a `Default` impl rather than a file/env loader:
//! configuration loading is left to the consumer application.

use std::time::Duration;

use tokio_rustls::TlsAcceptor;

pub struct ServerConfig {
    pub domain: String,
    /// LMTP mode (RFC 2033): listens on a Unix socket and reports status
    /// per recipient after DATA/BDAT.
    pub lmtp: bool,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    /// RFC 5321 §4.5.3.1.6 doubled: 2000.
    pub max_line_length: usize,
    pub allow_insecure_auth: bool,
    /// Enforce `<addr>` bracketing on `MAIL FROM`.
    pub strict: bool,
    pub auth_disabled: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub enable_smtputf8: bool,
    pub enable_requiretls: bool,
    pub enable_binarymime: bool,
    pub tls_acceptor: Option<TlsAcceptor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            domain: "localhost".to_string(),
            lmtp: false,
            max_recipients: 0,
            max_message_bytes: 0,
            max_line_length: 2000,
            allow_insecure_auth: false,
            strict: false,
            auth_disabled: false,
            read_timeout: None,
            write_timeout: None,
            enable_smtputf8: true,
            enable_requiretls: false,
            enable_binarymime: false,
            tls_acceptor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc5321_doubled_line_length() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_line_length, 2000);
        assert!(!cfg.lmtp);
        assert!(cfg.tls_acceptor.is_none());
    }
}

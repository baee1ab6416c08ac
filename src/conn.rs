//! The per-connection dispatcher: reads one command at a time and drives
//! the EHLO/AUTH/MAIL/RCPT/DATA/BDAT state machine.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use crate::backend::{Backend, BodyType, ConnectionState, MailOptions, Session};
use crate::body::{copy_bdat_chunk, drain_to_end, DataReader};
use crate::config::ServerConfig;
use crate::error::{panic_smtp_error, to_smtp_status, EnhancedCode, ServerError, SmtpError};
use crate::line::{line_as_str, LineCodec};
use crate::lmtp::StatusCollector;
use crate::parse::{self, parse_args, parse_cmd, parse_hello_argument};
use crate::reply::Reply;
use crate::sasl::{MechanismFactory, SaslStep};

/// Any duplex byte stream the connection can speak over: a bare TCP/Unix
/// socket, or one wrapped in TLS after STARTTLS. `Box<dyn Transport>` lets
/// `upgrade_tls` swap the underlying stream type mid-connection without the
/// dispatcher itself being generic over it.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Transport for T {}

/// A placeholder transport, installed only for the instant it takes to
/// swap `Connection::framed`'s inner stream during a STARTTLS handshake.
struct ClosedIo;

impl AsyncRead for ClosedIo {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ClosedIo {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(0))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum DispatchOutcome {
    Continue,
    Quit,
}

/// Tracks an in-progress BDAT transfer: the wire-facing half of the
/// backpressured pipe, the consumer task's handle, and (in LMTP mode) the
/// per-recipient status collector.
struct BdatState {
    wire_tx: tokio::io::DuplexStream,
    task: JoinHandle<Result<(), SmtpError>>,
    status: Option<Arc<StatusCollector>>,
    recipients: Vec<String>,
    bytes_received: usize,
}

pub struct Connection<Bk: Backend + 'static> {
    framed: Framed<Box<dyn Transport>, LineCodec>,
    cfg: Arc<ServerConfig>,
    backend: Arc<Bk>,
    mechanisms: Arc<std::collections::BTreeMap<String, MechanismFactory>>,
    peer_addr: Option<std::net::SocketAddr>,
    local_addr: Option<std::net::SocketAddr>,

    is_tls: bool,
    helo: Option<String>,
    did_auth: bool,
    from_received: bool,
    recipients: Vec<String>,
    binarymime: bool,
    err_count: u8,
    bdat_failed: bool,
    session: Option<Arc<Mutex<Box<dyn Session>>>>,
    bdat: Option<BdatState>,
}

impl<Bk: Backend + 'static> Connection<Bk> {
    pub fn new(
        transport: Box<dyn Transport>,
        cfg: Arc<ServerConfig>,
        backend: Arc<Bk>,
        mechanisms: Arc<std::collections::BTreeMap<String, MechanismFactory>>,
        peer_addr: Option<std::net::SocketAddr>,
        local_addr: Option<std::net::SocketAddr>,
        is_tls: bool,
    ) -> Self {
        let codec = LineCodec::new(cfg.max_line_length);
        Connection {
            framed: Framed::new(transport, codec),
            cfg,
            backend,
            mechanisms,
            peer_addr,
            local_addr,
            is_tls,
            helo: None,
            did_auth: false,
            from_received: false,
            recipients: Vec::new(),
            binarymime: false,
            err_count: 0,
            bdat_failed: false,
            session: None,
            bdat: None,
        }
    }

    /// Drives the connection to completion: greeting, command loop, close.
    /// Every dispatch is wrapped in `catch_unwind`, since a panicking
    /// backend must not take the whole listener task down with it.
    pub async fn run(mut self) {
        if let Err(e) = self.greet().await {
            tracing::warn!(error = %e, "failed to send greeting");
            return;
        }

        loop {
            let cmd = match self.next_command().await {
                Ok(Some(cmd)) => cmd,
                Ok(None) => continue,
                Err(ServerError::TooLongLine) => {
                    let _ = self
                        .send_reply(Reply::new(500, Some(EnhancedCode(5, 4, 0)), "Line too long"))
                        .await;
                    break;
                }
                Err(ServerError::IdleTimeout) => {
                    let _ = self
                        .send_reply(Reply::new(221, Some(EnhancedCode(2, 4, 2)), "Idle timeout, bye"))
                        .await;
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ending connection");
                    break;
                }
            };

            tracing::debug!(verb = %cmd.verb, "dispatching command");
            match AssertUnwindSafe(self.dispatch(cmd)).catch_unwind().await {
                Ok(Ok(DispatchOutcome::Continue)) => continue,
                Ok(Ok(DispatchOutcome::Quit)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "ending connection after dispatch error");
                    break;
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    tracing::error!(panic = %message, "backend panicked while dispatching a command");
                    let _ = self.send_reply(Reply::from(panic_smtp_error())).await;
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn close(&mut self) {
        if let Some(bdat) = self.bdat.take() {
            drop(bdat.wire_tx);
            bdat.task.abort();
        }
        if let Some(session) = self.session.take() {
            if let Ok(mut guard) = session.try_lock() {
                let _ = guard.logout().await;
            }
        }
        let _ = self.framed.flush().await;
    }

    async fn greet(&mut self) -> Result<(), ServerError> {
        let banner = format!("{} ESMTP esmtp-engine ready", self.cfg.domain);
        self.send_reply(Reply::bare(220, banner)).await
    }

    async fn send_reply(&mut self, reply: Reply) -> Result<(), ServerError> {
        let fut = self.framed.send(reply);
        match self.cfg.write_timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| ServerError::IdleTimeout)?
                .map_err(line_error_to_server_error),
            None => fut.await.map_err(line_error_to_server_error),
        }
    }

    async fn read_line(&mut self) -> Result<bytes::BytesMut, ServerError> {
        let fut = self.framed.next();
        let item = match self.cfg.read_timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| ServerError::IdleTimeout)?,
            None => fut.await,
        };
        match item {
            Some(Ok(line)) => Ok(line),
            Some(Err(crate::line::LineError::TooLong)) => Err(ServerError::TooLongLine),
            Some(Err(crate::line::LineError::Io(e))) => Err(ServerError::Io(e)),
            Some(Err(crate::line::LineError::ChunkingDone)) => {
                unreachable!("line mode is never active while chunking_mode is set")
            }
            None => Err(ServerError::Eof),
        }
    }

    async fn next_command(&mut self) -> Result<Option<parse::Command>, ServerError> {
        let raw = self.read_line().await?;
        match parse_cmd(&line_as_str(&raw)) {
            Ok(None) => Ok(None),
            Ok(Some(cmd)) => Ok(Some(cmd)),
            Err(_) => {
                self.protocol_error(501, EnhancedCode(5, 5, 2), "Syntax error").await?;
                Ok(None)
            }
        }
    }

    /// Sends a reply and bumps the protocol-error counter, ending the
    /// connection once it passes three.
    async fn protocol_error(&mut self, code: u16, enh: EnhancedCode, msg: &'static str) -> Result<(), ServerError> {
        self.send_reply(Reply::new(code, Some(enh), msg)).await?;
        self.err_count += 1;
        if self.err_count > 3 {
            self.send_reply(Reply::new(500, Some(EnhancedCode(5, 5, 1)), "Too many errors, bye"))
                .await?;
            return Err(ServerError::Shutdown);
        }
        Ok(())
    }

    /// Whether AUTH is enabled at all (mechanisms registered, not
    /// administratively disabled). Separate from the TLS-required check in
    /// `do_auth`, which reports its own `523 5.7.10` rather than folding
    /// into this.
    fn auth_allowed(&self) -> bool {
        !self.cfg.auth_disabled && !self.mechanisms.is_empty()
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            "CHUNKING".to_string(),
        ];
        if self.cfg.tls_acceptor.is_some() && !self.is_tls {
            caps.push("STARTTLS".to_string());
        }
        if self.auth_allowed() && (self.is_tls || self.cfg.allow_insecure_auth) {
            let mechs: Vec<&str> = self.mechanisms.keys().map(String::as_str).collect();
            caps.push(format!("AUTH {}", mechs.join(" ")));
        }
        if self.cfg.enable_smtputf8 {
            caps.push("SMTPUTF8".to_string());
        }
        if self.cfg.enable_requiretls && self.is_tls {
            caps.push("REQUIRETLS".to_string());
        }
        if self.cfg.enable_binarymime {
            caps.push("BINARYMIME".to_string());
        }
        if self.cfg.max_message_bytes > 0 {
            caps.push(format!("SIZE {}", self.cfg.max_message_bytes));
        } else {
            caps.push("SIZE".to_string());
        }
        caps
    }

    async fn dispatch(&mut self, cmd: parse::Command) -> Result<DispatchOutcome, ServerError> {
        let verb = cmd.verb.as_str();
        match verb {
            "EHLO" => self.do_hello(&cmd.arg, true).await,
            "HELO" => self.do_hello(&cmd.arg, false).await,
            "LHLO" => self.do_hello(&cmd.arg, true).await,
            "STARTTLS" => self.do_starttls().await,
            "AUTH" => self.do_auth(&cmd.arg).await,
            "MAIL" => self.do_mail(&cmd.arg).await,
            "RCPT" => self.do_rcpt(&cmd.arg).await,
            "DATA" => self.do_data().await,
            "BDAT" => self.do_bdat(&cmd.arg).await,
            "RSET" => self.do_rset().await,
            "NOOP" => {
                self.send_reply(Reply::ok()).await?;
                Ok(DispatchOutcome::Continue)
            }
            "QUIT" => {
                self.send_reply(Reply::new(221, Some(EnhancedCode(2, 0, 0)), "Bye")).await?;
                Ok(DispatchOutcome::Quit)
            }
            "VRFY" => {
                self.send_reply(Reply::new(252, Some(EnhancedCode(2, 5, 0)), "Cannot VRFY user"))
                    .await?;
                Ok(DispatchOutcome::Continue)
            }
            "HELP" | "EXPN" | "TURN" | "SEND" | "SOML" | "SAML" => {
                self.send_reply(Reply::not_implemented()).await?;
                Ok(DispatchOutcome::Continue)
            }
            _ => {
                self.send_reply(Reply::new(500, Some(EnhancedCode(5, 5, 1)), "Command unrecognized"))
                    .await?;
                Ok(DispatchOutcome::Continue)
            }
        }
    }

    async fn do_hello(&mut self, arg: &str, extended: bool) -> Result<DispatchOutcome, ServerError> {
        let domain = match parse_hello_argument(arg) {
            Ok(d) => d,
            Err(_) => {
                self.protocol_error(501, EnhancedCode(5, 5, 4), "Domain argument required").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        self.reset_transaction();
        self.did_auth = false;

        let conn_state = ConnectionState {
            hostname: domain.clone(),
            local_addr: self.local_addr,
            remote_addr: self.peer_addr,
            tls: self.is_tls,
        };

        match self.backend.new_session(&conn_state).await {
            Ok(session) => {
                if let Some(old) = self.session.take() {
                    if let Ok(mut guard) = old.try_lock() {
                        let _ = guard.logout().await;
                    }
                }
                self.helo = Some(domain.clone());
                self.session = Some(Arc::new(Mutex::new(session)));

                if extended {
                    let mut lines = vec![format!("{} Hello {}", self.cfg.domain, domain)];
                    lines.extend(self.capabilities());
                    self.send_reply(Reply::multiline(250, None, lines)).await?;
                } else {
                    self.send_reply(Reply::new(250, None, format!("{} Hello {}", self.cfg.domain, domain)))
                        .await?;
                }
                Ok(DispatchOutcome::Continue)
            }
            Err(e) => {
                self.send_reply(Reply::from(e)).await?;
                Ok(DispatchOutcome::Continue)
            }
        }
    }

    async fn do_starttls(&mut self) -> Result<DispatchOutcome, ServerError> {
        let acceptor = match &self.cfg.tls_acceptor {
            Some(a) => a.clone(),
            None => {
                self.send_reply(Reply::new(502, Some(EnhancedCode(5, 5, 1)), "TLS not supported")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        if self.is_tls {
            self.send_reply(Reply::new(502, Some(EnhancedCode(5, 5, 1)), "Already running under TLS"))
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        self.send_reply(Reply::bare(220, "Ready to start TLS")).await?;

        if let Err(e) = self.upgrade_tls(acceptor).await {
            tracing::warn!(error = %e, "STARTTLS handshake failed");
            return Err(e);
        }
        Ok(DispatchOutcome::Continue)
    }

    /// Swaps `self.framed`'s inner stream for a TLS-wrapped one. `rustls`'s
    /// `TlsAcceptor::accept` consumes its input and does not hand it back
    /// on failure, so (unlike the Go original, which keeps serving
    /// plaintext after a failed handshake) a failed handshake here ends
    /// the connection; see `DESIGN.md`.
    async fn upgrade_tls(&mut self, acceptor: TlsAcceptor) -> Result<(), ServerError> {
        let placeholder = Framed::new(Box::new(ClosedIo) as Box<dyn Transport>, LineCodec::new(self.cfg.max_line_length));
        let parts = std::mem::replace(&mut self.framed, placeholder).into_parts();
        if !parts.read_buf.is_empty() {
            return Err(ServerError::Pipelining);
        }

        let tls_stream = acceptor.accept(parts.io).await.map_err(ServerError::Io)?;
        self.framed = Framed::new(Box::new(tls_stream) as Box<dyn Transport>, LineCodec::new(self.cfg.max_line_length));
        self.is_tls = true;
        self.reset_transaction();
        self.did_auth = false;
        if let Some(session) = self.session.take() {
            if let Ok(mut guard) = session.try_lock() {
                let _ = guard.logout().await;
            }
        }
        Ok(())
    }

    async fn do_auth(&mut self, arg: &str) -> Result<DispatchOutcome, ServerError> {
        if self.did_auth {
            self.send_reply(Reply::new(503, Some(EnhancedCode(5, 5, 1)), "Already authenticated"))
                .await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.helo.is_none() {
            self.send_reply(Reply::new(502, Some(EnhancedCode(5, 5, 1)), "Send hello first")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if !self.auth_allowed() {
            self.send_reply(Reply::from(SmtpError::auth_unsupported())).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if !self.is_tls && !self.cfg.allow_insecure_auth {
            self.send_reply(Reply::from(SmtpError::tls_required())).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let session_arc = match &self.session {
            Some(s) => s.clone(),
            None => {
                self.send_reply(Reply::bad_sequence()).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        let (mech_name, initial) = match arg.split_once(' ') {
            Some((m, rest)) => (m.to_ascii_uppercase(), Some(rest.trim().to_string())),
            None if !arg.is_empty() => (arg.to_ascii_uppercase(), None),
            None => {
                self.protocol_error(501, EnhancedCode(5, 5, 4), "AUTH requires a mechanism name").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        let factory = match self.mechanisms.get(&mech_name) {
            Some(f) => f.clone(),
            None => {
                self.send_reply(Reply::new(504, Some(EnhancedCode(5, 5, 4)), "Unrecognized authentication type"))
                    .await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        let mut mechanism = factory();
        let mut response = match initial {
            Some(ref s) if s == "=" => Some(Vec::new()),
            Some(s) => match base64::engine::general_purpose::STANDARD.decode(s) {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    self.send_reply(Reply::new(501, Some(EnhancedCode(5, 5, 2)), "Invalid base64")).await?;
                    return Ok(DispatchOutcome::Continue);
                }
            },
            None => None,
        };

        loop {
            let step = {
                let mut guard = session_arc.lock().await;
                mechanism.next(response.as_deref(), guard.as_mut()).await
            };

            match step {
                Ok(SaslStep::Done) => {
                    self.did_auth = true;
                    self.send_reply(Reply::new(235, Some(EnhancedCode(2, 0, 0)), "Authentication successful"))
                        .await?;
                    return Ok(DispatchOutcome::Continue);
                }
                Ok(SaslStep::Challenge(challenge)) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&challenge);
                    self.send_reply(Reply::bare(334, encoded)).await?;

                    let raw = self.read_line().await?;
                    let line = line_as_str(&raw);
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed == "*" {
                        self.send_reply(Reply::new(501, Some(EnhancedCode(5, 0, 0)), "Authentication cancelled"))
                            .await?;
                        return Ok(DispatchOutcome::Continue);
                    }
                    response = match base64::engine::general_purpose::STANDARD.decode(trimmed) {
                        Ok(bytes) => Some(bytes),
                        Err(_) => {
                            self.send_reply(Reply::new(501, Some(EnhancedCode(5, 5, 2)), "Invalid base64")).await?;
                            return Ok(DispatchOutcome::Continue);
                        }
                    };
                }
                Err(e) => {
                    self.send_reply(Reply::from(e)).await?;
                    return Ok(DispatchOutcome::Continue);
                }
            }
        }
    }

    async fn do_mail(&mut self, arg: &str) -> Result<DispatchOutcome, ServerError> {
        if self.helo.is_none() {
            self.send_reply(Reply::new(502, Some(EnhancedCode(2, 5, 1)), "Send hello first")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let session_arc = match &self.session {
            Some(s) => s.clone(),
            None => {
                self.send_reply(Reply::bad_sequence()).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        if self.from_received || self.bdat.is_some() {
            self.send_reply(Reply::bad_sequence()).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let rest = match arg.split_once(':') {
            Some((kw, rest)) if kw.eq_ignore_ascii_case("from") => rest,
            _ => {
                self.protocol_error(501, EnhancedCode(5, 5, 4), "Syntax: MAIL FROM:<address>").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        let (address, param_str) = split_path_and_params(rest);
        if self.cfg.strict && (!address.starts_with('<') || !address.ends_with('>')) {
            self.protocol_error(501, EnhancedCode(5, 5, 4), "Address must be in <brackets>").await?;
            return Ok(DispatchOutcome::Continue);
        }
        let address = address.trim_start_matches('<').trim_end_matches('>').to_string();

        let tokens: Vec<&str> = param_str.split(' ').filter(|s| !s.is_empty()).collect();
        let params = parse_args(&tokens);
        let mut opts = MailOptions::default();
        if let Some(size) = params.get("SIZE") {
            match size.parse::<usize>() {
                Ok(n) => opts.size = Some(n),
                Err(_) => {
                    self.protocol_error(501, EnhancedCode(5, 5, 4), "Invalid SIZE parameter").await?;
                    return Ok(DispatchOutcome::Continue);
                }
            }
        }
        if let Some(n) = opts.size {
            if self.cfg.max_message_bytes > 0 && n > self.cfg.max_message_bytes {
                self.send_reply(Reply::new(552, Some(EnhancedCode(5, 3, 4)), "Message size exceeds fixed limit"))
                    .await?;
                return Ok(DispatchOutcome::Continue);
            }
        }
        if let Some(body) = params.get("BODY") {
            opts.body = match body.as_str() {
                "7BIT" => Some(BodyType::SevenBit),
                "8BITMIME" => Some(BodyType::EightBitMime),
                "BINARYMIME" if self.cfg.enable_binarymime => Some(BodyType::BinaryMime),
                _ => {
                    self.send_reply(Reply::new(501, Some(EnhancedCode(5, 5, 4)), "Unsupported BODY type"))
                        .await?;
                    return Ok(DispatchOutcome::Continue);
                }
            };
            self.binarymime = opts.body == Some(BodyType::BinaryMime);
        }
        opts.utf8 = params.contains_key("SMTPUTF8") && self.cfg.enable_smtputf8;
        opts.require_tls = params.contains_key("REQUIRETLS");
        if opts.require_tls && !self.is_tls {
            self.send_reply(Reply::from(SmtpError::tls_required())).await?;
            return Ok(DispatchOutcome::Continue);
        }
        opts.auth = params.get("AUTH").cloned();

        let result = session_arc.lock().await.mail(&address, &opts).await;
        match result {
            Ok(()) => {
                self.from_received = true;
                self.recipients.clear();
                self.send_reply(Reply::ok()).await?;
            }
            Err(e) => {
                self.send_reply(Reply::from(e)).await?;
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn do_rcpt(&mut self, arg: &str) -> Result<DispatchOutcome, ServerError> {
        if !self.from_received || self.bdat.is_some() {
            self.send_reply(Reply::bad_sequence()).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let session_arc = self.session.as_ref().unwrap().clone();

        if self.cfg.max_recipients > 0 && self.recipients.len() >= self.cfg.max_recipients {
            self.send_reply(Reply::new(552, Some(EnhancedCode(5, 5, 3)), "Too many recipients")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let rest = match arg.split_once(':') {
            Some((kw, rest)) if kw.eq_ignore_ascii_case("to") => rest,
            _ => {
                self.protocol_error(501, EnhancedCode(5, 5, 4), "Syntax: RCPT TO:<address>").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        let (address, _param_str) = split_path_and_params(rest);
        if self.cfg.strict && (!address.starts_with('<') || !address.ends_with('>')) {
            self.protocol_error(501, EnhancedCode(5, 5, 4), "Address must be in <brackets>").await?;
            return Ok(DispatchOutcome::Continue);
        }
        let address = address.trim_start_matches('<').trim_end_matches('>').to_string();

        let result = session_arc.lock().await.rcpt(&address).await;
        match result {
            Ok(()) => {
                self.recipients.push(address);
                self.send_reply(Reply::ok()).await?;
            }
            Err(e) => {
                self.send_reply(Reply::from(e)).await?;
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn do_rset(&mut self) -> Result<DispatchOutcome, ServerError> {
        if let Some(bdat) = self.bdat.take() {
            drop(bdat.wire_tx);
            bdat.task.abort();
        }
        self.reset_transaction();
        self.bdat_failed = false;
        if let Some(session) = &self.session {
            session.lock().await.reset().await;
        }
        self.send_reply(Reply::ok()).await
            .map(|_| DispatchOutcome::Continue)
    }

    fn reset_transaction(&mut self) {
        self.from_received = false;
        self.recipients.clear();
        self.binarymime = false;
    }

    async fn do_data(&mut self) -> Result<DispatchOutcome, ServerError> {
        if self.bdat.is_some() || self.bdat_failed {
            self.send_reply(Reply::new(503, Some(EnhancedCode(5, 5, 1)), "BDAT may not be mixed with DATA"))
                .await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.binarymime {
            self.send_reply(Reply::new(502, Some(EnhancedCode(5, 5, 1)), "BINARYMIME requires BDAT")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if !self.from_received || self.recipients.is_empty() {
            self.send_reply(Reply::new(502, Some(EnhancedCode(5, 5, 1)), "No valid recipients")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let session_arc = self.session.as_ref().unwrap().clone();

        self.send_reply(Reply::bare(354, "Start mail input; end with <CRLF>.<CRLF>")).await?;

        let result = {
            let mut reader = DataReader::new(&mut self.framed, self.cfg.max_message_bytes);
            let mut guard = session_arc.lock().await;
            let outcome = if let Some(lmtp) = guard.as_mut().as_lmtp() {
                let status = StatusCollector::new(&self.recipients);
                let r = lmtp.lmtp_data(&mut reader, &status).await;
                status.fill_remaining(&r);
                let mut status = status;
                let statuses = status.drain_in_order(&self.recipients).await;
                DataOutcome::Lmtp(statuses)
            } else {
                DataOutcome::Single(guard.data(&mut reader).await)
            };
            if !reader.is_done() {
                let _ = drain_to_end(&mut reader).await;
            }
            outcome
        };

        let recipients = std::mem::take(&mut self.recipients);
        self.reset_transaction();
        match result {
            DataOutcome::Single(r) => {
                let (code, enh, msg) = to_smtp_status(&r, 554);
                self.send_reply(Reply::new(code, Some(enh), msg)).await?;
            }
            DataOutcome::Lmtp(statuses) => {
                self.send_lmtp_statuses(recipients, statuses).await?;
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn send_lmtp_statuses(
        &mut self,
        recipients: Vec<String>,
        statuses: Vec<Result<(), SmtpError>>,
    ) -> Result<(), ServerError> {
        for (rcpt, status) in recipients.into_iter().zip(statuses.into_iter()) {
            let (code, enh, msg) = to_smtp_status(&status, 550);
            self.send_reply(Reply::new(code, Some(enh), format!("<{}> {}", rcpt, msg))).await?;
        }
        Ok(())
    }

    async fn do_bdat(&mut self, arg: &str) -> Result<DispatchOutcome, ServerError> {
        let mut parts = arg.split_whitespace();
        let size: u64 = match parts.next().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => {
                self.protocol_error(501, EnhancedCode(5, 5, 4), "Syntax: BDAT size [LAST]").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        let last = matches!(parts.next(), Some(tok) if tok.eq_ignore_ascii_case("LAST"));

        if self.bdat_failed {
            if last {
                self.bdat_failed = false;
                self.reset_transaction();
            }
            self.send_reply(Reply::new(503, Some(EnhancedCode(5, 5, 1)), "Previous chunk was rejected")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if !self.from_received || self.recipients.is_empty() {
            let _ = crate::body::copy_bdat_chunk(&mut self.framed, size, &mut tokio::io::sink()).await;
            self.send_reply(Reply::new(554, Some(EnhancedCode(5, 5, 1)), "No valid recipients")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let bytes_so_far = self.bdat.as_ref().map(|b| b.bytes_received).unwrap_or(0);
        if self.cfg.max_message_bytes > 0 && bytes_so_far + size as usize > self.cfg.max_message_bytes {
            let _ = crate::body::copy_bdat_chunk(&mut self.framed, size, &mut tokio::io::sink()).await;
            if let Some(bdat) = self.bdat.take() {
                drop(bdat.wire_tx);
                bdat.task.abort();
            }
            self.reset_transaction();
            self.send_reply(Reply::new(552, Some(EnhancedCode(5, 3, 4)), "Message size exceeds fixed limit"))
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        if self.bdat.is_none() {
            let session_arc = self.session.as_ref().unwrap().clone();
            let (wire_tx, mut backend_half) = tokio::io::duplex(8192);
            let status = if self.cfg.lmtp {
                Some(Arc::new(StatusCollector::new(&self.recipients)))
            } else {
                None
            };
            let status_for_task = status.clone();

            let task = tokio::spawn(async move {
                let mut guard = session_arc.lock().await;
                if let Some(status) = &status_for_task {
                    if let Some(lmtp) = guard.as_mut().as_lmtp() {
                        return lmtp.lmtp_data(&mut backend_half, status).await;
                    }
                }
                let result = guard.data(&mut backend_half).await;
                if let Some(status) = &status_for_task {
                    status.fill_remaining(&result);
                }
                result
            });

            self.bdat = Some(BdatState {
                wire_tx,
                task,
                status,
                recipients: self.recipients.clone(),
                bytes_received: 0,
            });
        }

        let copy_result = {
            let bdat = self.bdat.as_mut().unwrap();
            copy_bdat_chunk(&mut self.framed, size, &mut bdat.wire_tx).await
        };

        if let Some(bdat) = self.bdat.as_mut() {
            bdat.bytes_received += size as usize;
        }

        if copy_result.is_err() {
            let bdat = self.bdat.take().unwrap();
            drop(bdat.wire_tx);
            let result = await_bdat_task(bdat.task).await;
            self.bdat_failed = true;
            let (code, enh, msg) = to_smtp_status(&result, 554);
            self.send_reply(Reply::new(code, Some(enh), msg)).await?;
            return Ok(DispatchOutcome::Continue);
        }

        if !last {
            self.send_reply(Reply::new(250, Some(EnhancedCode(2, 0, 0)), "Chunk received")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let mut bdat = self.bdat.take().unwrap();
        bdat.wire_tx.shutdown().await.ok();
        let result = await_bdat_task(bdat.task).await;

        let recipients = std::mem::take(&mut self.recipients);
        self.reset_transaction();

        if let Some(status_arc) = bdat.status {
            status_arc.fill_remaining(&result);
            let mut collector = Arc::try_unwrap(status_arc)
                .unwrap_or_else(|_| panic!("status collector still shared after the bdat task completed"));
            let statuses = collector.drain_in_order(&recipients).await;
            for (rcpt, status) in recipients.into_iter().zip(statuses.into_iter()) {
                let (code, enh, msg) = to_smtp_status(&status, 550);
                self.send_reply(Reply::new(code, Some(enh), format!("<{}> {}", rcpt, msg))).await?;
            }
        } else {
            let (code, enh, msg) = to_smtp_status(&result, 554);
            self.send_reply(Reply::new(code, Some(enh), msg)).await?;
        }
        Ok(DispatchOutcome::Continue)
    }
}

enum DataOutcome {
    Single(Result<(), SmtpError>),
    Lmtp(Vec<Result<(), SmtpError>>),
}

async fn await_bdat_task(task: JoinHandle<Result<(), SmtpError>>) -> Result<(), SmtpError> {
    match task.await {
        Ok(r) => r,
        Err(e) if e.is_panic() => Err(panic_smtp_error()),
        Err(_) => Err(SmtpError::new(451, EnhancedCode(4, 0, 0), "backend task was cancelled")),
    }
}

/// Splits `<path>` from any trailing ` PARAM=VALUE ...` tokens on a MAIL
/// FROM / RCPT TO argument tail.
fn split_path_and_params(rest: &str) -> (&str, &str) {
    let rest = rest.trim_start();
    match rest.find(' ') {
        Some(idx) => (&rest[..idx], rest[idx + 1..].trim_start()),
        None => (rest, ""),
    }
}

fn line_error_to_server_error(e: crate::line::LineError) -> ServerError {
    match e {
        crate::line::LineError::Io(io_e) => ServerError::Io(io_e),
        other => ServerError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

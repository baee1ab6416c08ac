//! A minimal demo backend: accepts any sender/recipient and logs the
//! message body.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;

use esmtp_engine::{
    Backend, ConnectionState, MailOptions, Server, ServerConfig, Session, SmtpError,
};

struct DemoBackend;

#[async_trait]
impl Backend for DemoBackend {
    async fn new_session(&self, conn: &ConnectionState) -> Result<Box<dyn Session>, SmtpError> {
        tracing::info!(hostname = %conn.hostname, remote = ?conn.remote_addr, "new session");
        Ok(Box::new(DemoSession { from: None, to: Vec::new() }))
    }
}

struct DemoSession {
    from: Option<String>,
    to: Vec<String>,
}

#[async_trait]
impl Session for DemoSession {
    async fn auth_plain(&mut self, username: &str, _password: &str) -> Result<(), SmtpError> {
        tracing::info!(username, "authenticated");
        Ok(())
    }

    async fn mail(&mut self, from: &str, _opts: &MailOptions) -> Result<(), SmtpError> {
        self.from = Some(from.to_string());
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        self.to.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<(), SmtpError> {
        let mut body = Vec::new();
        r.read_to_end(&mut body).await?;
        tracing::info!(
            from = ?self.from,
            to = ?self.to,
            bytes = body.len(),
            "message accepted"
        );
        Ok(())
    }

    async fn reset(&mut self) {
        self.from = None;
        self.to.clear();
    }

    async fn logout(&mut self) -> Result<(), SmtpError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2525".to_string())
        .parse()?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let server = Arc::new(Server::new(DemoBackend, ServerConfig::default()));

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "accept loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.close().await;
        }
    }

    Ok(())
}

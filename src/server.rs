//! Listener lifecycle: owns the accept loop and spawns one connection
//! task per client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::conn::{Connection, Transport};
use crate::sasl::{MechanismFactory, PlainMechanism};

/// Owns the listening sockets and spawns one [`Connection`] task per
/// accepted client.
pub struct Server<Bk: Backend + 'static> {
    backend: Arc<Bk>,
    cfg: Arc<ServerConfig>,
    mechanisms: Arc<BTreeMap<String, MechanismFactory>>,
    cancel: CancellationToken,
    next_id: AtomicU64,
    conns: Mutex<BTreeMap<u64, JoinHandle<()>>>,
}

impl<Bk: Backend + 'static> Server<Bk> {
    pub fn new(backend: Bk, cfg: ServerConfig) -> Self {
        let mut mechanisms = crate::sasl::default_mechanisms();
        mechanisms
            .entry("PLAIN".to_string())
            .or_insert_with(|| Arc::new(|| Box::new(PlainMechanism) as Box<dyn crate::sasl::Mechanism>));

        Server {
            backend: Arc::new(backend),
            cfg: Arc::new(cfg),
            mechanisms: Arc::new(mechanisms),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(0),
            conns: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers an additional SASL mechanism (beyond the mandatory
    /// PLAIN), e.g. a consumer-supplied `LOGIN` or `XOAUTH2`. Must be
    /// called before [`Server::serve`].
    pub fn enable_auth(&mut self, name: &str, factory: MechanismFactory) {
        Arc::get_mut(&mut self.mechanisms)
            .expect("enable_auth must be called before serve() spawns any connections")
            .insert(name.to_ascii_uppercase(), factory);
    }

    /// Accepts connections on `listener` until [`Server::close`] is
    /// called, backing off exponentially (5ms, doubling, capped at 1s) on
    /// transient accept errors.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let mut backoff = Duration::from_millis(5);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            backoff = Duration::from_millis(5);
                            self.spawn_connection(socket, peer).await;
                        }
                        Err(e) if is_transient(&e) => {
                            tracing::warn!(error = %e, backoff_ms = backoff.as_millis(), "transient accept error");
                            tokio::time::sleep(backoff).await;
                            backoff = std::cmp::min(backoff * 2, Duration::from_secs(1));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn spawn_connection(self: &Arc<Self>, socket: TcpStream, peer: std::net::SocketAddr) {
        let _ = socket.set_nodelay(true);
        let local = socket.local_addr().ok();
        let transport = Box::new(socket) as Box<dyn Transport>;

        let cfg = self.cfg.clone();
        let backend = self.backend.clone();
        let mechanisms = self.mechanisms.clone();
        let conn = Connection::new(transport, cfg, backend, mechanisms, Some(peer), local, false);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("conn", %peer, id);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = conn.run() => {}
                _ = cancel.cancelled() => {}
            }
        }.instrument(span));

        self.conns.lock().await.insert(id, handle);
    }

    /// Signals every accept loop to stop and aborts all live connection
    /// tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut conns = self.conns.lock().await;
        for (_, handle) in conns.drain() {
            handle.abort();
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionRefused | ConnectionAborted | ConnectionReset | Interrupted | WouldBlock
    )
}

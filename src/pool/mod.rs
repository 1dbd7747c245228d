
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use waitgroup::WaitGroup;

use crate::acceptor::TlsAcceptor;
use crate::codec::{HttpLimits, HttpTransport};
use crate::error::Result;
use crate::event::{EventBus, EventKind};
use crate::script_queue::ScriptQueue;
use crate::security::SecurityMonitor;
use crate::session::{Session, SessionConfig, SessionId};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    pub session: SessionConfig,
    pub http: HttpLimits,
}

struct SessionEntry {
    peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// Owns every connection task.
///
/// Sessions live in a registry keyed by [`SessionId`]; tasks know only
/// their own id, never a pool back-reference. The accept loop admits or
/// refuses in constant time and hands the socket to a fresh task, so a
/// stalled session can never block accepting.
pub struct ConnectionPool {
    cfg: PoolConfig,
    acceptor: Arc<TlsAcceptor>,
    queue: Arc<ScriptQueue>,
    bus: EventBus,
    monitor: Arc<SecurityMonitor>,
    registry: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
    active: Arc<AtomicUsize>,
    drain_tx: watch::Sender<bool>,
    drain_rx: watch::Receiver<bool>,
    wg: Mutex<Option<WaitGroup>>,
}

/// Decrements the active-connection gauge when the connection task ends,
/// however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionPool {
    pub fn new(
        cfg: PoolConfig,
        acceptor: Arc<TlsAcceptor>,
        queue: Arc<ScriptQueue>,
        bus: EventBus,
        monitor: Arc<SecurityMonitor>,
    ) -> Self {
        let (drain_tx, drain_rx) = watch::channel(false);
        ConnectionPool {
            cfg,
            acceptor,
            queue,
            bus,
            monitor,
            registry: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            drain_tx,
            drain_rx,
            wg: Mutex::new(Some(WaitGroup::new())),
        }
    }

    /// Accept loop. Returns once shutdown has been signalled.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let mut drain_rx = self.drain_rx.clone();
        loop {
            tokio::select! {
                biased;
                changed = drain_rx.changed() => {
                    if changed.is_err() || *drain_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    self.admit(tcp, peer);
                }
            }
        }
        // The listener drops here; no further connections are accepted
        // while sessions drain.
        Ok(())
    }

    /// Applies admission control and spawns the connection task. A refused
    /// socket is closed before any TLS bytes are exchanged: a failed
    /// handshake costs far more than a dropped connect.
    fn admit(&self, tcp: TcpStream, peer: SocketAddr) {
        if self.active.load(Ordering::Acquire) >= self.cfg.max_connections {
            log::info!("refusing {peer}: connection limit reached");
            self.bus.publish(EventKind::BackpressureDropped { peer });
            drop(tcp);
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);

        let sid = SessionId::new();
        let guard = ActiveGuard(Arc::clone(&self.active));
        let worker = self
            .wg
            .lock()
            .unwrap()
            .as_ref()
            .expect("wait group taken before shutdown")
            .worker();
        let acceptor = Arc::clone(&self.acceptor);
        let queue = Arc::clone(&self.queue);
        let bus = self.bus.clone();
        let monitor = Arc::clone(&self.monitor);
        let registry = Arc::clone(&self.registry);
        let session_cfg = self.cfg.session.clone();
        let http_limits = self.cfg.http;
        let drain_rx = self.drain_rx.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _worker = worker;

            match acceptor.accept(tcp, peer).await {
                Ok((stream, info)) => {
                    bus.publish(EventKind::SessionOpened {
                        session_id: sid,
                        peer,
                    });
                    bus.publish(EventKind::HandshakeCompleted {
                        session_id: sid,
                        identity: info.identity.clone(),
                        cipher: info.cipher,
                    });
                    log::info!(
                        "session {sid} opened: peer={peer} identity={:?} cipher={} ({})",
                        info.identity,
                        info.cipher,
                        info.tls_version
                    );

                    let transport = HttpTransport::new(stream, http_limits);
                    let session = Session::new(
                        sid,
                        peer,
                        info.identity,
                        info.cipher,
                        transport,
                        queue,
                        bus,
                        monitor,
                        session_cfg,
                        drain_rx,
                    );
                    session.run().await;
                }
                Err(e) => {
                    log::debug!("connection from {peer} not established: {e}");
                }
            }

            registry.lock().unwrap().remove(&sid);
        });

        let mut registry = self.registry.lock().unwrap();
        registry.insert(sid, SessionEntry { peer, handle });
        // A very short-lived task can finish before the insert above;
        // collect any such husks while we hold the lock anyway.
        registry.retain(|_, e| !e.handle.is_finished());
    }

    /// Signals drain, waits out the configured grace period, then
    /// force-closes whatever is left.
    pub async fn shutdown(&self) {
        let _ = self.drain_tx.send(true);

        let wg = self.wg.lock().unwrap().take();
        if let Some(wg) = wg {
            if timeout(self.cfg.shutdown_grace, wg.wait()).await.is_err() {
                let stragglers: Vec<(SessionId, SessionEntry)> = {
                    let mut registry = self.registry.lock().unwrap();
                    registry.drain().collect()
                };
                for (sid, entry) in stragglers {
                    log::warn!("force-closing session {sid} (peer {})", entry.peer);
                    entry.handle.abort();
                }
            }
        }
    }

    /// Connections currently alive, handshaking ones included.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// True once shutdown has been signalled.
    pub fn draining(&self) -> bool {
        *self.drain_rx.borrow()
    }
}

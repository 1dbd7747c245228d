
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;

use crate::acceptor::TlsAcceptor;
use crate::cipher_suite::CipherPolicy;
use crate::codec::HttpLimits;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::key_store::KeyStore;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::script_queue::ScriptQueue;
use crate::security::SecurityMonitor;
use crate::session::SessionConfig;

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub events_published: u64,
    pub events_dropped: u64,
    pub scripts_expired: u64,
}

/// The assembled admin server.
///
/// Construction wires the component graph and validates everything that
/// can be validated before a socket exists; `run` binds and serves until
/// `shutdown`. All durable state belongs to event subscribers, none to the
/// server itself.
pub struct Scp81Server {
    cfg: ServerConfig,
    bus: EventBus,
    key_store: Arc<KeyStore>,
    queue: Arc<ScriptQueue>,
    monitor: Arc<SecurityMonitor>,
    policy: CipherPolicy,
    pool: Arc<ConnectionPool>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Scp81Server {
    pub fn new(cfg: ServerConfig) -> Result<Self> {
        cfg.validate()?;

        let policy = CipherPolicy::new(&cfg.cipher)?;
        log::info!(
            "cipher suites enabled: {}",
            policy
                .enabled_suites()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if policy.permits_null() {
            log::warn!(
                "NULL cipher suites are enabled: connections will be integrity-protected but NOT encrypted"
            );
        }

        let key_store = Arc::new(KeyStore::from_config(&cfg.key_store)?);
        let bus = EventBus::new();
        let monitor = Arc::new(SecurityMonitor::new(cfg.security.clone(), bus.clone()));
        let queue = Arc::new(ScriptQueue::new(
            &cfg.queue,
            Arc::clone(&key_store),
            bus.clone(),
        ));
        let acceptor = Arc::new(TlsAcceptor::new(
            policy.clone(),
            Arc::clone(&key_store),
            bus.clone(),
            Arc::clone(&monitor),
            cfg.handshake_timeout(),
        )?);

        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                max_connections: cfg.max_connections,
                shutdown_grace: cfg.shutdown_grace(),
                session: SessionConfig {
                    session_timeout: cfg.session_timeout(),
                    read_timeout: cfg.read_timeout(),
                    max_requests: cfg.max_requests_per_session,
                    content_type: cfg.http.content_type.clone(),
                },
                http: HttpLimits {
                    max_header_bytes: cfg.http.max_header_bytes,
                    max_body_bytes: cfg.http.max_body_bytes,
                },
            },
            acceptor,
            Arc::clone(&queue),
            bus.clone(),
            Arc::clone(&monitor),
        ));

        Ok(Scp81Server {
            cfg,
            bus,
            key_store,
            queue,
            monitor,
            policy,
            pool,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Binds the listening socket without serving yet. Useful when the
    /// configured port is 0 and the caller needs the assigned one.
    pub async fn bind(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.cfg.host.as_str(), self.cfg.port))
            .await
            .map_err(Error::ErrBind)?;
        let addr = listener.local_addr().map_err(Error::ErrBind)?;
        *self.listener.lock().unwrap() = Some(listener);
        *self.local_addr.lock().unwrap() = Some(addr);
        Ok(addr)
    }

    /// Serves until shutdown. Binds first when `bind` was not called.
    pub async fn run(&self) -> Result<()> {
        let listener = {
            let taken = self.listener.lock().unwrap().take();
            match taken {
                Some(listener) => listener,
                None => {
                    self.bind().await?;
                    self.listener
                        .lock()
                        .unwrap()
                        .take()
                        .ok_or_else(|| Error::Other("listener vanished before run".to_owned()))?
                }
            }
        };
        let addr = listener.local_addr().map_err(Error::ErrBind)?;

        log::info!("scp81 admin server listening on {addr}");
        self.bus.publish(EventKind::ServerStarted {
            host: self.cfg.host.clone(),
            port: addr.port(),
            suites: self.policy.enabled_suites().to_vec(),
        });

        self.pool.run(listener).await
    }

    /// Graceful stop: no new connections, active sessions drained within
    /// the configured grace period, stragglers force-closed.
    pub async fn shutdown(&self, reason: &str) {
        log::info!("shutting down: {reason}");
        self.pool.shutdown().await;
        self.bus.publish(EventKind::ServerStopped {
            reason: reason.to_owned(),
        });
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn script_queue(&self) -> &Arc<ScriptQueue> {
        &self.queue
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    pub fn security_monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.pool.active_sessions(),
            events_published: self.bus.published_total(),
            events_dropped: self.bus.dropped_total(),
            scripts_expired: self.queue.expired_total(),
        }
    }
}

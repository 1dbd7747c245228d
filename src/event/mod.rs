
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::cipher_suite::CipherSuiteId;
use crate::session::{CloseReason, SessionId};

/// Default inbox depth for a subscriber that does not pick its own.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Why a handshake did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailureCause {
    Timeout,
    PskUnknownIdentity,
    CipherRejected,
    Tls,
    Io,
}

/// A lifecycle event. Immutable once published; `seq` is server-wide
/// monotonic and gap-free at the publisher (subscribers may observe gaps
/// where their inbox overflowed).
#[derive(Debug, Clone)]
pub struct Event {
    pub seq: u64,
    pub timestamp: SystemTime,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EventKind {
    ServerStarted {
        host: String,
        port: u16,
        suites: Vec<CipherSuiteId>,
    },
    ServerStopped {
        reason: String,
    },
    SessionOpened {
        session_id: SessionId,
        peer: SocketAddr,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
        apdu_in: u64,
        apdu_out: u64,
        duration: Duration,
    },
    HandshakeCompleted {
        session_id: SessionId,
        identity: String,
        cipher: CipherSuiteId,
    },
    HandshakeFailed {
        peer: SocketAddr,
        cause: HandshakeFailureCause,
    },
    PskMismatch {
        peer: SocketAddr,
        identity: String,
    },
    CipherRejected {
        peer: SocketAddr,
        cipher: String,
    },
    ApduReceived {
        session_id: SessionId,
        bytes_in: usize,
    },
    ApduSent {
        session_id: SessionId,
        bytes_out: usize,
        status_word: Option<u16>,
    },
    ScriptEnqueued {
        identity: String,
        correlation_id: String,
    },
    ScriptExpired {
        identity: String,
        correlation_id: String,
    },
    ScriptsPurged {
        identity: String,
        count: usize,
    },
    BackpressureDropped {
        peer: SocketAddr,
    },
    SuspectedBruteForce {
        peer: SocketAddr,
        identity: Option<String>,
    },
    HandshakeFailureSpike {
        count: usize,
    },
    HighErrorRate {
        identity: String,
    },
}

impl EventKind {
    /// Stable short name, used by the log sink and by metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ServerStarted { .. } => "server_started",
            EventKind::ServerStopped { .. } => "server_stopped",
            EventKind::SessionOpened { .. } => "session_opened",
            EventKind::SessionClosed { .. } => "session_closed",
            EventKind::HandshakeCompleted { .. } => "handshake_completed",
            EventKind::HandshakeFailed { .. } => "handshake_failed",
            EventKind::PskMismatch { .. } => "psk_mismatch",
            EventKind::CipherRejected { .. } => "cipher_rejected",
            EventKind::ApduReceived { .. } => "apdu_received",
            EventKind::ApduSent { .. } => "apdu_sent",
            EventKind::ScriptEnqueued { .. } => "script_enqueued",
            EventKind::ScriptExpired { .. } => "script_expired",
            EventKind::ScriptsPurged { .. } => "scripts_purged",
            EventKind::BackpressureDropped { .. } => "backpressure_dropped",
            EventKind::SuspectedBruteForce { .. } => "suspected_brute_force",
            EventKind::HandshakeFailureSpike { .. } => "handshake_failure_spike",
            EventKind::HighErrorRate { .. } => "high_error_rate",
        }
    }

    /// Alerts and failures are the events operators page on.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventKind::SuspectedBruteForce { .. }
                | EventKind::HandshakeFailureSpike { .. }
                | EventKind::HighErrorRate { .. }
        )
    }
}

struct Inbox {
    name: String,
    tx: mpsc::Sender<Arc<Event>>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    seq: AtomicU64,
    inboxes: Mutex<Vec<Inbox>>,
    dropped_total: AtomicU64,
}

/// Non-blocking fan-out of [`Event`]s.
///
/// Publishing clones one `Arc` per subscriber and uses `try_send`; a full
/// inbox costs that subscriber the event and bumps a counter, it never
/// stalls the publisher. The subscriber list lock is released before any
/// inbox is written to.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                seq: AtomicU64::new(0),
                inboxes: Mutex::new(Vec::new()),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber with a bounded inbox. Delivery preserves
    /// publish order for the events that are not dropped.
    pub fn subscribe(&self, name: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut inboxes = self.inner.inboxes.lock().unwrap();
        inboxes.push(Inbox {
            name: name.to_owned(),
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { rx, dropped }
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Arc::new(Event {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now(),
            kind,
        });

        // Snapshot the senders so no inbox write happens under the lock.
        let targets: Vec<(mpsc::Sender<Arc<Event>>, Arc<AtomicU64>)> = {
            let inboxes = self.inner.inboxes.lock().unwrap();
            inboxes
                .iter()
                .map(|i| (i.tx.clone(), Arc::clone(&i.dropped)))
                .collect()
        };

        let mut saw_closed = false;
        for (tx, dropped) in targets {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            let mut inboxes = self.inner.inboxes.lock().unwrap();
            inboxes.retain(|i| {
                if i.tx.is_closed() {
                    log::debug!("event subscriber {} went away", i.name);
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Events dropped across all subscribers since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Next sequence number to be assigned; equals the publish count.
    pub fn published_total(&self) -> u64 {
        self.inner.seq.load(Ordering::Relaxed)
    }
}

/// Receiving half of a subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Arc<Event>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    /// Events this subscriber lost to inbox overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Forwards every event to the `log` facade. Alerts come out at `warn`,
/// failures at `info`, traffic at `debug`.
pub fn spawn_log_sink(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut sub = bus.subscribe("log-sink", DEFAULT_INBOX_CAPACITY);
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            if event.kind.is_alert() {
                log::warn!("[{}] {:?}", event.seq, event.kind);
            } else {
                match event.kind {
                    EventKind::HandshakeFailed { .. }
                    | EventKind::PskMismatch { .. }
                    | EventKind::CipherRejected { .. }
                    | EventKind::BackpressureDropped { .. }
                    | EventKind::ServerStarted { .. }
                    | EventKind::ServerStopped { .. } => {
                        log::info!("[{}] {:?}", event.seq, event.kind)
                    }
                    _ => log::debug!("[{}] {:?}", event.seq, event.kind),
                }
            }
        }
    })
}

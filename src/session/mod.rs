#[cfg(test)]
mod session_test;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::cipher_suite::CipherSuiteId;
use crate::codec::{HttpTransport, Request, Response};
use crate::error::Error;
use crate::event::{EventBus, EventKind};
use crate::script_queue::ScriptQueue;
use crate::security::SecurityMonitor;

/// 128-bit random id, unique for the server lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(u128);

impl SessionId {
    pub fn new() -> Self {
        SessionId(rand::random::<u128>())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:032x})", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// Why a session terminated. Emitted verbatim in `SessionClosed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    IdleTimeout,
    MaxRequests,
    ClientReset,
    IoError,
    ProtocolViolation,
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CloseReason::Normal => "Normal",
            CloseReason::IdleTimeout => "IdleTimeout",
            CloseReason::MaxRequests => "MaxRequests",
            CloseReason::ClientReset => "ClientReset",
            CloseReason::IoError => "IoError",
            CloseReason::ProtocolViolation => "ProtocolViolation",
            CloseReason::ServerShutdown => "ServerShutdown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub read_timeout: Duration,
    pub max_requests: u32,
    pub content_type: String,
}

/// One authenticated admin connection.
///
/// Runs request/response cycles strictly sequentially: read a full POST,
/// consult the script queue for this identity, write the response. Never
/// more than one outstanding response. Sessions for the same identity are
/// independent of each other.
pub struct Session<S> {
    id: SessionId,
    peer: SocketAddr,
    identity: String,
    cipher: CipherSuiteId,
    state: SessionState,
    created_at: Instant,
    last_activity: Instant,
    apdu_in: u64,
    apdu_out: u64,
    transport: HttpTransport<S>,
    queue: Arc<ScriptQueue>,
    bus: EventBus,
    monitor: Arc<SecurityMonitor>,
    cfg: SessionConfig,
    drain_rx: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        identity: String,
        cipher: CipherSuiteId,
        transport: HttpTransport<S>,
        queue: Arc<ScriptQueue>,
        bus: EventBus,
        monitor: Arc<SecurityMonitor>,
        cfg: SessionConfig,
        drain_rx: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        Session {
            id,
            peer,
            identity,
            cipher,
            state: SessionState::Active,
            created_at: now,
            last_activity: now,
            apdu_in: 0,
            apdu_out: 0,
            transport,
            queue,
            bus,
            monitor,
            cfg,
            drain_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cipher(&self) -> CipherSuiteId {
        self.cipher
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to completion and returns the close reason.
    /// Emits `ApduReceived`/`ApduSent` per cycle and a final
    /// `SessionClosed`. All session-scoped errors end here; none escape.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.cycle_loop().await;

        self.state = SessionState::Draining;
        // Completes any buffered write and sends close-notify. Best effort:
        // the peer may already be gone.
        let _ = self.transport.shutdown().await;
        self.state = SessionState::Closed;

        log::debug!(
            "session {} closed: {} (in={} out={})",
            self.id,
            reason,
            self.apdu_in,
            self.apdu_out
        );
        self.bus.publish(EventKind::SessionClosed {
            session_id: self.id,
            reason,
            apdu_in: self.apdu_in,
            apdu_out: self.apdu_out,
            duration: self.created_at.elapsed(),
        });
        reason
    }

    async fn cycle_loop(&mut self) -> CloseReason {
        let mut cycles: u32 = 0;

        loop {
            if *self.drain_rx.borrow() {
                return CloseReason::ServerShutdown;
            }
            if cycles >= self.cfg.max_requests {
                return CloseReason::MaxRequests;
            }

            let mut drain_rx = self.drain_rx.clone();
            let read = tokio::select! {
                biased;
                _ = drain_rx.changed() => return CloseReason::ServerShutdown,
                r = self
                    .transport
                    .read_request(self.cfg.session_timeout, self.cfg.read_timeout) => r,
            };

            let request = match read {
                Ok(request) => request,
                Err(e) => return self.close_on_error(e).await,
            };

            self.last_activity = Instant::now();
            self.apdu_in += 1;
            self.bus.publish(EventKind::ApduReceived {
                session_id: self.id,
                bytes_in: request.body.len(),
            });

            // Amendment B response packets end in SW1SW2; surface it and
            // feed the error-rate window. The body is otherwise opaque.
            let status_word = trailing_status_word(&request.body);
            if let Some(sw) = status_word {
                if sw != 0x9000 {
                    self.monitor.record_apdu_error(&self.identity);
                }
            }

            let (response, fatal) = self.respond(&request, status_word);
            let sent_script = response.has_body();
            let bytes_out = response.body_len();

            if let Err(e) = self.transport.write_response(&response).await {
                log::debug!("session {}: write failed: {e}", self.id);
                return CloseReason::IoError;
            }
            self.last_activity = Instant::now();

            if sent_script {
                self.apdu_out += 1;
                self.bus.publish(EventKind::ApduSent {
                    session_id: self.id,
                    bytes_out,
                    status_word,
                });
            }

            if let Some(reason) = fatal {
                return reason;
            }
            cycles += 1;
        }
    }

    /// Builds the response for one request. The second element is `Some`
    /// when the session must terminate after the response is written.
    fn respond(
        &mut self,
        request: &Request,
        _status_word: Option<u16>,
    ) -> (Response, Option<CloseReason>) {
        if request.method != "POST" {
            return (
                Response::method_not_allowed(),
                Some(CloseReason::ProtocolViolation),
            );
        }
        if request.path != "/admin" {
            // Wrong path is answered, not fatal; the card may retry the
            // correct admin URI on the same connection.
            return (Response::not_found(), None);
        }
        if *self.drain_rx.borrow() {
            return (
                Response::service_unavailable(),
                Some(CloseReason::ServerShutdown),
            );
        }

        match self.queue.dequeue(&self.identity) {
            Some(script) => (
                Response::ok(script.payload, &self.cfg.content_type),
                None,
            ),
            None => (Response::no_content(), None),
        }
    }

    /// Maps a read error to a termination reason, answering with a status
    /// code first when the response path is still usable.
    async fn close_on_error(&mut self, e: Error) -> CloseReason {
        match e {
            Error::ErrIdleTimeout => CloseReason::IdleTimeout,
            Error::ErrConnClosed => CloseReason::Normal,
            Error::ErrConnReset => CloseReason::ClientReset,
            Error::ErrDeadlineExceeded => CloseReason::IoError,
            Error::ErrRequestTooLarge | Error::ErrHeaderBlockTooLarge => {
                let _ = self
                    .transport
                    .write_response(&Response::payload_too_large())
                    .await;
                CloseReason::ProtocolViolation
            }
            Error::ErrUnsupportedMethod(_) => {
                let _ = self
                    .transport
                    .write_response(&Response::method_not_allowed())
                    .await;
                CloseReason::ProtocolViolation
            }
            Error::ErrMalformedRequest(why) => {
                log::debug!("session {}: malformed request: {why}", self.id);
                let _ = self.transport.write_response(&Response::bad_request()).await;
                CloseReason::ProtocolViolation
            }
            Error::Io(_) => CloseReason::IoError,
            other => {
                log::debug!("session {}: {other}", self.id);
                CloseReason::IoError
            }
        }
    }
}

/// SW1SW2 from the tail of a response packet, when there is one.
pub(crate) fn trailing_status_word(body: &[u8]) -> Option<u16> {
    if body.len() < 2 {
        return None;
    }
    let sw1 = body[body.len() - 2];
    let sw2 = body[body.len() - 1];
    Some(u16::from_be_bytes([sw1, sw2]))
}


use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::SecurityConfig;
use crate::event::{EventBus, EventKind};

/// Timestamped hit counter over a sliding window. `record` answers whether
/// the threshold was crossed; an alert re-arms only after a full window has
/// passed, so a sustained attack produces one alert per window rather than
/// one per probe.
struct Window {
    hits: VecDeque<Instant>,
    alerted_at: Option<Instant>,
}

impl Window {
    fn new() -> Self {
        Window {
            hits: VecDeque::new(),
            alerted_at: None,
        }
    }

    fn record(&mut self, now: Instant, window: Duration, threshold: usize) -> Option<usize> {
        self.prune(now, window);
        self.hits.push_back(now);
        if self.hits.len() < threshold {
            return None;
        }
        match self.alerted_at {
            Some(t) if now.duration_since(t) < window => None,
            _ => {
                self.alerted_at = Some(now);
                Some(self.hits.len())
            }
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&t) = self.hits.front() {
            if now.duration_since(t) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_quiet(&self, now: Instant, window: Duration) -> bool {
        self.hits
            .back()
            .map(|&t| now.duration_since(t) >= window)
            .unwrap_or(true)
    }
}

struct State {
    mismatches: HashMap<IpAddr, Window>,
    failures: Window,
    apdu_errors: HashMap<String, Window>,
}

/// Watches event rates and raises alerts; never takes corrective action.
///
/// Counters are bumped inside short critical sections; the alert event is
/// published after the lock is released.
pub struct SecurityMonitor {
    cfg: SecurityConfig,
    bus: EventBus,
    state: Mutex<State>,
}

impl SecurityMonitor {
    pub fn new(cfg: SecurityConfig, bus: EventBus) -> Self {
        SecurityMonitor {
            cfg,
            bus,
            state: Mutex::new(State {
                mismatches: HashMap::new(),
                failures: Window::new(),
                apdu_errors: HashMap::new(),
            }),
        }
    }

    /// A peer offered an identity the key store does not know. Grouped by
    /// peer IP: a brute-forcer rotating identities still trips the wire.
    pub fn record_psk_mismatch(&self, peer: SocketAddr, identity: &str) {
        let now = Instant::now();
        let window = self.cfg.mismatch_window();
        let alert = {
            let mut state = self.state.lock().unwrap();
            sweep(&mut state.mismatches, now, window);
            state
                .mismatches
                .entry(peer.ip())
                .or_insert_with(Window::new)
                .record(now, window, self.cfg.mismatch_threshold)
        };
        if alert.is_some() {
            self.bus.publish(EventKind::SuspectedBruteForce {
                peer,
                identity: Some(identity.to_owned()),
            });
        }
    }

    /// Any failed handshake, whatever the cause.
    pub fn record_handshake_failure(&self) {
        let now = Instant::now();
        let alert = {
            let mut state = self.state.lock().unwrap();
            state
                .failures
                .record(now, self.cfg.failure_window(), self.cfg.failure_threshold)
        };
        if let Some(count) = alert {
            self.bus.publish(EventKind::HandshakeFailureSpike { count });
        }
    }

    /// A response packet carried an error status word.
    pub fn record_apdu_error(&self, identity: &str) {
        let now = Instant::now();
        let window = self.cfg.error_window();
        let alert = {
            let mut state = self.state.lock().unwrap();
            sweep(&mut state.apdu_errors, now, window);
            state
                .apdu_errors
                .entry(identity.to_owned())
                .or_insert_with(Window::new)
                .record(now, window, self.cfg.error_threshold)
        };
        if alert.is_some() {
            self.bus.publish(EventKind::HighErrorRate {
                identity: identity.to_owned(),
            });
        }
    }
}

/// Drops per-key windows that have gone a full window without a hit, so
/// one-off peers and identities do not accumulate forever.
fn sweep<K: std::hash::Hash + Eq>(
    windows: &mut HashMap<K, Window>,
    now: Instant,
    window: Duration,
) {
    windows.retain(|_, w| !w.is_quiet(now, window));
}

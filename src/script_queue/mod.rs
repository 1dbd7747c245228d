
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::key_store::KeyStore;

/// One queued admin payload: a GlobalPlatform command packet plus the
/// correlation id the producer tracks it by.
#[derive(Debug, Clone)]
pub struct Script {
    pub correlation_id: String,
    pub payload: Bytes,
    pub expires_at: Option<Instant>,
}

impl Script {
    pub fn new(correlation_id: impl Into<String>, payload: Bytes) -> Self {
        Script {
            correlation_id: correlation_id.into(),
            payload,
            expires_at: None,
        }
    }

    pub fn with_ttl(correlation_id: impl Into<String>, payload: Bytes, ttl: Duration) -> Self {
        Script {
            correlation_id: correlation_id.into(),
            payload,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.map(|t| t <= Instant::now()).unwrap_or(false)
    }
}

/// A multi-packet admin flow in progress for one identity. Opens on the
/// first delivery and closes when the identity's queue drains; scripts
/// queued meanwhile ride the same build as further HTTP cycles.
#[derive(Debug, Clone)]
pub struct PendingBuild {
    pub build_id: String,
    pub started_at: Instant,
    pub delivered: u64,
}

#[derive(Default)]
struct IdentityQueue {
    scripts: VecDeque<Script>,
    queued_bytes: usize,
    build: Option<PendingBuild>,
}

/// Bounded per-identity FIFO of pending admin scripts.
///
/// The outer map lock only resolves the per-identity slot; all queue work
/// happens under that identity's own lock, so producers and sessions on
/// different identities never contend. Overflow refuses loudly
/// (`ErrQueueFull`) instead of evicting: dropping an OTA script is the
/// caller's decision to make.
pub struct ScriptQueue {
    queues: Mutex<HashMap<String, Arc<Mutex<IdentityQueue>>>>,
    capacity_scripts: usize,
    capacity_bytes: usize,
    default_ttl: Option<Duration>,
    key_store: Arc<KeyStore>,
    bus: EventBus,
    expired_total: AtomicU64,
}

impl ScriptQueue {
    pub fn new(config: &QueueConfig, key_store: Arc<KeyStore>, bus: EventBus) -> Self {
        ScriptQueue {
            queues: Mutex::new(HashMap::new()),
            capacity_scripts: config.capacity_scripts,
            capacity_bytes: config.capacity_bytes,
            default_ttl: config.default_ttl(),
            key_store,
            bus,
            expired_total: AtomicU64::new(0),
        }
    }

    /// Queues a script for an identity. `ErrIdentityUnknown` when the key
    /// store cannot resolve the identity, `ErrQueueFull` when either the
    /// script-count or byte cap would be exceeded.
    pub fn enqueue(&self, identity: &str, mut script: Script) -> Result<()> {
        if self.key_store.lookup(identity)?.is_none() {
            return Err(Error::ErrIdentityUnknown);
        }
        if script.expires_at.is_none() {
            if let Some(ttl) = self.default_ttl {
                script.expires_at = Some(Instant::now() + ttl);
            }
        }

        let slot = self.slot_or_create(identity);
        let correlation_id = script.correlation_id.clone();
        {
            let mut q = slot.lock().unwrap();
            if q.scripts.len() >= self.capacity_scripts
                || q.queued_bytes + script.payload.len() > self.capacity_bytes
            {
                return Err(Error::ErrQueueFull);
            }
            q.queued_bytes += script.payload.len();
            q.scripts.push_back(script);
        }

        self.bus.publish(EventKind::ScriptEnqueued {
            identity: identity.to_owned(),
            correlation_id,
        });
        Ok(())
    }

    /// Hands out the next live script, dropping expired ones on the way.
    /// Non-blocking; `None` when nothing is pending.
    pub fn dequeue(&self, identity: &str) -> Option<Script> {
        let slot = self.slot(identity)?;

        let mut expired = Vec::new();
        let delivered = {
            let mut q = slot.lock().unwrap();
            let mut delivered = None;
            while let Some(script) = q.scripts.pop_front() {
                q.queued_bytes -= script.payload.len();
                if script.expired() {
                    expired.push(script.correlation_id);
                    continue;
                }
                delivered = Some(script);
                break;
            }

            if delivered.is_some() {
                let build = q.build.get_or_insert_with(|| PendingBuild {
                    build_id: format!("{:016x}", rand::random::<u64>()),
                    started_at: Instant::now(),
                    delivered: 0,
                });
                build.delivered += 1;
            }
            // The build is complete once the queue has drained.
            if q.scripts.is_empty() {
                q.build = None;
            }
            delivered
        };

        for correlation_id in expired {
            self.expired_total.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(EventKind::ScriptExpired {
                identity: identity.to_owned(),
                correlation_id,
            });
        }
        self.remove_if_empty(identity);
        delivered
    }

    /// Purges everything queued for an identity. Used on explicit
    /// revocation.
    pub fn drop_identity(&self, identity: &str) -> usize {
        let slot = {
            let mut map = self.queues.lock().unwrap();
            map.remove(identity)
        };
        let count = match slot {
            Some(slot) => {
                let mut q = slot.lock().unwrap();
                q.build = None;
                q.queued_bytes = 0;
                let n = q.scripts.len();
                q.scripts.clear();
                n
            }
            None => 0,
        };
        if count > 0 {
            self.bus.publish(EventKind::ScriptsPurged {
                identity: identity.to_owned(),
                count,
            });
        }
        count
    }

    /// Live (non-expired) scripts pending for an identity.
    pub fn peek_len(&self, identity: &str) -> usize {
        match self.slot(identity) {
            Some(slot) => {
                let q = slot.lock().unwrap();
                q.scripts.iter().filter(|s| !s.expired()).count()
            }
            None => 0,
        }
    }

    /// Bytes currently queued for an identity, expired scripts included.
    pub fn queued_bytes(&self, identity: &str) -> usize {
        match self.slot(identity) {
            Some(slot) => slot.lock().unwrap().queued_bytes,
            None => 0,
        }
    }

    /// The in-flight build for an identity, if a delivery cycle is open.
    pub fn pending_build(&self, identity: &str) -> Option<PendingBuild> {
        let slot = self.slot(identity)?;
        let q = slot.lock().unwrap();
        q.build.clone()
    }

    /// Scripts dropped on expiry since startup.
    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    fn slot_or_create(&self, identity: &str) -> Arc<Mutex<IdentityQueue>> {
        let mut map = self.queues.lock().unwrap();
        Arc::clone(map.entry(identity.to_owned()).or_default())
    }

    fn slot(&self, identity: &str) -> Option<Arc<Mutex<IdentityQueue>>> {
        let map = self.queues.lock().unwrap();
        map.get(identity).cloned()
    }

    fn remove_if_empty(&self, identity: &str) {
        let mut map = self.queues.lock().unwrap();
        if let Some(slot) = map.get(identity) {
            let empty = {
                let q = slot.lock().unwrap();
                q.scripts.is_empty() && q.build.is_none()
            };
            if empty {
                map.remove(identity);
            }
        }
    }
}

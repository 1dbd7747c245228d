#[cfg(test)]
mod key_store_test;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::KeyStoreConfig;
use crate::error::{Error, Result};
use crate::MAX_IDENTITY_LEN;

/// A pre-shared key. 16, 24 or 32 octets, enforced at construction.
///
/// The bytes deliberately never appear in `Debug` output; key material must
/// not leak through logs, events or error text.
#[derive(Clone, PartialEq, Eq)]
pub struct PskKey(Vec<u8>);

impl PskKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(PskKey(bytes)),
            n => Err(Error::ErrMalformedKey(format!(
                "key must be 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for PskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PskKey({} bytes, redacted)", self.0.len())
    }
}

/// Pluggable resolver for lookups the snapshot backends cannot serve, e.g.
/// an HSM frontend. Implementations must not block on network or disk; if
/// the underlying store can stall, interpose a thread boundary and answer
/// `ErrStoreUnavailable` while warm-up is in progress.
pub trait ExternalLookup: Send + Sync {
    fn lookup(&self, identity: &str) -> Result<Option<Vec<u8>>>;
}

enum Backend {
    Memory,
    File(PathBuf),
    External(Arc<dyn ExternalLookup>),
}

/// Maps PSK identities to shared secrets.
///
/// The map backends keep their entries behind an [`ArcSwap`]; `lookup` is a
/// single atomic snapshot read, so a concurrent `reload` never mixes old and
/// new entries within one handshake, and a lookup takes the same path
/// whether or not the identity is present.
pub struct KeyStore {
    backend: Backend,
    entries: ArcSwap<HashMap<String, PskKey>>,
}

impl KeyStore {
    pub fn from_config(config: &KeyStoreConfig) -> Result<Self> {
        match config {
            KeyStoreConfig::Memory { entries } => Self::in_memory(entries),
            KeyStoreConfig::File { path } => Self::file_backed(path.clone()),
        }
    }

    /// Fixed identity→key table given as hex strings.
    pub fn in_memory(entries: &HashMap<String, String>) -> Result<Self> {
        let mut map = HashMap::with_capacity(entries.len());
        for (identity, hex_key) in entries {
            insert_entry(&mut map, identity, hex_key)?;
        }
        Ok(KeyStore {
            backend: Backend::Memory,
            entries: ArcSwap::from_pointee(map),
        })
    }

    /// Loads `identity: hexkey` lines from `path`. The file is read once
    /// here and again on every `reload`.
    pub fn file_backed(path: PathBuf) -> Result<Self> {
        let map = load_key_file(&path)?;
        Ok(KeyStore {
            backend: Backend::File(path),
            entries: ArcSwap::from_pointee(map),
        })
    }

    pub fn external(lookup: Arc<dyn ExternalLookup>) -> Self {
        KeyStore {
            backend: Backend::External(lookup),
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Resolves an identity to its key.
    ///
    /// Unknown identity is `Ok(None)`, not an error; the TLS stack performs
    /// the actual key confirmation, the store only hands out bytes.
    /// `Err(ErrStoreUnavailable)` is transient and only possible with the
    /// external backend.
    pub fn lookup(&self, identity: &str) -> Result<Option<PskKey>> {
        if identity.len() > MAX_IDENTITY_LEN {
            return Ok(None);
        }
        match &self.backend {
            Backend::Memory | Backend::File(_) => {
                Ok(self.entries.load().get(identity).cloned())
            }
            Backend::External(ext) => match ext.lookup(identity)? {
                Some(bytes) => Ok(Some(PskKey::new(bytes)?)),
                None => Ok(None),
            },
        }
    }

    /// Snapshot of the known identities. Diagnostics only; the external
    /// backend cannot enumerate and reports none.
    pub fn identities(&self) -> Vec<String> {
        self.entries.load().keys().cloned().collect()
    }

    /// Re-reads the file backend and swaps the map atomically. Lookups that
    /// already loaded the previous snapshot are unaffected. No-op for the
    /// other backends.
    pub fn reload(&self) -> Result<()> {
        if let Backend::File(path) = &self.backend {
            let map = load_key_file(path)?;
            self.entries.store(Arc::new(map));
        }
        Ok(())
    }
}

fn insert_entry(
    map: &mut HashMap<String, PskKey>,
    identity: &str,
    hex_key: &str,
) -> Result<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(Error::ErrMalformedKey(format!(
            "identity must be 1..={MAX_IDENTITY_LEN} bytes"
        )));
    }
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::ErrMalformedKey(format!("identity {identity}: {e}")))?;
    let key = PskKey::new(bytes)
        .map_err(|e| Error::ErrMalformedKey(format!("identity {identity}: {e}")))?;
    map.insert(identity.to_owned(), key);
    Ok(())
}

/// Parses the key-store file format: one `identity: hexkey` per line, `#`
/// starts a comment. Any malformed entry fails the whole load; a store that
/// half-loads would silently lock cards out.
pub(crate) fn parse_key_file(raw: &str) -> Result<HashMap<String, PskKey>> {
    let mut map = HashMap::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (identity, hex_key) = line.split_once(':').ok_or_else(|| {
            Error::ErrMalformedKey(format!("line {}: expected `identity: hexkey`", lineno + 1))
        })?;
        insert_entry(&mut map, identity.trim(), hex_key)?;
    }
    Ok(map)
}

fn load_key_file(path: &Path) -> Result<HashMap<String, PskKey>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::ErrStoreUnavailable(format!("{}: {e}", path.display())))?;
    parse_key_file(&raw)
}

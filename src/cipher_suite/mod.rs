#[cfg(test)]
mod cipher_suite_test;

use std::fmt;

use crate::config::CipherConfig;
use crate::error::{Error, Result};

/// The closed set of TLS 1.2 PSK suites the server will ever negotiate.
/// Values are the IANA-assigned ids.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CipherSuiteId {
    Tls_Psk_With_Aes_128_Cbc_Sha256 = 0x00ae,
    Tls_Psk_With_Aes_256_Cbc_Sha384 = 0x00af,
    Tls_Psk_With_Aes_128_Cbc_Sha = 0x008c,
    Tls_Psk_With_Aes_256_Cbc_Sha = 0x008d,
    Tls_Psk_With_Null_Sha256 = 0x00b0,
    Tls_Psk_With_Null_Sha = 0x002c,
}

/// Policy grouping used to gate which handshakes are acceptable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherTier {
    Production,
    Legacy,
    Null,
}

impl fmt::Display for CipherSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256 => {
                write!(f, "TLS_PSK_WITH_AES_128_CBC_SHA256")
            }
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384 => {
                write!(f, "TLS_PSK_WITH_AES_256_CBC_SHA384")
            }
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha => {
                write!(f, "TLS_PSK_WITH_AES_128_CBC_SHA")
            }
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha => {
                write!(f, "TLS_PSK_WITH_AES_256_CBC_SHA")
            }
            CipherSuiteId::Tls_Psk_With_Null_Sha256 => write!(f, "TLS_PSK_WITH_NULL_SHA256"),
            CipherSuiteId::Tls_Psk_With_Null_Sha => write!(f, "TLS_PSK_WITH_NULL_SHA"),
        }
    }
}

impl CipherSuiteId {
    pub fn tier(&self) -> CipherTier {
        match *self {
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256
            | CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384 => CipherTier::Production,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha
            | CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha => CipherTier::Legacy,
            CipherSuiteId::Tls_Psk_With_Null_Sha256 | CipherSuiteId::Tls_Psk_With_Null_Sha => {
                CipherTier::Null
            }
        }
    }

    /// Whether the suite provides confidentiality. NULL suites authenticate
    /// only.
    pub fn confidential(&self) -> bool {
        self.tier() != CipherTier::Null
    }

    /// MAC output width in bits, used to order suite preference.
    pub fn mac_bits(&self) -> u16 {
        match *self {
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384 => 384,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256
            | CipherSuiteId::Tls_Psk_With_Null_Sha256 => 256,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha
            | CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha
            | CipherSuiteId::Tls_Psk_With_Null_Sha => 160,
        }
    }

    /// Name understood by `SSL_CTX_set_cipher_list`.
    pub fn openssl_name(&self) -> &'static str {
        match *self {
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256 => "PSK-AES128-CBC-SHA256",
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384 => "PSK-AES256-CBC-SHA384",
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha => "PSK-AES128-CBC-SHA",
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha => "PSK-AES256-CBC-SHA",
            CipherSuiteId::Tls_Psk_With_Null_Sha256 => "PSK-NULL-SHA256",
            CipherSuiteId::Tls_Psk_With_Null_Sha => "PSK-NULL-SHA",
        }
    }

    pub fn from_openssl_name(name: &str) -> Option<CipherSuiteId> {
        ALL_SUITES.iter().copied().find(|s| s.openssl_name() == name)
    }
}

impl CipherSuiteId {
    pub fn from_id(val: u16) -> Option<CipherSuiteId> {
        match val {
            0x00ae => Some(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256),
            0x00af => Some(CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384),
            0x008c => Some(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha),
            0x008d => Some(CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha),
            0x00b0 => Some(CipherSuiteId::Tls_Psk_With_Null_Sha256),
            0x002c => Some(CipherSuiteId::Tls_Psk_With_Null_Sha),
            _ => None,
        }
    }
}

pub(crate) static ALL_SUITES: &[CipherSuiteId] = &[
    CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384,
    CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256,
    CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha,
    CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha,
    CipherSuiteId::Tls_Psk_With_Null_Sha256,
    CipherSuiteId::Tls_Psk_With_Null_Sha,
];

/// Decides which PSK suites a handshake may negotiate.
///
/// Built once at startup from the cipher section of the configuration and
/// shared read-only by the acceptor.
#[derive(Debug, Clone)]
pub struct CipherPolicy {
    suites: Vec<CipherSuiteId>,
}

impl CipherPolicy {
    pub fn new(config: &CipherConfig) -> Result<Self> {
        if !config.enable_production && !config.enable_legacy && !config.enable_null {
            return Err(Error::ErrConfigInvalid(
                "no cipher suite tier is enabled".to_owned(),
            ));
        }

        let mut suites: Vec<CipherSuiteId> = ALL_SUITES
            .iter()
            .copied()
            .filter(|s| match s.tier() {
                CipherTier::Production => config.enable_production,
                CipherTier::Legacy => config.enable_legacy,
                CipherTier::Null => config.enable_null,
            })
            .collect();

        // Longer MACs first, NULL variants last whatever their MAC.
        suites.sort_by_key(|s| (!s.confidential(), std::cmp::Reverse(s.mac_bits())));

        Ok(CipherPolicy { suites })
    }

    /// Enabled suites in preference order.
    pub fn enabled_suites(&self) -> &[CipherSuiteId] {
        &self.suites
    }

    pub fn permits(&self, suite: CipherSuiteId) -> bool {
        self.suites.contains(&suite)
    }

    pub fn permits_null(&self) -> bool {
        self.suites.iter().any(|s| !s.confidential())
    }

    /// Whether any enabled suite needs the OpenSSL security level lowered
    /// (SHA-1 and NULL suites are refused at the default level).
    pub(crate) fn needs_lowered_security_level(&self) -> bool {
        self.suites.iter().any(|s| s.tier() != CipherTier::Production)
    }

    /// Colon-separated list for `SSL_CTX_set_cipher_list`, in preference
    /// order.
    pub fn openssl_cipher_list(&self) -> String {
        self.suites
            .iter()
            .map(|s| s.openssl_name())
            .collect::<Vec<_>>()
            .join(":")
    }
}

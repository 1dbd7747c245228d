use super::*;
use crate::config::CipherConfig;

fn config(production: bool, legacy: bool, null: bool) -> CipherConfig {
    CipherConfig {
        enable_production: production,
        enable_legacy: legacy,
        enable_null: null,
    }
}

#[test]
fn test_all_tiers_disabled_is_rejected() {
    let result = CipherPolicy::new(&config(false, false, false));
    assert!(matches!(result, Err(Error::ErrConfigInvalid(_))));
}

#[test]
fn test_default_policy_is_production_only() -> Result<()> {
    let policy = CipherPolicy::new(&CipherConfig::default())?;
    assert_eq!(
        policy.enabled_suites(),
        &[
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256,
        ]
    );
    assert!(!policy.permits_null());
    assert!(!policy.needs_lowered_security_level());
    Ok(())
}

#[test]
fn test_ordering_prefers_longer_macs_with_null_last() -> Result<()> {
    let policy = CipherPolicy::new(&config(true, true, true))?;
    assert_eq!(
        policy.enabled_suites(),
        &[
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha384,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256,
            CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha,
            CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha,
            CipherSuiteId::Tls_Psk_With_Null_Sha256,
            CipherSuiteId::Tls_Psk_With_Null_Sha,
        ]
    );
    Ok(())
}

#[test]
fn test_permits_follows_flags() -> Result<()> {
    let policy = CipherPolicy::new(&config(true, false, false))?;
    assert!(policy.permits(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256));
    assert!(!policy.permits(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha));
    assert!(!policy.permits(CipherSuiteId::Tls_Psk_With_Null_Sha));

    let legacy_only = CipherPolicy::new(&config(false, true, false))?;
    assert!(!legacy_only.permits(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256));
    assert!(legacy_only.permits(CipherSuiteId::Tls_Psk_With_Aes_256_Cbc_Sha));
    assert!(legacy_only.needs_lowered_security_level());
    Ok(())
}

#[test]
fn test_null_suites_are_not_confidential() {
    for suite in ALL_SUITES {
        assert_eq!(suite.confidential(), suite.tier() != CipherTier::Null);
    }
}

#[test]
fn test_openssl_cipher_list() -> Result<()> {
    let policy = CipherPolicy::new(&config(true, false, true))?;
    assert_eq!(
        policy.openssl_cipher_list(),
        "PSK-AES256-CBC-SHA384:PSK-AES128-CBC-SHA256:PSK-NULL-SHA256:PSK-NULL-SHA"
    );
    Ok(())
}

#[test]
fn test_openssl_name_round_trip() {
    for suite in ALL_SUITES {
        assert_eq!(
            CipherSuiteId::from_openssl_name(suite.openssl_name()),
            Some(*suite)
        );
    }
    assert_eq!(CipherSuiteId::from_openssl_name("ECDHE-RSA-AES128-GCM-SHA256"), None);
}

#[test]
fn test_iana_ids() {
    assert_eq!(
        CipherSuiteId::from_id(0x00ae),
        Some(CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256)
    );
    assert_eq!(
        CipherSuiteId::from_id(0x002c),
        Some(CipherSuiteId::Tls_Psk_With_Null_Sha)
    );
    assert_eq!(CipherSuiteId::from_id(0x1301), None);
}

#[test]
fn test_display_uses_iana_names() {
    assert_eq!(
        CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256.to_string(),
        "TLS_PSK_WITH_AES_128_CBC_SHA256"
    );
    assert_eq!(
        CipherSuiteId::Tls_Psk_With_Null_Sha.to_string(),
        "TLS_PSK_WITH_NULL_SHA"
    );
}

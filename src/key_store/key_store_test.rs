use super::*;

fn entries(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(id, key)| (id.to_string(), key.to_string()))
        .collect()
}

const KEY_16: &str = "0102030405060708090a0b0c0d0e0f10";
const KEY_24: &str = "000102030405060708090a0b0c0d0e0f1011121314151617";
const KEY_32: &str = "000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f";

#[test]
fn test_lookup_known_identity() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16)]))?;
    let key = store.lookup("card-A")?.expect("key should resolve");
    assert_eq!(key.as_bytes(), hex::decode(KEY_16).unwrap().as_slice());
    Ok(())
}

#[test]
fn test_lookup_unknown_identity_is_none_not_error() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16)]))?;
    assert!(store.lookup("card-Z")?.is_none());
    Ok(())
}

#[test]
fn test_lookup_is_idempotent() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16)]))?;
    let first = store.lookup("card-A")?;
    let second = store.lookup("card-A")?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_all_valid_key_lengths() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[
        ("a", KEY_16),
        ("b", KEY_24),
        ("c", KEY_32),
    ]))?;
    assert_eq!(store.lookup("a")?.unwrap().len(), 16);
    assert_eq!(store.lookup("b")?.unwrap().len(), 24);
    assert_eq!(store.lookup("c")?.unwrap().len(), 32);
    Ok(())
}

#[test]
fn test_invalid_key_length_is_fatal() {
    let result = KeyStore::in_memory(&entries(&[("card-A", "01020304")]));
    assert!(matches!(result, Err(Error::ErrMalformedKey(_))));
}

#[test]
fn test_bad_hex_is_fatal() {
    let result = KeyStore::in_memory(&entries(&[("card-A", "zz020304zz020304zz020304zz020304")]));
    assert!(matches!(result, Err(Error::ErrMalformedKey(_))));
}

#[test]
fn test_oversized_identity_resolves_to_none() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16)]))?;
    let long = "x".repeat(crate::MAX_IDENTITY_LEN + 1);
    assert!(store.lookup(&long)?.is_none());
    Ok(())
}

#[test]
fn test_identities_snapshot() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16), ("card-B", KEY_24)]))?;
    let mut identities = store.identities();
    identities.sort();
    assert_eq!(identities, vec!["card-A".to_owned(), "card-B".to_owned()]);
    Ok(())
}

#[test]
fn test_key_debug_is_redacted() -> Result<()> {
    let store = KeyStore::in_memory(&entries(&[("card-A", KEY_16)]))?;
    let key = store.lookup("card-A")?.unwrap();
    let debug = format!("{key:?}");
    assert!(!debug.contains("0102"), "debug output leaked key bytes: {debug}");
    assert!(debug.contains("redacted"));
    Ok(())
}

#[test]
fn test_parse_key_file_format() -> Result<()> {
    let map = parse_key_file(
        "# production cards\n\
         card-A: 0102030405060708090a0b0c0d0e0f10\n\
         \n\
         card-B: 000102030405060708090a0b0c0d0e0f1011121314151617\n",
    )?;
    assert_eq!(map.len(), 2);
    assert_eq!(map["card-A"].len(), 16);
    assert_eq!(map["card-B"].len(), 24);
    Ok(())
}

#[test]
fn test_parse_key_file_rejects_bad_lines() {
    assert!(matches!(
        parse_key_file("card-A 0102"),
        Err(Error::ErrMalformedKey(_))
    ));
    assert!(matches!(
        parse_key_file("card-A: 0102"),
        Err(Error::ErrMalformedKey(_))
    ));
}

#[test]
fn test_file_backend_reload_swaps_atomically() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("scp81-keys-{}", rand::random::<u64>()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("keys");

    fs::write(&path, format!("card-A: {KEY_16}\n")).unwrap();
    let store = KeyStore::file_backed(path.clone())?;
    assert!(store.lookup("card-A")?.is_some());
    assert!(store.lookup("card-B")?.is_none());

    // A snapshot taken before the reload keeps resolving the old entries.
    let before = store.lookup("card-A")?;

    fs::write(&path, format!("card-B: {KEY_24}\n")).unwrap();
    store.reload()?;
    assert!(store.lookup("card-A")?.is_none());
    assert!(store.lookup("card-B")?.is_some());
    assert_eq!(before.unwrap().len(), 16);

    fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn test_file_backend_missing_file_is_unavailable() {
    let result = KeyStore::file_backed(PathBuf::from("/nonexistent/scp81/keys"));
    assert!(matches!(result, Err(Error::ErrStoreUnavailable(_))));
}

#[test]
fn test_reload_failure_keeps_previous_snapshot() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("scp81-keys-{}", rand::random::<u64>()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("keys");

    fs::write(&path, format!("card-A: {KEY_16}\n")).unwrap();
    let store = KeyStore::file_backed(path.clone())?;

    fs::write(&path, "card-A: not-hex\n").unwrap();
    assert!(store.reload().is_err());
    assert!(store.lookup("card-A")?.is_some());

    fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

struct FixedLookup(Vec<u8>);

impl ExternalLookup for FixedLookup {
    fn lookup(&self, identity: &str) -> Result<Option<Vec<u8>>> {
        match identity {
            "hsm-card" => Ok(Some(self.0.clone())),
            "flaky" => Err(Error::ErrStoreUnavailable("warming up".to_owned())),
            _ => Ok(None),
        }
    }
}

#[test]
fn test_external_backend() -> Result<()> {
    let store = KeyStore::external(Arc::new(FixedLookup(vec![0u8; 32])));
    assert_eq!(store.lookup("hsm-card")?.unwrap().len(), 32);
    assert!(store.lookup("other")?.is_none());
    assert!(matches!(
        store.lookup("flaky"),
        Err(Error::ErrStoreUnavailable(_))
    ));
    assert!(store.identities().is_empty());
    Ok(())
}

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use super::*;
use crate::codec::HttpLimits;
use crate::config::{QueueConfig, SecurityConfig};
use crate::event::Subscription;
use crate::key_store::KeyStore;
use crate::script_queue::Script;

const KEY_16: &str = "0102030405060708090a0b0c0d0e0f10";

struct Harness {
    queue: Arc<ScriptQueue>,
    bus: EventBus,
    sub: Subscription,
    monitor: Arc<SecurityMonitor>,
    drain_tx: watch::Sender<bool>,
    drain_rx: watch::Receiver<bool>,
}

fn harness() -> Harness {
    let mut entries = HashMap::new();
    entries.insert("card-A".to_owned(), KEY_16.to_owned());
    let key_store = Arc::new(KeyStore::in_memory(&entries).unwrap());
    let bus = EventBus::new();
    let sub = bus.subscribe("test", 256);
    let monitor = Arc::new(SecurityMonitor::new(SecurityConfig::default(), bus.clone()));
    let queue = Arc::new(ScriptQueue::new(
        &QueueConfig::default(),
        key_store,
        bus.clone(),
    ));
    let (drain_tx, drain_rx) = watch::channel(false);
    Harness {
        queue,
        bus,
        sub,
        monitor,
        drain_tx,
        drain_rx,
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        session_timeout: Duration::from_millis(150),
        read_timeout: Duration::from_millis(500),
        max_requests: 256,
        content_type: "application/vnd.etsi.sct".to_owned(),
    }
}

fn spawn_session(
    h: &Harness,
    cfg: SessionConfig,
    limits: HttpLimits,
) -> (DuplexStream, tokio::task::JoinHandle<CloseReason>) {
    let (server_side, client_side) = tokio::io::duplex(256 * 1024);
    let session = Session::new(
        SessionId::new(),
        "192.0.2.7:50000".parse().unwrap(),
        "card-A".to_owned(),
        CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256,
        HttpTransport::new(server_side, limits),
        Arc::clone(&h.queue),
        h.bus.clone(),
        Arc::clone(&h.monitor),
        cfg,
        h.drain_rx.clone(),
    );
    (client_side, tokio::spawn(session.run()))
}

fn post(body: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"POST /admin HTTP/1.1\r\n");
    raw.extend_from_slice(b"Content-Type: application/vnd.etsi.sct\r\n");
    raw.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    raw.extend_from_slice(body);
    raw
}

/// Reads one response frame: status code and body.
async fn read_response(client: &mut DuplexStream) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let status: u16 = head
        .split(' ')
        .nth(1)
        .expect("status line")
        .parse()
        .expect("numeric status");
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full response body");
        body.extend_from_slice(&chunk[..n]);
    }
    (status, body)
}

async fn drain_events(sub: &mut Subscription) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Some(event) = sub.try_recv() {
        kinds.push(event.kind.clone());
    }
    kinds
}

#[tokio::test]
async fn test_happy_path_delivers_script_then_idles_out() {
    let mut h = harness();
    h.queue
        .enqueue("card-A", Script::new("select", Bytes::from_static(b"\xa0\xa4\x00\x00")))
        .unwrap();

    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    client
        .write_all(&post(b"\x80\x16\x00\x00\x01\xff"))
        .await
        .unwrap();
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"\xa0\xa4\x00\x00");

    // No further requests: the idle clock closes the session.
    let reason = handle.await.unwrap();
    assert_eq!(reason, CloseReason::IdleTimeout);

    let kinds = drain_events(&mut h.sub).await;
    let interesting: Vec<&EventKind> = kinds
        .iter()
        .filter(|k| {
            matches!(
                k,
                EventKind::ApduReceived { .. }
                    | EventKind::ApduSent { .. }
                    | EventKind::SessionClosed { .. }
            )
        })
        .collect();
    assert_eq!(interesting.len(), 3);
    assert!(matches!(
        interesting[0],
        EventKind::ApduReceived { bytes_in: 6, .. }
    ));
    assert!(matches!(
        interesting[1],
        EventKind::ApduSent {
            bytes_out: 4,
            status_word: Some(0x01ff),
            ..
        }
    ));
    match interesting[2] {
        EventKind::SessionClosed {
            reason,
            apdu_in,
            apdu_out,
            ..
        } => {
            assert_eq!(*reason, CloseReason::IdleTimeout);
            assert_eq!(*apdu_in, 1);
            assert_eq!(*apdu_out, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_queue_yields_204() {
    let h = harness();
    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    client.write_all(&post(b"\x90\x00")).await.unwrap();
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 204);
    assert!(body.is_empty());

    drop(client);
    let reason = handle.await.unwrap();
    assert_eq!(reason, CloseReason::Normal);
}

#[tokio::test]
async fn test_wrong_path_is_404_and_session_survives() {
    let mut h = harness();
    h.queue
        .enqueue("card-A", Script::new("s", Bytes::from_static(b"\x01")))
        .unwrap();
    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    let mut raw = Vec::new();
    raw.extend_from_slice(b"POST /elsewhere HTTP/1.1\r\nContent-Length: 2\r\n\r\n\x90\x00");
    client.write_all(&raw).await.unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 404);

    // The same connection can still run admin cycles.
    client.write_all(&post(b"\x90\x00")).await.unwrap();
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"\x01");

    drop(client);
    assert_eq!(handle.await.unwrap(), CloseReason::Normal);
    let _ = drain_events(&mut h.sub).await;
}

#[tokio::test]
async fn test_wrong_method_is_405_and_fatal() {
    let h = harness();
    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    client
        .write_all(b"GET /admin HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 405);

    assert_eq!(handle.await.unwrap(), CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn test_oversized_body_is_413_and_fatal() {
    let h = harness();
    let limits = HttpLimits {
        max_header_bytes: 8192,
        max_body_bytes: 16,
    };
    let (mut client, handle) = spawn_session(&h, session_config(), limits);

    client.write_all(&post(&[0u8; 17])).await.unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 413);

    assert_eq!(handle.await.unwrap(), CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn test_malformed_request_is_400_and_fatal() {
    let h = harness();
    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    client
        .write_all(b"POST /admin HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 400);

    assert_eq!(handle.await.unwrap(), CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn test_max_requests_drains_the_session() {
    let h = harness();
    let mut cfg = session_config();
    cfg.max_requests = 2;
    let (mut client, handle) = spawn_session(&h, cfg, HttpLimits::default());

    for _ in 0..2 {
        client.write_all(&post(b"\x90\x00")).await.unwrap();
        let (status, _) = read_response(&mut client).await;
        assert_eq!(status, 204);
    }

    assert_eq!(handle.await.unwrap(), CloseReason::MaxRequests);
}

#[tokio::test]
async fn test_shutdown_signal_closes_with_server_shutdown() {
    let h = harness();
    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    // One complete cycle, then the drain signal lands while the session
    // waits for the next request.
    client.write_all(&post(b"\x90\x00")).await.unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 204);

    h.drain_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), CloseReason::ServerShutdown);

    // close-notify side: the client sees EOF.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_error_status_words_feed_the_error_window() {
    let mut h = harness();
    // Rebuild the monitor with a hair-trigger threshold.
    let cfg = SecurityConfig {
        error_threshold: 2,
        ..SecurityConfig::default()
    };
    h.monitor = Arc::new(SecurityMonitor::new(cfg, h.bus.clone()));

    let (mut client, handle) = spawn_session(&h, session_config(), HttpLimits::default());

    // 6A82 = file not found; two of them cross the threshold.
    for _ in 0..2 {
        client.write_all(&post(b"\x6a\x82")).await.unwrap();
        let (status, _) = read_response(&mut client).await;
        assert_eq!(status, 204);
    }
    drop(client);
    handle.await.unwrap();

    let kinds = drain_events(&mut h.sub).await;
    assert!(
        kinds
            .iter()
            .any(|k| matches!(k, EventKind::HighErrorRate { identity } if identity == "card-A")),
        "expected a HighErrorRate alert, got {kinds:?}"
    );
}

#[test]
fn test_trailing_status_word() {
    assert_eq!(trailing_status_word(b"\x01\x02\x90\x00"), Some(0x9000));
    assert_eq!(trailing_status_word(b"\x6a\x82"), Some(0x6a82));
    assert_eq!(trailing_status_word(b"\x90"), None);
    assert_eq!(trailing_status_word(b""), None);
}

#[test]
fn test_close_reason_display_is_verbatim() {
    assert_eq!(CloseReason::Normal.to_string(), "Normal");
    assert_eq!(CloseReason::IdleTimeout.to_string(), "IdleTimeout");
    assert_eq!(CloseReason::MaxRequests.to_string(), "MaxRequests");
    assert_eq!(CloseReason::ClientReset.to_string(), "ClientReset");
    assert_eq!(CloseReason::IoError.to_string(), "IoError");
    assert_eq!(CloseReason::ProtocolViolation.to_string(), "ProtocolViolation");
    assert_eq!(CloseReason::ServerShutdown.to_string(), "ServerShutdown");
}

#[test]
fn test_session_ids_are_unique_and_hex() {
    let a = SessionId::new();
    let b = SessionId::new();
    assert_ne!(a, b);
    let text = a.to_string();
    assert_eq!(text.len(), 32);
    assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
}

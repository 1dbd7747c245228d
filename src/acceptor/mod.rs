use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslVersion};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::cipher_suite::{CipherPolicy, CipherSuiteId};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind, HandshakeFailureCause};
use crate::key_store::KeyStore;
use crate::security::SecurityMonitor;
use crate::MAX_IDENTITY_LEN;

/// What a completed handshake established.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub identity: String,
    pub cipher: CipherSuiteId,
    pub tls_version: String,
}

/// The identity a peer offered, recorded in connection ex-data by the PSK
/// callback so the post-handshake code can classify the outcome.
#[derive(Clone)]
struct OfferedIdentity {
    identity: String,
    known: bool,
}

/// Wraps the listening side of the PSK handshake.
///
/// One `SslContext` is built at startup: TLS 1.2 pinned both ways, the
/// cipher list taken verbatim from [`CipherPolicy`], and a PSK server
/// callback that resolves identities against the key store. Handshake
/// failures are reported (event + counter) and never retried; the peer has
/// to reconnect.
pub struct TlsAcceptor {
    ctx: SslContext,
    policy: CipherPolicy,
    handshake_timeout: Duration,
    bus: EventBus,
    monitor: Arc<SecurityMonitor>,
    identity_index: Index<Ssl, OfferedIdentity>,
}

impl TlsAcceptor {
    pub fn new(
        policy: CipherPolicy,
        key_store: Arc<KeyStore>,
        bus: EventBus,
        monitor: Arc<SecurityMonitor>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let identity_index = Ssl::new_ex_index::<OfferedIdentity>()?;

        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        // SHA-1 and NULL suites sit below the default security level in
        // OpenSSL 3; only drop the floor when a non-production tier was
        // explicitly enabled.
        if policy.needs_lowered_security_level() {
            builder.set_security_level(0);
        }
        builder.set_cipher_list(&policy.openssl_cipher_list())?;
        // The policy's preference order wins, not the client's.
        builder.set_options(SslOptions::CIPHER_SERVER_PREFERENCE);

        builder.set_psk_server_callback(move |ssl, identity, psk_out| {
            let offered = identity
                .filter(|id| id.len() <= MAX_IDENTITY_LEN)
                .map(|id| String::from_utf8_lossy(id).into_owned())
                .unwrap_or_default();

            // Same code path whether the identity is present or not; the
            // TLS stack does the key confirmation, we only hand out bytes.
            let key = match key_store.lookup(&offered) {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("key store lookup failed during handshake: {e}");
                    None
                }
            };

            ssl.set_ex_data(
                identity_index,
                OfferedIdentity {
                    identity: offered,
                    known: key.is_some(),
                },
            );

            match key {
                Some(key) if key.len() <= psk_out.len() => {
                    psk_out[..key.len()].copy_from_slice(key.as_bytes());
                    Ok(key.len())
                }
                _ => Ok(0),
            }
        });

        Ok(TlsAcceptor {
            ctx: builder.build(),
            policy,
            handshake_timeout,
            bus,
            monitor,
            identity_index,
        })
    }

    /// Drives the PSK handshake on an accepted socket. Returns only on a
    /// complete handshake; every failure path closes the socket (by drop),
    /// emits the matching events and bumps the failure counters.
    pub async fn accept(
        &self,
        tcp: TcpStream,
        peer: SocketAddr,
    ) -> Result<(SslStream<TcpStream>, HandshakeInfo)> {
        let ssl = Ssl::new(&self.ctx)?;
        let mut stream = SslStream::new(ssl, tcp)?;

        match timeout(self.handshake_timeout, Pin::new(&mut stream).accept()).await {
            Err(_) => {
                log::debug!("handshake with {peer} timed out");
                self.fail(peer, HandshakeFailureCause::Timeout);
                Err(Error::ErrHandshakeTimeout)
            }
            Ok(Err(e)) => {
                let offered = stream.ssl().ex_data(self.identity_index).cloned();
                match offered {
                    Some(o) if !o.known => {
                        log::info!("psk mismatch from {peer} (identity {:?})", o.identity);
                        self.bus.publish(EventKind::PskMismatch {
                            peer,
                            identity: o.identity.clone(),
                        });
                        self.monitor.record_psk_mismatch(peer, &o.identity);
                        self.fail(peer, HandshakeFailureCause::PskUnknownIdentity);
                        Err(Error::ErrPskUnknownIdentity)
                    }
                    _ => {
                        log::debug!("handshake with {peer} failed: {e}");
                        let cause = if e.io_error().is_some() {
                            HandshakeFailureCause::Io
                        } else {
                            HandshakeFailureCause::Tls
                        };
                        self.fail(peer, cause);
                        Err(Error::ErrTls(e.to_string()))
                    }
                }
            }
            Ok(Ok(())) => self.complete(stream, peer),
        }
    }

    fn complete(
        &self,
        stream: SslStream<TcpStream>,
        peer: SocketAddr,
    ) -> Result<(SslStream<TcpStream>, HandshakeInfo)> {
        let cipher_name = stream
            .ssl()
            .current_cipher()
            .map(|c| c.name().to_owned())
            .unwrap_or_default();

        let cipher = match CipherSuiteId::from_openssl_name(&cipher_name) {
            Some(cipher) if self.policy.permits(cipher) => cipher,
            _ => {
                log::warn!("rejecting {peer}: negotiated cipher {cipher_name:?} not permitted");
                self.bus.publish(EventKind::CipherRejected {
                    peer,
                    cipher: cipher_name.clone(),
                });
                self.fail(peer, HandshakeFailureCause::CipherRejected);
                return Err(Error::ErrCipherRejected(cipher_name));
            }
        };

        let identity = match stream.ssl().ex_data(self.identity_index) {
            Some(o) if o.known => o.identity.clone(),
            _ => {
                // A finished handshake without a resolved identity means the
                // callback never ran; treat it as a TLS-layer failure.
                self.fail(peer, HandshakeFailureCause::Tls);
                return Err(Error::ErrTls("handshake produced no psk identity".to_owned()));
            }
        };

        let info = HandshakeInfo {
            identity,
            cipher,
            tls_version: stream.ssl().version_str().to_owned(),
        };
        Ok((stream, info))
    }

    fn fail(&self, peer: SocketAddr, cause: HandshakeFailureCause) {
        self.bus.publish(EventKind::HandshakeFailed { peer, cause });
        self.monitor.record_handshake_failure();
    }
}

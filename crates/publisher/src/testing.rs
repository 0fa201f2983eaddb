//! Test fixtures: a throwaway PKI and an in-process MQTT broker.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rumqttc::mqttbytes;
use rumqttc::{Packet, QoS};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Largest packet the mock broker accepts.
const MAX_PACKET_SIZE: usize = 64 * 1024;

/// A CA plus one broker and one client certificate, with the client material
/// written to a temporary directory.
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    ca_der: rustls::pki_types::CertificateDer<'static>,
    dir: TempDir,
}

impl TestPki {
    /// Mint a fresh CA and leaf certificates. `server_names` become the broker
    /// certificate's subject alternative names.
    pub fn generate(server_names: &[&str]) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "telemetry test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let names: Vec<String> = server_names.iter().map(|s| s.to_string()).collect();
        let (server_cert, server_key) =
            leaf(names, ExtendedKeyUsagePurpose::ServerAuth, &ca_cert, &ca_key);
        let (client_cert, client_key) = leaf(
            vec!["publisher.test".to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
            &ca_cert,
            &ca_key,
        );

        let pki = Self {
            ca_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
            ca_der: ca_cert.der().clone(),
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::write(pki.dir.path().join("ca.pem"), &pki.ca_pem).unwrap();
        std::fs::write(pki.dir.path().join("client.pem"), &pki.client_cert_pem).unwrap();
        std::fs::write(pki.dir.path().join("client.key"), &pki.client_key_pem).unwrap();
        pki
    }

    /// `(ca, client cert, client key)` file paths.
    pub fn client_paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.dir.path().join("ca.pem"),
            self.dir.path().join("client.pem"),
            self.dir.path().join("client.key"),
        )
    }

    /// Broker-side config that requires a client certificate issued by this CA.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();

        let certs = rustls_pemfile::certs(&mut self.server_cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut self.server_key_pem.as_bytes())
            .unwrap()
            .unwrap();

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .unwrap();
        Arc::new(config)
    }
}

fn leaf(
    names: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names).unwrap();
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
    (cert, key)
}

// ---------------------------------------------------------------------------
// Mock broker
// ---------------------------------------------------------------------------

/// What the mock broker observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { client_id: String, keep_alive: u16 },
    Published {
        topic: String,
        qos: QoS,
        pkid: u16,
        payload: Bytes,
    },
    Pinged,
    Disconnected,
    Closed,
    HandshakeFailed,
}

/// Mock broker behaviour.
#[derive(Clone)]
pub struct BrokerOptions {
    pub tls: Option<Arc<ServerConfig>>,
    /// CONNACK return code; anything but 0 hangs up after replying.
    pub connack: u8,
    pub ack_publishes: bool,
    pub answer_pings: bool,
    pub close_after_connack: bool,
    /// Read CONNECT but never answer it.
    pub silent: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            tls: None,
            connack: 0,
            ack_publishes: true,
            answer_pings: true,
            close_after_connack: false,
            silent: false,
        }
    }
}

/// A single-connection MQTT broker on a loopback port.
pub struct MockBroker {
    pub port: u16,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl MockBroker {
    pub async fn start(options: BrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            match options.tls.clone() {
                Some(config) => match TlsAcceptor::from(config).accept(tcp).await {
                    Ok(tls) => serve(tls, &options, &tx).await,
                    Err(_) => {
                        let _ = tx.send(BrokerEvent::HandshakeFailed);
                    }
                },
                None => serve(tcp, &options, &tx).await,
            }
        });

        Self { port, events }
    }

    /// Next observed event, failing the test after five seconds.
    pub async fn next_event(&mut self) -> BrokerEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.events.recv())
            .await
            .expect("broker event timed out")
            .expect("broker task ended")
    }
}

async fn serve<S>(mut stream: S, options: &BrokerOptions, events: &mpsc::UnboundedSender<BrokerEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let packet = loop {
            match Packet::read(&mut buf, MAX_PACKET_SIZE) {
                Ok(packet) => break packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(_) => {
                    let _ = events.send(BrokerEvent::Closed);
                    return;
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = events.send(BrokerEvent::Closed);
                    return;
                }
                Ok(_) => {}
            }
        };

        let mut hang_up = false;
        let reply: Option<Vec<u8>> = match packet {
            Packet::Connect(connect) => {
                let _ = events.send(BrokerEvent::Connected {
                    client_id: connect.client_id,
                    keep_alive: connect.keep_alive,
                });
                if options.silent {
                    continue;
                }
                hang_up = options.close_after_connack || options.connack != 0;
                Some(vec![0x20, 0x02, 0x00, options.connack])
            }
            Packet::Publish(publish) => {
                let ack = (publish.qos == QoS::AtLeastOnce && options.ack_publishes).then(|| {
                    let [hi, lo] = publish.pkid.to_be_bytes();
                    vec![0x40, 0x02, hi, lo]
                });
                let _ = events.send(BrokerEvent::Published {
                    topic: String::from_utf8_lossy(publish.topic.as_ref()).into_owned(),
                    qos: publish.qos,
                    pkid: publish.pkid,
                    payload: publish.payload,
                });
                ack
            }
            Packet::PingReq => {
                let _ = events.send(BrokerEvent::Pinged);
                options.answer_pings.then(|| vec![0xD0, 0x00])
            }
            Packet::Disconnect => {
                let _ = events.send(BrokerEvent::Disconnected);
                return;
            }
            _ => None,
        };

        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() || stream.flush().await.is_err() {
                let _ = events.send(BrokerEvent::Closed);
                return;
            }
        }
        if hang_up {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

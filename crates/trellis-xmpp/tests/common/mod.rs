//! Test utilities for end-to-end stream tests.
//!
//! Provides an in-process server on an ephemeral port with a memory-backed
//! virtual host, self-signed TLS material, and a raw XML client that reads
//! until a pattern shows up.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use trellis_xmpp::server::{self, ServerContext};
use trellis_xmpp::tls::TlsContext;
use trellis_xmpp::{Config, MemoryStorage, PeerConnector, Role, SessionHandle, Storage};

/// The served virtual host.
pub const DOMAIN: &str = "example.com";

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the ring provider and a test log writer, once per binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// A configuration serving [`DOMAIN`] from memory, plus `extra` TOML.
pub fn config(extra: &str) -> Config {
    config_for(DOMAIN, extra)
}

/// A configuration serving `domain` from memory, plus `extra` TOML.
pub fn config_for(domain: &str, extra: &str) -> Config {
    Config::from_toml_str(&format!(
        "[storage]\nprovider = \"memory\"\n\n[hosts.\"{}\"]\n\n{}",
        domain, extra
    ))
    .expect("test config")
}

/// Peer connector that never reaches anyone.
pub struct NoPeers;

#[async_trait]
impl PeerConnector for NoPeers {
    async fn connect(&self, _to: &str, _from: &str) -> Option<Arc<SessionHandle>> {
        None
    }
}

/// Self-signed certificate and key for one domain.
pub struct TestTlsCredentials {
    pub cert: CertificateDer<'static>,
    pub key: Vec<u8>,
}

impl TestTlsCredentials {
    pub fn generate(domain: &str) -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![domain.to_string()]).expect("self-signed certificate");
        Self {
            cert: cert.der().clone(),
            key: key_pair.serialize_der(),
        }
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()))
    }

    /// Client connector trusting only this certificate.
    pub fn connector(&self) -> TlsConnector {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots())
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Connector trusting this certificate and presenting `identity`, the
    /// way a peer server authenticates for SASL EXTERNAL.
    pub fn connector_as(&self, identity: &TestTlsCredentials) -> TlsConnector {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots())
            .with_client_auth_cert(vec![identity.cert.clone()], identity.key())
            .expect("client certificate");
        TlsConnector::from(Arc::new(config))
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).expect("trust test certificate");
        roots
    }
}

/// A running server accepting client streams.
pub struct TestServer {
    pub domain: String,
    pub addr: SocketAddr,
    pub context: Arc<ServerContext>,
    pub storage: Arc<MemoryStorage>,
    pub credentials: Option<TestTlsCredentials>,
}

impl TestServer {
    /// Start with a certificate for [`DOMAIN`] and the given accounts.
    pub async fn start(users: &[(&str, &str)]) -> Self {
        Self::start_with("", users, true).await
    }

    /// Start without any certificate; STARTTLS is refused.
    pub async fn start_without_tls(users: &[(&str, &str)]) -> Self {
        Self::start_with("", users, false).await
    }

    /// Start with extra configuration TOML.
    pub async fn start_with(extra: &str, users: &[(&str, &str)], with_tls: bool) -> Self {
        Self::start_for(DOMAIN, extra, users, with_tls, Arc::new(NoPeers)).await
    }

    /// Start serving `domain`, reaching remote domains through `connector`.
    pub async fn start_for(
        domain: &str,
        extra: &str,
        users: &[(&str, &str)],
        with_tls: bool,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        init_tracing();

        let mut storage = MemoryStorage::new();
        for (jid, password) in users {
            storage = storage.with_user(jid, password).expect("seed account");
        }
        let storage = Arc::new(storage);
        let mut vhosts: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        vhosts.insert(domain.to_string(), storage.clone());

        let mut tls = TlsContext::empty(false).expect("tls context");
        let credentials = with_tls.then(|| TestTlsCredentials::generate(domain));
        if let Some(creds) = &credentials {
            tls.add_host(domain, vec![creds.cert.clone()], creds.key())
                .expect("install certificate");
        }

        let context =
            ServerContext::with_connector(Arc::new(config_for(domain, extra)), vhosts, tls, connector);
        let addr = listen(&context, Role::Client).await;

        Self {
            domain: domain.to_string(),
            addr,
            context,
            storage,
            credentials,
        }
    }

    /// Accept streams of another role on a fresh port.
    pub async fn listen(&self, role: Role) -> SocketAddr {
        listen(&self.context, role).await
    }

    /// Connect, negotiate TLS, authenticate and bind `resource`.
    pub async fn login(&self, user: &str, password: &str, resource: &str) -> RawXmppClient {
        let domain = self.domain.as_str();
        let mut client = RawXmppClient::connect(self.addr).await.expect("connect");
        client.send(&stream_header(domain)).await.unwrap();
        client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();

        client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
        client.read_until("<proceed", DEFAULT_TIMEOUT).await.unwrap();
        let creds = self.credentials.as_ref().expect("server has a certificate");
        client.upgrade(creds.connector(), domain).await.unwrap();

        client.send(&stream_header(domain)).await.unwrap();
        client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
        client
            .send(&format!(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
                encode_sasl_plain(user, password)
            ))
            .await
            .unwrap();
        client.read_until("<success", DEFAULT_TIMEOUT).await.unwrap();
        client.clear();

        client.send(&stream_header(domain)).await.unwrap();
        client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
        client
            .send(&format!(
                "<iq type='set' id='bind1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <resource>{}</resource></bind></iq>",
                resource
            ))
            .await
            .unwrap();
        client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
        client.clear();
        client
    }
}

async fn listen(context: &Arc<ServerContext>, role: Role) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server::serve(Arc::clone(context), listener, role));
    addr
}

enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A client speaking raw XML over TCP, optionally upgraded to TLS.
pub struct RawXmppClient {
    stream: Option<ClientStream>,
    buffer: String,
}

impl RawXmppClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream: Some(ClientStream::Tcp(stream)),
            buffer: String::new(),
        })
    }

    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        match self.stream.as_mut() {
            Some(ClientStream::Tcp(s)) => s.write_all(data.as_bytes()).await,
            Some(ClientStream::Tls(s)) => {
                s.write_all(data.as_bytes()).await?;
                s.flush().await
            }
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no stream")),
        }
    }

    /// Read once into the buffer. Returns the number of bytes read.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 4096];
        let read = async {
            match self.stream.as_mut() {
                Some(ClientStream::Tcp(s)) => s.read(&mut buf).await,
                Some(ClientStream::Tls(s)) => s.read(&mut buf).await,
                None => Ok(0),
            }
        };
        let n = match timeout(timeout_dur, read).await {
            Ok(result) => result?,
            Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Read timeout")),
        };
        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Read until the buffer contains `pattern`.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        self.read_until_match(pattern, |buffer| buffer.contains(pattern), timeout_dur)
            .await
    }

    /// Read until the buffer holds attribute `name` with `value`, in either
    /// quote style.
    pub async fn read_until_attr(
        &mut self,
        name: &str,
        value: &str,
        timeout_dur: Duration,
    ) -> std::io::Result<String> {
        let what = format!("{}={}", name, value);
        self.read_until_match(&what, |buffer| has_attr(buffer, name, value), timeout_dur)
            .await
    }

    async fn read_until_match(
        &mut self,
        what: &str,
        done: impl Fn(&str) -> bool,
        timeout_dur: Duration,
    ) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !done(&self.buffer) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", what),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for: {}", what),
                ));
            }
        }
        Ok(self.buffer.clone())
    }

    /// Keep reading until nothing arrives for `quiet`.
    pub async fn read_quiet(&mut self, quiet: Duration) -> String {
        loop {
            match self.read(quiet).await {
                Ok(n) if n > 0 => continue,
                _ => return self.buffer.clone(),
            }
        }
    }

    /// Read until the server closes the connection.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if self.read(remaining).await? == 0 {
                return Ok(self.buffer.clone());
            }
        }
    }

    /// Upgrade the connection after `<proceed/>`.
    pub async fn upgrade(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<()> {
        let Some(ClientStream::Tcp(tcp)) = self.stream.take() else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "already upgraded"));
        };
        let name = ServerName::try_from(domain.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let tls = connector.connect(name, tcp).await?;
        self.stream = Some(ClientStream::Tls(Box::new(tls)));
        self.buffer.clear();
        Ok(())
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// An initial client stream header for `to`.
pub fn stream_header(to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' to='{}' version='1.0'>",
        to
    )
}

/// True when `xml` carries `name` = `value` with either quote style.
pub fn has_attr(xml: &str, name: &str, value: &str) -> bool {
    xml.contains(&format!("{}='{}'", name, value)) || xml.contains(&format!("{}=\"{}\"", name, value))
}

/// Base64 of `\0user\0password`.
pub fn encode_sasl_plain(user: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", user, password))
}

//! TLS material for STARTTLS on every stream type.
//!
//! Each virtual host with a certificate gets two acceptors: one for client
//! streams and one for peer servers, which additionally requests (but does
//! not require) a client certificate for SASL EXTERNAL. Outbound peer
//! streams present the local host's certificate and verify the remote one
//! against the configured trust directory.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::XmppError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Acceptors of one virtual host.
#[derive(Clone)]
struct HostTls {
    clients: TlsAcceptor,
    peers: TlsAcceptor,
    connector: TlsConnector,
}

/// Per-host TLS configuration.
#[derive(Clone)]
pub struct TlsContext {
    hosts: HashMap<String, HostTls>,
    roots: Arc<RootCertStore>,
    verify_peers: bool,
    anonymous: TlsConnector,
}

impl TlsContext {
    /// A context without certificates. STARTTLS fails on every host.
    pub fn empty(verify_peers: bool) -> Result<Self, XmppError> {
        Self::with_roots(RootCertStore::empty(), verify_peers)
    }

    fn with_roots(roots: RootCertStore, verify_peers: bool) -> Result<Self, XmppError> {
        let roots = Arc::new(roots);
        let anonymous = TlsConnector::from(Arc::new(
            client_builder(&roots, verify_peers)?.with_no_client_auth(),
        ));
        Ok(Self {
            hosts: HashMap::new(),
            roots,
            verify_peers,
            anonymous,
        })
    }

    /// Load trust roots and every host certificate named in `config`.
    pub fn load(config: &Config) -> Result<Self, XmppError> {
        let mut roots = RootCertStore::empty();
        if let Some(dir) = &config.tls.trust_dir {
            load_trust_dir(dir, &mut roots)?;
        }
        let mut tls = Self::with_roots(roots, config.tls.verify_peers)?;

        for domain in config.hosts.keys() {
            let Some((cert, key)) = config.tls_files(domain) else {
                warn!(domain = %domain, "No certificate configured, STARTTLS unavailable");
                continue;
            };
            let chain = load_certs(cert)?;
            let key = load_key(key)?;
            tls.add_host(domain, chain, key)?;
            info!(domain = %domain, "Loaded TLS certificate");
        }
        Ok(tls)
    }

    /// Install the certificate of a served domain.
    pub fn add_host(
        &mut self,
        domain: &str,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<(), XmppError> {
        let clients = server_builder()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key.clone_key())?;

        let peers = server_builder()?
            .with_client_cert_verifier(self.client_verifier()?)
            .with_single_cert(chain.clone(), key.clone_key())?;

        let connector = client_builder(&self.roots, self.verify_peers)?
            .with_client_auth_cert(chain, key)?;

        self.hosts.insert(
            domain.to_string(),
            HostTls {
                clients: TlsAcceptor::from(Arc::new(clients)),
                peers: TlsAcceptor::from(Arc::new(peers)),
                connector: TlsConnector::from(Arc::new(connector)),
            },
        );
        Ok(())
    }

    fn client_verifier(&self) -> Result<Arc<dyn ClientCertVerifier>, XmppError> {
        if !self.verify_peers {
            return Ok(Arc::new(AcceptAnyCertificate(provider())));
        }
        if self.roots.is_empty() {
            // nothing to verify against; peers cannot use EXTERNAL
            return Ok(WebPkiClientVerifier::no_client_auth());
        }
        WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), provider())
            .allow_unauthenticated()
            .build()
            .map_err(|e| XmppError::config(format!("Client verifier: {}", e)))
    }

    /// True when STARTTLS can be offered for `domain`.
    pub fn has_certificate(&self, domain: &str) -> bool {
        self.hosts.contains_key(domain)
    }

    /// Acceptor for client streams to `domain`.
    pub fn client_acceptor(&self, domain: &str) -> Option<TlsAcceptor> {
        self.hosts.get(domain).map(|h| h.clients.clone())
    }

    /// Acceptor for peer server streams to `domain`.
    pub fn peer_acceptor(&self, domain: &str) -> Option<TlsAcceptor> {
        self.hosts.get(domain).map(|h| h.peers.clone())
    }

    /// Connector presenting the certificate of `local_domain`, if it has one.
    pub fn connector(&self, local_domain: &str) -> TlsConnector {
        self.hosts
            .get(local_domain)
            .map(|h| h.connector.clone())
            .unwrap_or_else(|| self.anonymous.clone())
    }
}

fn server_builder() -> Result<rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>, XmppError> {
    Ok(ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?)
}

fn client_builder(
    roots: &Arc<RootCertStore>,
    verify: bool,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>, XmppError> {
    let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    if verify {
        Ok(builder.with_root_certificates(Arc::clone(roots)))
    } else {
        Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider()))))
    }
}

/// Read a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, XmppError> {
    let file = File::open(path)
        .map_err(|e| XmppError::config(format!("Failed to open cert file {}: {}", path.display(), e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config(format!("No certificate found in {}", path.display())));
    }
    Ok(certs)
}

/// Read the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, XmppError> {
    let file = File::open(path)
        .map_err(|e| XmppError::config(format!("Failed to open key file {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| XmppError::config(format!("Failed to read key {}: {}", path.display(), e)))?
        .ok_or_else(|| XmppError::config(format!("No private key found in {}", path.display())))
}

fn load_trust_dir(dir: &Path, roots: &mut RootCertStore) -> Result<(), XmppError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| XmppError::config(format!("Trust directory {}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !matches!(path.extension().and_then(|e| e.to_str()), Some("crt" | "pem")) {
            continue;
        }
        for cert in load_certs(&path)? {
            if let Err(e) = roots.add(cert) {
                warn!(path = %path.display(), error = %e, "Skipping unusable trust root");
            }
        }
    }
    debug!(dir = %dir.display(), roots = roots.len(), "Loaded peer trust roots");
    Ok(())
}

/// True when the DER certificate is valid for `domain`.
pub fn certificate_matches(der: &[u8], domain: &str) -> bool {
    let der = CertificateDer::from(der);
    let Ok(cert) = webpki::EndEntityCert::try_from(&der) else {
        return false;
    };
    let Ok(name) = ServerName::try_from(domain.to_string()) else {
        return false;
    };
    cert.verify_is_valid_for_subject_name(&name).is_ok()
}

/// Skips chain validation while still checking handshake signatures. Only
/// installed with `verify_peers = false`.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for AcceptAnyCertificate {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

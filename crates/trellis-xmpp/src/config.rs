//! Server configuration.
//!
//! Loaded from a TOML file. Example:
//!
//! ```toml
//! [storage]
//! provider = "memory"
//!
//! [hosts."example.com"]
//! cert = "certs/example.com.crt"
//! key = "certs/example.com.key"
//!
//! [hosts."example.org"]
//! storage = { provider = "local", dir = "data/example.org" }
//!
//! [listeners.c2s]
//! port = 5222
//! max_resources_per_account = 5
//!
//! [listeners.s2s]
//! hosts = ["remote.net"]
//!
//! [listeners.component.components]
//! "pubsub.example.com" = "secret"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::rate_limit::TokenBucket;
use crate::session::Role;
use crate::XmppError;

/// Smallest stanza ceiling a listener may use (RFC 6120 Section 13.12).
pub const MIN_STANZA_SIZE: usize = 10_000;

/// Full server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Storage used by hosts without their own.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// Locally served virtual hosts.
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub bosh: BoshConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

/// One virtual host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// PEM certificate chain offered on STARTTLS.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Memory,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Directory for the `local` provider.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Listeners {
    pub c2s: Option<ClientListener>,
    pub s2s: Option<ServerListener>,
    pub http: Option<HttpListener>,
    pub component: Option<ComponentListener>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_large_stanza() -> usize {
    128 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientListener {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "ClientListener::default_port")]
    pub port: u16,
    #[serde(default = "ClientListener::default_max_stanza_size")]
    pub max_stanza_size: usize,
    #[serde(default = "ClientListener::default_max_resources")]
    pub max_resources_per_account: usize,
}

impl ClientListener {
    fn default_port() -> u16 {
        5222
    }
    fn default_max_stanza_size() -> usize {
        64 * 1024
    }
    fn default_max_resources() -> usize {
        5
    }
}

impl Default for ClientListener {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: Self::default_port(),
            max_stanza_size: Self::default_max_stanza_size(),
            max_resources_per_account: Self::default_max_resources(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerListener {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "ServerListener::default_port")]
    pub port: u16,
    #[serde(default = "default_large_stanza")]
    pub max_stanza_size: usize,
    /// Remote domains allowed to federate with us.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl ServerListener {
    fn default_port() -> u16 {
        5269
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpListener {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "HttpListener::default_port")]
    pub port: u16,
    #[serde(default = "default_large_stanza")]
    pub max_stanza_size: usize,
    #[serde(default = "HttpListener::default_bind_path")]
    pub bind_path: String,
}

impl HttpListener {
    fn default_port() -> u16 {
        5280
    }
    fn default_bind_path() -> String {
        "/http-bind".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentListener {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "ComponentListener::default_port")]
    pub port: u16,
    #[serde(default = "default_large_stanza")]
    pub max_stanza_size: usize,
    /// Component domain to shared secret.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}

impl ComponentListener {
    fn default_port() -> u16 {
        5347
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Directory of PEM certificates trusted for peer servers.
    #[serde(default)]
    pub trust_dir: Option<PathBuf>,
    #[serde(default = "TlsConfig::default_verify_peers")]
    pub verify_peers: bool,
}

impl TlsConfig {
    fn default_verify_peers() -> bool {
        true
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust_dir: None,
            verify_peers: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill: u32,
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: crate::rate_limit::DEFAULT_CAPACITY,
            refill: crate::rate_limit::DEFAULT_REFILL,
            interval_ms: crate::rate_limit::DEFAULT_INTERVAL.as_millis() as u64,
        }
    }
}

impl RateLimitConfig {
    /// A fresh full bucket with these settings.
    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(
            self.capacity,
            self.refill,
            Duration::from_millis(self.interval_ms),
        )
    }
}

/// Long-poll session parameters, announced to clients on session creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoshConfig {
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub wait_secs: u64,
    pub inactivity_secs: u64,
    pub polling_secs: u64,
    pub requests: u32,
    pub hold: u32,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            idle_timeout_secs: 25,
            wait_secs: 60,
            inactivity_secs: 30,
            polling_secs: 5,
            requests: 2,
            hold: 1,
        }
    }
}

impl BoshConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

/// When to probe remote contacts after a user's broadcast presence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteProbes {
    /// Probe on the initial presence of every session.
    #[default]
    EverySession,
    /// Probe only the first time an account broadcasts after server start.
    FirstBroadcast,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub remote_probes: RemoteProbes,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, XmppError> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| XmppError::config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, XmppError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| XmppError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&mut self) -> Result<(), XmppError> {
        if self.hosts.is_empty() {
            return Err(XmppError::config("must define at least one virtual host"));
        }
        for name in self.hosts.keys() {
            self.storage_for(name)?;
        }
        for storage in self
            .hosts
            .values()
            .filter_map(|h| h.storage.as_ref())
            .chain(self.storage.as_ref())
        {
            if storage.provider == StorageProvider::Local && storage.dir.is_none() {
                return Err(XmppError::config("local storage requires a dir"));
            }
        }

        let l = &mut self.listeners;
        for size in [
            l.c2s.as_mut().map(|c| &mut c.max_stanza_size),
            l.s2s.as_mut().map(|s| &mut s.max_stanza_size),
            l.http.as_mut().map(|h| &mut h.max_stanza_size),
            l.component.as_mut().map(|c| &mut c.max_stanza_size),
        ]
        .into_iter()
        .flatten()
        {
            *size = (*size).max(MIN_STANZA_SIZE);
        }
        Ok(())
    }

    /// Storage settings for a virtual host, falling back to the top level.
    pub fn storage_for(&self, domain: &str) -> Result<&StorageConfig, XmppError> {
        let host = self
            .hosts
            .get(domain)
            .ok_or_else(|| XmppError::config(format!("unknown virtual host {}", domain)))?;
        host.storage
            .as_ref()
            .or(self.storage.as_ref())
            .ok_or_else(|| XmppError::config(format!("storage required for {}", domain)))
    }

    /// True when `domain` is served locally.
    pub fn is_vhost(&self, domain: &str) -> bool {
        self.hosts.contains_key(domain)
    }

    /// True when `domain` is an authorized federation peer.
    pub fn is_peer(&self, domain: &str) -> bool {
        self.listeners
            .s2s
            .as_ref()
            .is_some_and(|s2s| s2s.hosts.iter().any(|h| h == domain))
    }

    /// Shared secret for an external component domain.
    pub fn component_secret(&self, domain: &str) -> Option<&str> {
        self.listeners
            .component
            .as_ref()
            .and_then(|c| c.components.get(domain))
            .map(String::as_str)
    }

    /// Stanza ceiling for streams of the given role.
    pub fn max_stanza_size(&self, role: Role) -> usize {
        let l = &self.listeners;
        let configured = match role {
            Role::Client => l.c2s.as_ref().map(|c| c.max_stanza_size),
            Role::PeerInbound | Role::PeerOutbound => l.s2s.as_ref().map(|s| s.max_stanza_size),
            Role::Component => l.component.as_ref().map(|c| c.max_stanza_size),
            Role::Bosh => l.http.as_ref().map(|h| h.max_stanza_size),
        };
        configured.unwrap_or_else(|| match role {
            Role::Client => ClientListener::default_max_stanza_size(),
            _ => default_large_stanza(),
        })
    }

    pub fn max_resources_per_account(&self) -> usize {
        self.listeners
            .c2s
            .as_ref()
            .map(|c| c.max_resources_per_account)
            .unwrap_or_else(ClientListener::default_max_resources)
    }

    /// Certificate and key paths for a host, when both are configured.
    pub fn tls_files(&self, domain: &str) -> Option<(&Path, &Path)> {
        let host = self.hosts.get(domain)?;
        Some((host.cert.as_deref()?, host.key.as_deref()?))
    }
}

//! Process-wide server state and listeners.
//!
//! One [`ServerContext`] is built at startup and shared by every session.
//! It owns the configuration, the routing table, the storage backend of each
//! virtual host and the TLS material.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use jid::BareJid;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, RemoteProbes, StorageProvider};
use crate::router::{PeerConnector, Router};
use crate::session::Role;
use crate::storage::{LocalStorage, MemoryStorage, Storage};
use crate::stream::{self, Dialer};
use crate::tls::TlsContext;
use crate::XmppError;

/// Shared state handed to every session.
pub struct ServerContext {
    config: Arc<Config>,
    router: Arc<Router>,
    vhosts: HashMap<String, Arc<dyn Storage>>,
    tls: TlsContext,
    probed: Mutex<HashSet<BareJid>>,
}

impl ServerContext {
    /// Build the context with the DNS-backed outbound dialer.
    pub fn new(
        config: Arc<Config>,
        vhosts: HashMap<String, Arc<dyn Storage>>,
        tls: TlsContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let dialer: Arc<dyn PeerConnector> = Arc::new(Dialer::new(weak.clone()));
            Self::assemble(config, vhosts, tls, dialer)
        })
    }

    /// Build the context with a custom outbound connector.
    pub fn with_connector(
        config: Arc<Config>,
        vhosts: HashMap<String, Arc<dyn Storage>>,
        tls: TlsContext,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        Arc::new(Self::assemble(config, vhosts, tls, connector))
    }

    fn assemble(
        config: Arc<Config>,
        vhosts: HashMap<String, Arc<dyn Storage>>,
        tls: TlsContext,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let router = Arc::new(Router::new(Arc::clone(&config), connector));
        Self {
            config,
            router,
            vhosts,
            tls,
            probed: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    /// Storage of a served domain.
    pub fn storage(&self, domain: &str) -> Option<Arc<dyn Storage>> {
        self.vhosts.get(domain).cloned()
    }

    /// Whether an initial presence of `jid` should probe remote contacts.
    pub fn should_probe(&self, jid: &BareJid) -> bool {
        match self.config.presence.remote_probes {
            RemoteProbes::EverySession => true,
            RemoteProbes::FirstBroadcast => self
                .probed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(jid.clone()),
        }
    }
}

/// Open the storage backend of every virtual host.
pub fn open_storage(config: &Config) -> Result<HashMap<String, Arc<dyn Storage>>, XmppError> {
    let mut vhosts: HashMap<String, Arc<dyn Storage>> = HashMap::new();
    for domain in config.hosts.keys() {
        let settings = config.storage_for(domain)?;
        let storage: Arc<dyn Storage> = match settings.provider {
            StorageProvider::Memory => Arc::new(MemoryStorage::new()),
            StorageProvider::Local => {
                let dir = settings
                    .dir
                    .as_ref()
                    .ok_or_else(|| XmppError::config("local storage requires a dir"))?;
                Arc::new(LocalStorage::new(dir)?)
            }
        };
        info!(domain = %domain, provider = ?settings.provider, "Opened virtual host storage");
        vhosts.insert(domain.clone(), storage);
    }
    Ok(vhosts)
}

/// Accept connections of one stream type until the listener fails.
pub async fn serve(
    server: Arc<ServerContext>,
    listener: TcpListener,
    role: Role,
) -> Result<(), XmppError> {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, role = %role, "Failed to accept connection");
                continue;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(
            async move {
                stream::accept(server, socket, peer_addr, role).await;
            }
            .instrument(info_span!(
                "xmpp.connection.lifecycle",
                client_ip = %peer_addr,
                role = %role,
                jid = tracing::field::Empty,
            )),
        );
    }
}

/// The running server.
pub struct XmppServer {
    server: Arc<ServerContext>,
}

impl XmppServer {
    /// Open storage and load certificates for `config`.
    pub fn new(config: Config) -> Result<Self, XmppError> {
        let vhosts = open_storage(&config)?;
        let tls = TlsContext::load(&config)?;
        Ok(Self {
            server: ServerContext::new(Arc::new(config), vhosts, tls),
        })
    }

    pub fn from_context(server: Arc<ServerContext>) -> Self {
        Self { server }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Run every configured listener. Returns when any of them fails.
    pub async fn run(self) -> Result<(), XmppError> {
        let listeners = &self.server.config().listeners;
        let mut tasks = JoinSet::new();

        let tcp = [
            listeners.c2s.as_ref().map(|l| (l.host.as_str(), l.port, Role::Client)),
            listeners.s2s.as_ref().map(|l| (l.host.as_str(), l.port, Role::PeerInbound)),
            listeners.component.as_ref().map(|l| (l.host.as_str(), l.port, Role::Component)),
        ];
        for (host, port, role) in tcp.into_iter().flatten() {
            let addr = socket_addr(host, port)?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, role = %role, "XMPP listener started");
            let server = Arc::clone(&self.server);
            tasks.spawn(serve(server, listener, role));
        }

        if let Some(http) = &listeners.http {
            let addr = socket_addr(&http.host, http.port)?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, path = %http.bind_path, "BOSH listener started");
            let server = Arc::clone(&self.server);
            tasks.spawn(stream::bosh::serve(server, listener));
        }

        if tasks.is_empty() {
            return Err(XmppError::config("no listeners configured"));
        }

        match tasks.join_next().await {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(e))) => {
                error!(error = %e, "Listener failed");
                Err(e)
            }
            Some(Err(e)) => Err(XmppError::internal(format!("Listener task failed: {}", e))),
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, XmppError> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| XmppError::config(format!("Invalid listener address {}:{}: {}", host, port, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(probes: &str) -> Arc<Config> {
        Arc::new(
            Config::from_toml_str(&format!(
                "[storage]\nprovider = \"memory\"\n\n[hosts.\"example.com\"]\n\n[presence]\nremote_probes = \"{}\"\n",
                probes
            ))
            .unwrap(),
        )
    }

    fn context(probes: &str) -> Arc<ServerContext> {
        let config = config(probes);
        let vhosts = open_storage(&config).unwrap();
        ServerContext::new(config, vhosts, TlsContext::empty(true).unwrap())
    }

    #[tokio::test]
    async fn test_storage_per_vhost() {
        let server = context("every-session");
        assert!(server.storage("example.com").is_some());
        assert!(server.storage("example.org").is_none());
    }

    #[tokio::test]
    async fn test_probe_policy() {
        let alice = BareJid::new("alice@example.com").unwrap();

        let every = context("every-session");
        assert!(every.should_probe(&alice));
        assert!(every.should_probe(&alice));

        let first = context("first-broadcast");
        assert!(first.should_probe(&alice));
        assert!(!first.should_probe(&alice));
        assert!(first.should_probe(&BareJid::new("bob@example.com").unwrap()));
    }

    #[test]
    fn test_socket_addr() {
        assert!(socket_addr("0.0.0.0", 5222).is_ok());
        assert!(socket_addr("not an address", 5222).is_err());
    }
}

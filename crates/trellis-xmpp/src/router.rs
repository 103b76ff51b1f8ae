//! Process-wide directory of live sessions and stanza routing.
//!
//! The router answers three kinds of question:
//!
//! - which local resources of a user are connected, available or interested
//! - whether a stanza is for a locally served domain
//! - where a remote stanza goes: a connected component, an established
//!   outbound peer stream, or the queue of a peer connection in progress
//!
//! Stanzas for a domain being connected are queued and leave in arrival
//! order: flushed to the new stream, or bounced as `remote-server-not-found`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ErrorType, StanzaCondition, StanzaError};
use crate::session::{Role, SendResult, SessionHandle};
use crate::XmppError;

/// Stanza kinds the router will forward.
const ROUTABLE_STANZAS: [&str; 3] = ["message", "iq", "presence"];

/// Opens outbound server-to-server streams.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Establish a stream to `to`, announcing ourselves as `from`.
    ///
    /// Resolves once the stream is ready for stanzas, or with `None` after
    /// every candidate failed.
    async fn connect(&self, to: &str, from: &str) -> Option<Arc<SessionHandle>>;
}

/// The routing table.
pub struct Router {
    config: Arc<Config>,
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    pending: Mutex<HashMap<String, Vec<Element>>>,
    connector: Arc<dyn PeerConnector>,
}

impl Router {
    pub fn new(config: Arc<Config>, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            connector,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Add a session to the directory.
    pub fn register(&self, session: Arc<SessionHandle>) {
        debug!(session = %session.id(), role = %session.role(), "Registering session");
        self.sessions.insert(session.id(), session);
    }

    /// Remove a session from the directory.
    pub fn deregister(&self, session: &SessionHandle) {
        if self.sessions.remove(&session.id()).is_some() {
            debug!(session = %session.id(), role = %session.role(), "Deregistered session");
        }
    }

    /// Number of live sessions of every role.
    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    fn clients(&self) -> impl Iterator<Item = Arc<SessionHandle>> + '_ {
        self.sessions
            .iter()
            .filter(|entry| entry.value().role().is_client())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Authenticated, resource-bound sessions for `jid`. A full JID matches
    /// one resource; a bare JID matches all of them.
    pub fn connected_resources(&self, jid: &Jid) -> Vec<Arc<SessionHandle>> {
        let bare = jid.to_bare();
        self.clients()
            .filter(|s| s.is_connected())
            .filter(|s| match jid.resource() {
                Some(_) => s.jid().as_ref() == Some(jid),
                None => s.bare_jid().as_ref() == Some(&bare),
            })
            .collect()
    }

    /// Connected sessions of any of `jids` that have sent initial presence.
    pub fn available_resources(&self, jids: &[BareJid]) -> Vec<Arc<SessionHandle>> {
        self.clients()
            .filter(|s| s.is_available())
            .filter(|s| s.bare_jid().is_some_and(|b| jids.contains(&b)))
            .collect()
    }

    /// Connected sessions of any of `jids` that have requested the roster.
    pub fn interested_resources(&self, jids: &[BareJid]) -> Vec<Arc<SessionHandle>> {
        self.clients()
            .filter(|s| s.is_interested())
            .filter(|s| s.bare_jid().is_some_and(|b| jids.contains(&b)))
            .collect()
    }

    /// True for a routable stanza whose `to` is absent or a local domain.
    pub fn is_local(&self, stanza: &Element) -> bool {
        if !ROUTABLE_STANZAS.contains(&stanza.name()) {
            return false;
        }
        match stanza.attr("to").map(str::trim) {
            None | Some("") => true,
            Some(to) => self.is_local_jid(to),
        }
    }

    /// True when the domain of `jid` is served here.
    pub fn is_local_jid(&self, jid: &str) -> bool {
        Jid::new(jid).is_ok_and(|j| self.config.is_vhost(j.domain().as_str()))
    }

    /// A component or established outbound peer stream for `domain`.
    pub fn connection_to(&self, domain: &str) -> Option<Arc<SessionHandle>> {
        let find = |role: Role| {
            self.sessions
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .find(|s| {
                    s.role() == role
                        && s.is_alive()
                        && s.is_routable()
                        && s.remote_domain().as_deref() == Some(domain)
                })
        };
        find(Role::Component).or_else(|| find(Role::PeerOutbound))
    }

    /// Domains with a connection attempt in flight.
    pub fn pending_domains(&self) -> Vec<String> {
        self.lock_pending().keys().cloned().collect()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, Vec<Element>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a stanza toward a remote domain or component.
    ///
    /// Fails with `remote-server-not-found` when nothing is connected and the
    /// domain is not an authorized peer.
    #[instrument(skip(self, stanza), name = "xmpp.router.route", fields(to = stanza.attr("to")))]
    pub fn route(self: &Arc<Self>, stanza: Element) -> Result<(), XmppError> {
        let Some(to) = stanza.attr("to").and_then(|t| Jid::new(t.trim()).ok()) else {
            return Err(remote_server_not_found(&stanza));
        };
        let domain = to.domain().as_str().to_string();

        // Held across the whole decision so a connecting domain cannot be
        // flushed between the lookup and the enqueue.
        let mut pending = self.lock_pending();

        if let Some(stream) = self.connection_to(&domain) {
            if stream.send_element(&stanza) == SendResult::Sent {
                return Ok(());
            }
            return Err(remote_server_not_found(&stanza));
        }

        if let Some(queue) = pending.get_mut(&domain) {
            debug!(domain = %domain, queued = queue.len() + 1, "Queueing stanza for pending domain");
            queue.push(stanza);
            return Ok(());
        }

        if !self.config.is_peer(&domain) {
            return Err(remote_server_not_found(&stanza));
        }

        let Some(from_domain) = stanza
            .attr("from")
            .and_then(|f| Jid::new(f.trim()).ok())
            .map(|f| f.domain().as_str().to_string())
        else {
            return Err(remote_server_not_found(&stanza));
        };

        info!(domain = %domain, from = %from_domain, "Starting outbound peer connection");
        pending.insert(domain.clone(), vec![stanza]);
        drop(pending);

        let router = Arc::clone(self);
        let connector = Arc::clone(&self.connector);
        tokio::spawn(async move {
            let stream = connector.connect(&domain, &from_domain).await;
            router.complete(&domain, stream);
        });
        Ok(())
    }

    /// Resolve the queue of a domain whose connection attempt finished.
    fn complete(&self, domain: &str, stream: Option<Arc<SessionHandle>>) {
        let mut pending = self.lock_pending();
        let queue = pending.remove(domain).unwrap_or_default();

        match stream {
            Some(stream) => {
                info!(domain = %domain, flushed = queue.len(), "Peer connected, flushing queue");
                stream.mark_routable();
                for stanza in queue {
                    if stream.send_element(&stanza) != SendResult::Sent {
                        self.bounce(&stanza);
                    }
                }
            }
            None => {
                warn!(domain = %domain, bounced = queue.len(), "Peer connection failed");
                for stanza in queue {
                    self.bounce(&stanza);
                }
            }
        }
    }

    /// Return `remote-server-not-found` to the local senders of `stanza`.
    fn bounce(&self, stanza: &Element) {
        let Ok(error) = StanzaError::new(
            stanza,
            StanzaCondition::RemoteServerNotFound,
            ErrorType::Cancel,
        ) else {
            return;
        };
        let Some(from) = stanza.attr("from").and_then(|f| Jid::new(f).ok()) else {
            return;
        };
        let xml = error.to_xml();
        for sender in self.connected_resources(&from) {
            sender.send(xml.clone());
        }
    }
}

fn remote_server_not_found(stanza: &Element) -> XmppError {
    XmppError::stanza(stanza, StanzaCondition::RemoteServerNotFound, ErrorType::Cancel)
}

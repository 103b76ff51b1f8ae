//! Stream session state.
//!
//! A session is split in two:
//!
//! - [`SessionHandle`] is shared through the [`Router`](crate::router::Router).
//!   Other sessions read its readiness flags and push outbound data into its
//!   channel.
//! - [`SessionState`] is private to the task driving the session and holds
//!   the negotiation state machine. Only that task touches it, so every
//!   stanza of a session is processed strictly in order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::parser::{element_to_string, ns, restamp_namespace, Version};
use crate::rate_limit::TokenBucket;
use crate::storage::Storage;
use crate::user::User;

/// Capacity of every session's outbound channel.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Kind of stream a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client-to-server over TCP.
    Client,
    /// Server-to-server, accepted by us.
    PeerInbound,
    /// Server-to-server, initiated by us.
    PeerOutbound,
    /// XEP-0114 external component.
    Component,
    /// Client-to-server over the HTTP long-poll bridge.
    Bosh,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::PeerInbound => "peer-inbound",
            Role::PeerOutbound => "peer-outbound",
            Role::Component => "component",
            Role::Bosh => "bosh",
        }
    }

    /// Stanza content namespace of this stream type.
    pub fn content_ns(&self) -> &'static str {
        match self {
            Role::Client | Role::Bosh => ns::CLIENT,
            Role::PeerInbound | Role::PeerOutbound => ns::SERVER,
            Role::Component => ns::COMPONENT,
        }
    }

    /// Client sessions hold local users.
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client | Role::Bosh)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    StartedTls,
    Authenticated,
    NegotiationComplete,
    /// Component stream opened, waiting for `<handshake/>`.
    WaitingHandshake,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Initial => "initial",
            StreamState::StartedTls => "started_tls",
            StreamState::Authenticated => "authenticated",
            StreamState::NegotiationComplete => "negotiation_complete",
            StreamState::WaitingHandshake => "waiting_handshake",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of pushing data to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// The session is gone
    NotConnected,
    /// The channel is full (backpressure); the data was dropped
    ChannelFull,
}

/// State other sessions may read.
#[derive(Debug, Default)]
pub struct Shared {
    /// Authenticated account, or the remote sender for peer streams.
    pub user: Option<User>,
    /// Bare after authentication, full after resource binding.
    pub jid: Option<Jid>,
    /// Sent initial presence.
    pub available: bool,
    /// Requested the roster.
    pub interested: bool,
    /// Last presence broadcast without a `to`.
    pub last_presence: Option<Element>,
    /// Remote domain of peer and component streams.
    pub remote_domain: Option<String>,
}

/// The routable face of a session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    role: Role,
    sender: mpsc::Sender<String>,
    alive: AtomicBool,
    routable: AtomicBool,
    shared: RwLock<Shared>,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound channel.
    pub fn new(role: Role) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            sender,
            alive: AtomicBool::new(true),
            routable: AtomicBool::new(false),
            shared: RwLock::new(Shared::default()),
        });
        (handle, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// False once the session has been torn down. Deferred work that finds
    /// its session dead does nothing.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Peer and component streams only receive routed traffic once marked.
    pub fn is_routable(&self) -> bool {
        self.routable.load(Ordering::Acquire)
    }

    pub fn mark_routable(&self) {
        self.routable.store(true, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Authenticated and resource-bound.
    pub fn is_connected(&self) -> bool {
        if !self.is_alive() || !self.role.is_client() {
            return false;
        }
        let shared = self.read();
        shared.user.is_some() && shared.jid.as_ref().is_some_and(|j| j.resource().is_some())
    }

    /// Connected and sent initial presence.
    pub fn is_available(&self) -> bool {
        self.is_connected() && self.read().available
    }

    /// Connected and requested the roster.
    pub fn is_interested(&self) -> bool {
        self.is_connected() && self.read().interested
    }

    /// The session's address: full when bound, bare when only authenticated.
    pub fn jid(&self) -> Option<Jid> {
        self.read().jid.clone()
    }

    pub fn full_jid(&self) -> Option<FullJid> {
        self.read().jid.clone().and_then(|j| j.try_into_full().ok())
    }

    pub fn bare_jid(&self) -> Option<BareJid> {
        self.read().jid.as_ref().map(Jid::to_bare)
    }

    /// A copy of the session's user.
    pub fn user(&self) -> Option<User> {
        self.read().user.clone()
    }

    pub fn remote_domain(&self) -> Option<String> {
        self.read().remote_domain.clone()
    }

    pub fn last_presence(&self) -> Option<Element> {
        self.read().last_presence.clone()
    }

    /// Replace everything but the address of the session's user.
    pub fn update_user(&self, stored: &User) {
        if let Some(user) = self.write().user.as_mut() {
            user.update_from(stored);
        }
    }

    /// Queue raw XML for this session.
    pub fn send(&self, data: impl Into<String>) -> SendResult {
        if !self.is_alive() {
            return SendResult::NotConnected;
        }
        match self.sender.try_send(data.into()) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, role = %self.role, "Outbound channel full, dropping data");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %self.id, "Outbound channel closed");
                SendResult::NotConnected
            }
        }
    }

    /// Serialize a stanza in this stream's content namespace and queue it.
    pub fn send_element(&self, element: &Element) -> SendResult {
        let element = restamp_namespace(element, self.role.content_ns());
        match element_to_string(&element) {
            Ok(xml) => self.send(xml),
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound stanza");
                SendResult::NotConnected
            }
        }
    }
}

/// Work the driving task must do after a handler returns.
#[derive(Debug)]
pub enum Action {
    /// Upgrade an inbound transport to TLS with the certificate of `domain`.
    AcceptTls { domain: String },
    /// Upgrade an outbound transport to TLS, verifying `domain`.
    ConnectTls { domain: String },
    /// Flush and close the transport.
    Close,
}

/// Extra state of a stream we initiated.
#[derive(Debug)]
pub struct Outbound {
    /// Our served domain, sent as `from`.
    pub local_domain: String,
    pub remote_domain: String,
    /// Fired once negotiation completes.
    pub ready: Option<oneshot::Sender<Arc<SessionHandle>>>,
}

/// Negotiation state private to the session's task.
pub struct SessionState {
    pub role: Role,
    pub state: StreamState,
    /// The local domain this stream is served as.
    pub domain: Option<String>,
    /// Storage of `domain`.
    pub storage: Option<Arc<dyn Storage>>,
    /// Version offered by the peer.
    pub version: Option<Version>,
    /// Stream id we sent in the last header.
    pub stream_id: Option<String>,
    pub auth_attempts: u32,
    pub bucket: TokenBucket,
    pub flooded: bool,
    /// Transport is encrypted or otherwise trusted (long-poll behind HTTPS).
    pub secure: bool,
    /// DER end-entity certificate presented by the peer, if any.
    pub peer_certificate: Option<Vec<u8>>,
    pub outbound: Option<Outbound>,
    pub action: Option<Action>,
}

impl SessionState {
    pub fn new(role: Role, bucket: TokenBucket) -> Self {
        Self {
            role,
            state: StreamState::Initial,
            domain: None,
            storage: None,
            version: None,
            stream_id: None,
            auth_attempts: 0,
            bucket,
            flooded: false,
            secure: false,
            peer_certificate: None,
            outbound: None,
            action: None,
        }
    }

    /// Long-poll sessions are exempt from rate limiting.
    pub fn rate_limited(&self) -> bool {
        self.role != Role::Bosh
    }

    /// Consume one token, marking the session flooded when none is left.
    ///
    /// Returns false when the stanza must be dropped.
    pub fn admit(&mut self) -> bool {
        if !self.rate_limited() {
            return true;
        }
        if self.flooded {
            return false;
        }
        if !self.bucket.take(1) {
            self.flooded = true;
            return false;
        }
        true
    }

    pub fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            debug!(role = %self.role, from = %self.state, to = %state, "Stream state transition");
            self.state = state;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == StreamState::NegotiationComplete
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("domain", &self.domain)
            .field("auth_attempts", &self.auth_attempts)
            .field("flooded", &self.flooded)
            .finish_non_exhaustive()
    }
}

//! Stanza handlers shared by every stream type.
//!
//! Each handler takes a [`Context`] bundling the server, the routable handle
//! of the session and its private negotiation state. Stream types compose
//! the handlers they support instead of inheriting them.

pub mod auth;
pub mod iq;
pub mod message;
pub mod presence;
pub mod starttls;

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::debug;

use crate::config::Config;
use crate::error::StreamCondition;
use crate::router::Router;
use crate::server::ServerContext;
use crate::session::{Role, SessionHandle, SessionState};
use crate::user::User;
use crate::XmppError;

/// Whether a stanza originates from the session's own user or arrives for
/// local users from elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Everything a handler may touch while processing one stanza.
pub struct Context<'a> {
    pub server: &'a Arc<ServerContext>,
    pub handle: &'a Arc<SessionHandle>,
    pub state: &'a mut SessionState,
}

impl<'a> Context<'a> {
    pub fn new(
        server: &'a Arc<ServerContext>,
        handle: &'a Arc<SessionHandle>,
        state: &'a mut SessionState,
    ) -> Self {
        Self {
            server,
            handle,
            state,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        self.server.router()
    }

    pub fn config(&self) -> &Config {
        self.server.config()
    }

    /// Client stanzas are outbound; stanzas from peers are inbound.
    pub fn direction(&self) -> Direction {
        if self.state.role.is_client() {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// Fail with `not-authorized` unless negotiation is complete.
    pub fn require_complete(&self) -> Result<(), XmppError> {
        if self.state.is_complete() {
            Ok(())
        } else {
            Err(XmppError::stream(StreamCondition::NotAuthorized))
        }
    }

    /// The acting user.
    pub fn user(&self) -> Result<User, XmppError> {
        self.handle
            .user()
            .ok_or_else(|| XmppError::stream(StreamCondition::NotAuthorized))
    }

    /// The acting user's address, full once bound.
    pub fn jid(&self) -> Result<Jid, XmppError> {
        self.handle
            .jid()
            .ok_or_else(|| XmppError::stream(StreamCondition::NotAuthorized))
    }

    pub fn bare_jid(&self) -> Result<BareJid, XmppError> {
        Ok(self.jid()?.to_bare())
    }

    /// The served domain of this stream.
    pub fn domain(&self) -> &str {
        self.state.domain.as_deref().unwrap_or_default()
    }

    /// Queue a stanza for this session's own peer.
    pub fn send(&self, element: &Element) {
        self.handle.send_element(element);
    }

    /// Answer the acting user. Peer streams are one-way, so answers to a
    /// remote sender leave through the router.
    pub fn reply(&self, element: &Element) {
        if self.state.role != Role::PeerInbound {
            self.send(element);
            return;
        }
        if let Err(e) = self.router().route(element.clone()) {
            debug!(error = %e, "Dropping reply to remote sender");
        }
    }

    /// Queue raw XML for this session's own peer.
    pub fn send_raw(&self, xml: impl Into<String>) {
        self.handle.send(xml);
    }

    /// Send `stanza` to each recipient, stamped from the acting user and to
    /// the recipient.
    pub fn broadcast(&self, stanza: &Element, recipients: &[Arc<SessionHandle>]) -> Result<(), XmppError> {
        let mut stanza = stanza.clone();
        stanza.set_attr("from", self.jid()?.to_string());
        for recipient in recipients {
            let Some(to) = recipient.jid() else { continue };
            stanza.set_attr("to", to.to_string());
            recipient.send_element(&stanza);
        }
        Ok(())
    }

    /// Load an account from the storage of its domain. Accounts of domains
    /// not served here do not exist.
    pub async fn find_user(&self, jid: &BareJid) -> Result<Option<User>, XmppError> {
        match self.server.storage(jid.domain().as_str()) {
            Some(storage) => storage.find_user_by_jid(jid).await,
            None => Ok(None),
        }
    }

    /// Persist an account to the storage of its domain.
    pub async fn save_user(&self, user: &User) -> Result<(), XmppError> {
        let storage = self
            .server
            .storage(user.jid.domain().as_str())
            .ok_or_else(|| XmppError::storage(format!("no storage for {}", user.jid)))?;
        storage.save_user(user).await
    }

    /// Reload `jid` from storage into every connected session of that
    /// account, including this one.
    pub async fn update_user_from_storage(&self, jid: &BareJid) -> Result<(), XmppError> {
        let Some(stored) = self.find_user(jid).await? else {
            return Ok(());
        };
        let mut sessions = self.router().connected_resources(&Jid::from(jid.clone()));
        if self.handle.bare_jid().as_ref() == Some(jid) && !sessions.iter().any(|s| Arc::ptr_eq(s, self.handle)) {
            sessions.push(Arc::clone(self.handle));
        }
        for session in sessions {
            session.update_user(&stored);
        }
        debug!(jid = %jid, "Reloaded user from storage");
        Ok(())
    }

    /// Save a modified copy of the acting user and reload it everywhere.
    pub async fn commit_user(&self, user: &User) -> Result<(), XmppError> {
        self.save_user(user).await?;
        self.update_user_from_storage(&user.jid).await
    }
}

/// A trimmed, non-empty attribute value.
pub fn attr<'e>(stanza: &'e Element, name: &str) -> Option<&'e str> {
    stanza.attr(name).map(str::trim).filter(|v| !v.is_empty())
}

/// Require a `to` address and rewrite it to its bare form.
pub fn stamp_to(stanza: &mut Element) -> Result<BareJid, XmppError> {
    let to = attr(stanza, "to")
        .and_then(|to| Jid::new(to).ok())
        .map(|to| to.to_bare())
        .ok_or_else(|| XmppError::bad_request(stanza))?;
    stanza.set_attr("to", to.to_string());
    Ok(to)
}

/// Parse an address attribute, if present and valid.
pub fn jid_attr(stanza: &Element, name: &str) -> Option<Jid> {
    attr(stanza, name).and_then(|v| Jid::new(v).ok())
}

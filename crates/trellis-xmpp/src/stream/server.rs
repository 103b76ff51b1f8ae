//! Server-to-server streams (RFC 6120) in both directions.
//!
//! Inbound streams negotiate STARTTLS and SASL EXTERNAL and then carry
//! stanzas for local users. Outbound streams are opened by the [`Dialer`]
//! when the router needs a remote domain; they only ever carry our traffic
//! out.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::{check_namespaces, features, header, mechanisms_feature, reply_header, starttls_feature, Connection};
use crate::dns::{ResolvedTarget, SrvResolver};
use crate::error::StreamCondition;
use crate::metrics;
use crate::parser::{ns, StreamHeader, Version};
use crate::router::PeerConnector;
use crate::server::ServerContext;
use crate::session::{Action, Outbound, SessionHandle, StreamState};
use crate::stanza::{auth, iq, jid_attr, message, presence, starttls, Context};
use crate::user::User;
use crate::XmppError;

/// Time allowed for TCP connect to one candidate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for one candidate to finish negotiation.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle an inbound peer stream open.
pub fn inbound_open(ctx: &mut Context<'_>, header: &StreamHeader) -> Result<(), XmppError> {
    reply_header(ctx, ns::SERVER, header);

    let to = header.to.as_deref().map(str::trim).unwrap_or_default().to_string();
    let from = header.from.as_deref().map(str::trim).unwrap_or_default().to_string();
    if to.is_empty() || from.is_empty() {
        return Err(XmppError::stream(StreamCondition::ImproperAddressing));
    }
    if !ctx.config().is_vhost(&to) {
        return Err(XmppError::stream(StreamCondition::HostUnknown));
    }
    if !ctx.config().is_peer(&from) {
        return Err(XmppError::stream(StreamCondition::NotAuthorized));
    }
    check_namespaces(header, ns::SERVER)?;
    if ctx.handle.remote_domain().is_some_and(|d| d != from) {
        return Err(XmppError::stream(StreamCondition::InvalidFrom));
    }

    debug!(to = %to, from = %from, state = %ctx.state.state, "Peer stream opened");
    ctx.state.domain = Some(to);
    ctx.handle.write().remote_domain = Some(from.clone());

    let offered = match ctx.state.state {
        StreamState::Initial if !ctx.state.secure => starttls_feature(),
        StreamState::Initial | StreamState::StartedTls => mechanisms_feature(&["EXTERNAL"]),
        _ => {
            ctx.state.set_state(StreamState::NegotiationComplete);
            info!(domain = %from, "Inbound peer stream established");
            String::new()
        }
    };
    ctx.send_raw(features(&offered));
    Ok(())
}

/// Dispatch one stanza on an inbound peer stream.
pub async fn inbound_stanza(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    match stanza.name() {
        "starttls" => starttls::handle(ctx, &stanza),
        "auth" => auth::handle(ctx, &stanza).await,
        "message" | "presence" | "iq" => {
            ctx.require_complete()?;
            adopt_sender(ctx, &stanza)?;
            match stanza.name() {
                "message" => message::handle(ctx, stanza).await,
                "presence" => presence::handle(ctx, stanza).await,
                _ => iq::handle(ctx, stanza).await,
            }
        }
        other => {
            debug!(name = %other, "Unsupported peer stanza");
            Err(XmppError::stream(StreamCondition::UnsupportedStanzaType))
        }
    }
}

/// Check the addressing of a peer stanza and make its sender the acting
/// user of the stream.
fn adopt_sender(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let (Some(to), Some(from)) = (jid_attr(stanza, "to"), jid_attr(stanza, "from")) else {
        return Err(XmppError::stream(StreamCondition::ImproperAddressing));
    };
    if ctx.handle.remote_domain().as_deref() != Some(from.domain().as_str()) {
        return Err(XmppError::stream(StreamCondition::InvalidFrom));
    }
    if !ctx.config().is_vhost(to.domain().as_str()) {
        return Err(XmppError::stream(StreamCondition::HostUnknown));
    }
    let mut shared = ctx.handle.write();
    shared.user = Some(User::new(from.to_bare()));
    shared.jid = Some(from);
    Ok(())
}

/// The header opening a stream toward `remote`.
pub fn outbound_header(local: &str, remote: &str) -> String {
    header(ns::SERVER, &Uuid::new_v4().to_string(), Some(local), Some(remote), Some(Version::SUPPORTED))
}

/// The remote side answered our stream open.
pub fn outbound_open(ctx: &mut Context<'_>, header: &StreamHeader) -> Result<(), XmppError> {
    check_namespaces(header, ns::SERVER)?;
    debug!(id = ?header.id, from = ?header.from, "Remote stream opened");
    ctx.state.stream_id = header.id.clone();
    ctx.state.version = Some(header.offered_version());
    Ok(())
}

/// Drive outbound negotiation: STARTTLS, then SASL EXTERNAL, then ready.
pub fn outbound_stanza(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    let remote = ctx.handle.remote_domain().unwrap_or_default();
    match (stanza.name(), stanza.ns().as_str()) {
        ("features", ns::STREAM) => outbound_features(ctx, &stanza, &remote),
        ("proceed", ns::TLS) => {
            ctx.state.set_state(StreamState::StartedTls);
            ctx.state.action = Some(Action::ConnectTls { domain: remote });
            Ok(())
        }
        ("success", ns::SASL) => {
            ctx.state.set_state(StreamState::Authenticated);
            let local = ctx.domain().to_string();
            ctx.send_raw(outbound_header(&local, &remote));
            Ok(())
        }
        ("failure", ns::SASL) | ("failure", ns::TLS) => {
            warn!(domain = %remote, "Remote refused negotiation");
            ctx.send_raw("</stream:stream>");
            ctx.state.action = Some(Action::Close);
            Ok(())
        }
        (name, _) => {
            debug!(name = %name, "Ignoring stanza on outbound peer stream");
            Ok(())
        }
    }
}

fn outbound_features(ctx: &mut Context<'_>, stanza: &Element, remote: &str) -> Result<(), XmppError> {
    if !ctx.state.secure {
        if !stanza.has_child("starttls", ns::TLS) {
            return Err(XmppError::stream(StreamCondition::PolicyViolation));
        }
        ctx.send_raw(format!("<starttls xmlns='{}'/>", ns::TLS));
        return Ok(());
    }

    if let Some(mechanisms) = stanza.get_child("mechanisms", ns::SASL) {
        let external = mechanisms
            .children()
            .any(|m| m.name() == "mechanism" && m.text().trim() == "EXTERNAL");
        if !external {
            return Err(XmppError::stream(StreamCondition::UnsupportedFeature));
        }
        let local = ctx.domain().to_string();
        ctx.send_raw(format!(
            "<auth xmlns='{}' mechanism='EXTERNAL'>{}</auth>",
            ns::SASL,
            STANDARD.encode(local.as_bytes())
        ));
        return Ok(());
    }

    if ctx.state.state == StreamState::Authenticated && stanza.children().next().is_none() {
        ctx.state.set_state(StreamState::NegotiationComplete);
        info!(domain = %remote, "Outbound peer stream established");
        let ready = ctx.state.outbound.as_mut().and_then(|o| o.ready.take());
        if let Some(ready) = ready {
            if ready.send(Arc::clone(ctx.handle)).is_err() {
                ctx.send_raw("</stream:stream>");
                ctx.state.action = Some(Action::Close);
            }
        }
        return Ok(());
    }

    Err(XmppError::stream(StreamCondition::UnsupportedFeature))
}

/// Opens outbound peer streams for the router, walking the SRV candidates
/// of the remote domain until one negotiates.
pub struct Dialer {
    server: Weak<ServerContext>,
    resolver: SrvResolver,
}

impl Dialer {
    pub fn new(server: Weak<ServerContext>) -> Self {
        Self {
            server,
            resolver: SrvResolver::new(),
        }
    }

    /// Try one candidate. `None` when it cannot be reached or does not
    /// finish negotiation in time.
    async fn attempt(
        &self,
        server: &Arc<ServerContext>,
        target: &ResolvedTarget,
        to: &str,
        from: &str,
    ) -> Option<Arc<SessionHandle>> {
        let addr = format!("{}:{}", target.host, target.port);
        let socket = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!(addr = %addr, error = %e, "Peer candidate unreachable");
                return None;
            }
            Err(_) => {
                warn!(addr = %addr, "Peer candidate connect timed out");
                return None;
            }
        };

        let (ready, negotiated) = oneshot::channel();
        let outbound = Outbound {
            local_domain: from.to_string(),
            remote_domain: to.to_string(),
            ready: Some(ready),
        };
        let connection = Connection::dial(Arc::clone(server), socket, outbound);
        tokio::spawn(connection.run().instrument(info_span!(
            "xmpp.connection.lifecycle",
            client_ip = %addr,
            role = "peer-outbound",
            jid = tracing::field::Empty,
        )));

        match timeout(NEGOTIATION_TIMEOUT, negotiated).await {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(_)) => {
                warn!(addr = %addr, "Peer candidate closed during negotiation");
                None
            }
            Err(_) => {
                warn!(addr = %addr, "Peer candidate negotiation timed out");
                None
            }
        }
    }

    /// Walk `targets` in order until one negotiates a stream from `from`
    /// to `to`.
    pub async fn dial(&self, targets: &[ResolvedTarget], to: &str, from: &str) -> Option<Arc<SessionHandle>> {
        let server = self.server.upgrade()?;
        for target in targets {
            if let Some(handle) = self.attempt(&server, target, to, from).await {
                metrics::record_s2s_connection(to, true);
                return Some(handle);
            }
        }
        metrics::record_s2s_connection(to, false);
        warn!(domain = %to, candidates = targets.len(), "Every peer candidate failed");
        None
    }
}

#[async_trait]
impl PeerConnector for Dialer {
    #[instrument(skip(self), name = "xmpp.s2s.connect")]
    async fn connect(&self, to: &str, from: &str) -> Option<Arc<SessionHandle>> {
        let targets = self.resolver.resolve_xmpp_server(to).await;
        self.dial(&targets, to, from).await
    }
}

//! External components (XEP-0114, Jabber Component Protocol).

use std::sync::Arc;

use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::header;
use crate::error::StreamCondition;
use crate::parser::{ns, StreamHeader};
use crate::session::StreamState;
use crate::stanza::{attr, jid_attr, Context};
use crate::storage::constant_time_eq;
use crate::XmppError;

/// Handle a component stream open. Only one handshake is allowed per
/// connection.
pub fn open(ctx: &mut Context<'_>, header_in: &StreamHeader) -> Result<(), XmppError> {
    let id = Uuid::new_v4().to_string();
    let domain = header_in.to.as_deref().map(str::trim).unwrap_or_default().to_string();
    ctx.send_raw(header(ns::COMPONENT, &id, Some(&domain), None, None));
    ctx.state.stream_id = Some(id);

    if ctx.state.state != StreamState::Initial {
        return Err(XmppError::stream(StreamCondition::NotAuthorized));
    }
    if ctx.config().component_secret(&domain).is_none() {
        return Err(XmppError::stream(StreamCondition::HostUnknown));
    }
    if header_in.xmlns.as_deref() != Some(ns::COMPONENT) {
        return Err(XmppError::stream(StreamCondition::InvalidNamespace));
    }

    debug!(domain = %domain, "Component stream opened");
    ctx.state.domain = Some(domain.clone());
    ctx.handle.write().remote_domain = Some(domain);
    ctx.state.set_state(StreamState::WaitingHandshake);
    Ok(())
}

/// `hex(sha1(stream id + secret))`.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Dispatch one component stanza.
pub fn handle(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    match ctx.state.state {
        StreamState::WaitingHandshake => handshake(ctx, &stanza),
        StreamState::Authenticated => forward(ctx, stanza),
        _ => Err(XmppError::stream(StreamCondition::NotAuthorized)),
    }
}

fn handshake(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let domain = ctx.domain().to_string();
    let expected = ctx
        .config()
        .component_secret(&domain)
        .zip(ctx.state.stream_id.as_deref())
        .map(|(secret, id)| handshake_digest(id, secret));
    let offered = stanza.text();
    let valid = stanza.name() == "handshake"
        && expected.is_some_and(|digest| {
            constant_time_eq(digest.as_bytes(), offered.trim().to_ascii_lowercase().as_bytes())
        });
    if !valid {
        warn!(domain = %domain, "Component handshake failed");
        return Err(XmppError::stream(StreamCondition::NotAuthorized));
    }

    ctx.state.set_state(StreamState::Authenticated);
    ctx.send_raw("<handshake/>");
    ctx.handle.mark_routable();
    info!(domain = %domain, "Component authenticated");
    Ok(())
}

/// Deliver component traffic to local users or route it onward.
fn forward(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    if !matches!(stanza.name(), "message" | "presence" | "iq") {
        return Err(XmppError::stream(StreamCondition::UnsupportedStanzaType));
    }
    let domain = ctx.domain().to_string();
    let from_ok = jid_attr(&stanza, "from").is_some_and(|from| from.domain().as_str() == domain);
    let Some(to) = jid_attr(&stanza, "to").filter(|_| from_ok && attr(&stanza, "to").is_some()) else {
        return Err(XmppError::stream(StreamCondition::ImproperAddressing));
    };

    let router = Arc::clone(ctx.router());
    if router.is_local(&stanza) {
        for recipient in router.connected_resources(&to) {
            recipient.send_element(&stanza);
        }
        Ok(())
    } else {
        router.route(stanza)
    }
}

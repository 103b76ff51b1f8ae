//! `<message/>` delivery.

use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tracing::debug;

use super::{attr, Context};
use crate::{ErrorType, StanzaCondition, XmppError};

const MESSAGE_TYPES: [&str; 5] = ["chat", "error", "groupchat", "headline", "normal"];

/// Deliver a message to local resources or route it to its domain.
pub async fn handle(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    ctx.require_complete()?;
    if attr(&stanza, "type").is_some_and(|t| !MESSAGE_TYPES.contains(&t)) {
        return Err(XmppError::bad_request(&stanza));
    }

    let to = match attr(&stanza, "to").map(Jid::new) {
        Some(Ok(to)) => Some(to),
        Some(Err(e)) => {
            debug!(error = %e, "Message to a malformed address");
            return Err(XmppError::stanza(&stanza, StanzaCondition::JidMalformed, ErrorType::Modify));
        }
        None => None,
    };

    let router = Arc::clone(ctx.router());
    if !router.is_local(&stanza) {
        stanza.set_attr("from", ctx.jid()?.to_string());
        return router.route(stanza);
    }

    let to = match to {
        Some(to) => to,
        None => Jid::from(ctx.bare_jid()?),
    };
    let recipients = router.connected_resources(&to);
    if recipients.is_empty() {
        if ctx.find_user(&to.to_bare()).await?.is_none() {
            return Err(XmppError::service_unavailable(&stanza));
        }
        debug!(to = %to, "Recipient offline, dropping message");
        return Ok(());
    }
    ctx.broadcast(&stanza, &recipients)
}

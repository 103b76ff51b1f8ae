//! Client-to-server streams (RFC 6120), shared by TCP and long-poll.

use minidom::Element;
use tracing::debug;

use super::{check_namespaces, features, mechanisms_feature, reply_header, starttls_feature};
use crate::error::StreamCondition;
use crate::parser::{ns, StreamHeader};
use crate::session::StreamState;
use crate::stanza::{auth, iq, message, presence, starttls, Context};
use crate::XmppError;

/// Handle a client stream open. The reply header is sent before any check
/// so a stream error always has a stream to live in.
pub fn open(ctx: &mut Context<'_>, header: &StreamHeader) -> Result<(), XmppError> {
    reply_header(ctx, ns::CLIENT, header);
    accept_open(ctx, header)?;
    ctx.send_raw(features(&features_for(ctx)));
    Ok(())
}

/// Validate a stream open and bind the stream to its virtual host.
pub fn accept_open(ctx: &mut Context<'_>, header: &StreamHeader) -> Result<(), XmppError> {
    if ctx.state.is_complete() {
        return Err(XmppError::stream(StreamCondition::NotAuthorized));
    }
    let domain = header.to.as_deref().map(str::trim).unwrap_or_default().to_string();
    if !ctx.config().is_vhost(&domain) {
        return Err(XmppError::stream(StreamCondition::HostUnknown));
    }
    if ctx.state.domain.as_deref().is_some_and(|d| d != domain) {
        return Err(XmppError::stream(StreamCondition::HostUnknown));
    }
    check_namespaces(header, ns::CLIENT)?;

    debug!(domain = %domain, state = %ctx.state.state, "Client stream opened");
    ctx.state.storage = ctx.server.storage(&domain);
    ctx.state.domain = Some(domain);
    Ok(())
}

/// The features offered in the current negotiation state, without the
/// `<stream:features>` wrapper.
pub fn features_for(ctx: &Context<'_>) -> String {
    match ctx.state.state {
        StreamState::Initial if !ctx.state.secure => starttls_feature(),
        StreamState::Initial | StreamState::StartedTls => mechanisms_feature(&["PLAIN"]),
        StreamState::Authenticated => format!(
            "<bind xmlns='{}'/><session xmlns='{}'/>",
            ns::BIND,
            ns::SESSION
        ),
        _ => String::new(),
    }
}

/// Dispatch one client stanza.
pub async fn handle(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    match stanza.name() {
        "starttls" => starttls::handle(ctx, &stanza),
        "auth" => auth::handle(ctx, &stanza).await,
        "iq" => iq::handle(ctx, stanza).await,
        "message" => message::handle(ctx, stanza).await,
        "presence" => presence::handle(ctx, stanza).await,
        other => {
            debug!(name = %other, "Unsupported client stanza");
            Err(XmppError::stream(StreamCondition::UnsupportedStanzaType))
        }
    }
}

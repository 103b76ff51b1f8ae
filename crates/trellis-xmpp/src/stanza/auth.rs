//! SASL negotiation: PLAIN for client streams, EXTERNAL for peer servers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{info, warn};

use super::Context;
use crate::error::{SaslCondition, StreamCondition, StreamError};
use crate::metrics;
use crate::parser::ns;
use crate::session::{Role, StreamState};
use crate::tls::certificate_matches;
use crate::XmppError;

/// Failed attempts allowed before the stream is closed.
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Handle `<auth mechanism='...'>payload</auth>`.
pub async fn handle(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    match ctx.state.state {
        StreamState::Initial if ctx.state.role.is_client() && !ctx.state.secure => {
            return fail(ctx, SaslCondition::EncryptionRequired, "none");
        }
        StreamState::Authenticated | StreamState::NegotiationComplete => {
            return Err(XmppError::stream(StreamCondition::NotAuthorized));
        }
        _ => {}
    }

    let mechanism = stanza.attr("mechanism").unwrap_or_default().to_string();
    let payload = stanza.text();
    let payload = payload.trim();
    if stanza.ns() != ns::SASL || payload.is_empty() {
        return fail(ctx, SaslCondition::MalformedRequest, &mechanism);
    }

    match (mechanism.as_str(), ctx.state.role) {
        ("PLAIN", Role::Client | Role::Bosh) => plain(ctx, payload).await,
        ("EXTERNAL", Role::PeerInbound) => external(ctx, payload),
        _ => fail(ctx, SaslCondition::InvalidMechanism, &mechanism),
    }
}

/// Count a failed attempt and report it, escalating to a stream error once
/// the ceiling is reached.
fn fail(ctx: &mut Context<'_>, condition: SaslCondition, mechanism: &str) -> Result<(), XmppError> {
    ctx.state.auth_attempts += 1;
    metrics::record_auth_attempt(mechanism, false);
    info!(
        condition = %condition,
        attempts = ctx.state.auth_attempts,
        "Authentication failed"
    );
    if ctx.state.auth_attempts >= MAX_AUTH_ATTEMPTS {
        return Err(StreamError::new(StreamCondition::PolicyViolation)
            .with_text("max authentication attempts exceeded")
            .into());
    }
    Err(XmppError::sasl(condition))
}

fn succeed(ctx: &mut Context<'_>, mechanism: &str) {
    metrics::record_auth_attempt(mechanism, true);
    ctx.state.set_state(StreamState::Authenticated);
    ctx.send_raw(format!("<success xmlns='{}'/>", ns::SASL));
}

/// Split a decoded PLAIN message into authzid, authcid and password.
fn split_plain(decoded: &str) -> Option<(&str, &str, &str)> {
    let mut parts = decoded.split('\0');
    let authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((authzid, authcid, password))
}

async fn plain(ctx: &mut Context<'_>, payload: &str) -> Result<(), XmppError> {
    let Some(decoded) = STANDARD
        .decode(payload)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    else {
        return fail(ctx, SaslCondition::IncorrectEncoding, "PLAIN");
    };
    let Some((authzid, authcid, password)) = split_plain(&decoded) else {
        return fail(ctx, SaslCondition::MalformedRequest, "PLAIN");
    };

    let domain = ctx.domain().to_string();
    let address = if authzid.is_empty() {
        format!("{}@{}", authcid, domain)
    } else {
        authzid.to_string()
    };
    let Some(jid) = BareJid::new(&address).ok().filter(|j| j.domain().as_str() == domain) else {
        return fail(ctx, SaslCondition::NotAuthorized, "PLAIN");
    };
    let Some(storage) = ctx.state.storage.clone() else {
        return fail(ctx, SaslCondition::TemporaryAuthFailure, "PLAIN");
    };

    info!(jid = %jid, "Authenticating user");
    match storage.authenticate(&jid, password).await {
        Ok(Some(user)) => {
            {
                let mut shared = ctx.handle.write();
                shared.user = Some(user);
                shared.jid = Some(Jid::from(jid.clone()));
            }
            tracing::Span::current().record("jid", jid.to_string());
            info!(jid = %jid, "Authentication succeeded");
            succeed(ctx, "PLAIN");
            Ok(())
        }
        Ok(None) => fail(ctx, SaslCondition::NotAuthorized, "PLAIN"),
        Err(e) => {
            warn!(jid = %jid, error = %e, "Storage failed during authentication");
            fail(ctx, SaslCondition::TemporaryAuthFailure, "PLAIN")
        }
    }
}

fn external(ctx: &mut Context<'_>, payload: &str) -> Result<(), XmppError> {
    let claimed = if payload == "=" {
        ctx.handle.remote_domain()
    } else {
        STANDARD
            .decode(payload)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    };
    let Some(claimed) = claimed.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()) else {
        return fail(ctx, SaslCondition::IncorrectEncoding, "EXTERNAL");
    };

    let announced = ctx.handle.remote_domain();
    let identity_ok = ctx
        .state
        .peer_certificate
        .as_deref()
        .is_some_and(|der| certificate_matches(der, &claimed));
    if !identity_ok || announced.as_deref().is_some_and(|d| d != claimed) {
        warn!(domain = %claimed, "Peer certificate does not match claimed domain");
        return fail(ctx, SaslCondition::NotAuthorized, "EXTERNAL");
    }

    ctx.handle.write().remote_domain = Some(claimed.clone());
    info!(domain = %claimed, "Peer authenticated");
    succeed(ctx, "EXTERNAL");
    Ok(())
}

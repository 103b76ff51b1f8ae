//! `<starttls/>` (RFC 6120 Section 5).

use minidom::Element;
use tracing::{debug, warn};

use super::Context;
use crate::parser::ns;
use crate::session::{Action, StreamState};
use crate::XmppError;

/// Answer a STARTTLS request: `<proceed/>` and an upgrade when the served
/// domain has a certificate, otherwise `<failure/>` and close.
pub fn handle(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let domain = ctx.domain().to_string();
    let ready = stanza.ns() == ns::TLS
        && ctx.state.state == StreamState::Initial
        && ctx.server.tls().has_certificate(&domain);

    if !ready {
        warn!(domain = %domain, "STARTTLS refused");
        ctx.send_raw(format!("<failure xmlns='{}'/>", ns::TLS));
        ctx.send_raw("</stream:stream>");
        ctx.state.action = Some(Action::Close);
        return Ok(());
    }

    debug!(domain = %domain, "STARTTLS proceeding");
    ctx.state.set_state(StreamState::StartedTls);
    ctx.send_raw(format!("<proceed xmlns='{}'/>", ns::TLS));
    ctx.state.action = Some(Action::AcceptTls { domain });
    Ok(())
}

//! Info/query handling: routing between users, server queries, roster
//! management and resource binding.

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info};
use uuid::Uuid;

use super::{attr, jid_attr, Context};
use crate::error::{ErrorType, StanzaCondition};
use crate::parser::ns;
use crate::session::{Role, SessionHandle, StreamState};
use crate::user::roster_item;
use crate::XmppError;

const IQ_TYPES: [&str; 4] = ["get", "set", "result", "error"];

/// Handle an `<iq/>` from any stream type.
pub async fn handle(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    let kind = attr(&stanza, "type").map(str::to_string);
    let valid = attr(&stanza, "id").is_some() && kind.as_deref().is_some_and(|k| IQ_TYPES.contains(&k));
    if !valid {
        return Err(XmppError::bad_request(&stanza));
    }

    if jid_attr(&stanza, "to").is_some_and(|to| to.node().is_some()) {
        return route_iq(ctx, stanza);
    }

    match kind.as_deref() {
        Some("get") => get(ctx, &stanza).await,
        Some("set") => set(ctx, &stanza).await,
        _ => {
            debug!("Ignoring iq result addressed to the server");
            Ok(())
        }
    }
}

/// Forward an IQ addressed to a user.
fn route_iq(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    ctx.require_complete()?;
    stanza.set_attr("from", ctx.jid()?.to_string());

    let router = Arc::clone(ctx.router());
    if !router.is_local(&stanza) {
        return router.route(stanza);
    }

    let Some(to) = jid_attr(&stanza, "to") else {
        return Err(XmppError::bad_request(&stanza));
    };
    let recipients = if to.resource().is_some() {
        router.connected_resources(&to)
    } else {
        router.available_resources(&[to.to_bare()])
    };
    let request = matches!(stanza.attr("type"), Some("get") | Some("set"));
    if recipients.is_empty() && request {
        return Err(XmppError::service_unavailable(&stanza));
    }
    for recipient in recipients {
        recipient.send_element(&stanza);
    }
    Ok(())
}

/// The single payload child of a get or set.
fn payload(stanza: &Element) -> Result<&Element, XmppError> {
    let mut children = stanza.children();
    match (children.next(), children.next()) {
        (Some(child), None) => Ok(child),
        _ => Err(XmppError::bad_request(stanza)),
    }
}

/// An empty result answering `stanza`.
fn result(ctx: &Context<'_>, stanza: &Element) -> Result<Element, XmppError> {
    let mut builder = Element::builder("iq", ns::CLIENT)
        .attr("type", "result")
        .attr("from", served_domain(ctx, stanza))
        .attr("to", ctx.jid()?.to_string());
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    Ok(builder.build())
}

/// The local domain a server query was addressed to.
fn served_domain(ctx: &Context<'_>, stanza: &Element) -> String {
    jid_attr(stanza, "to")
        .map(|to| to.domain().to_string())
        .unwrap_or_else(|| ctx.domain().to_string())
}

async fn get(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let child = payload(stanza)?;
    match (child.name(), child.ns().as_str()) {
        ("ping", ns::PING) => ctx.reply(&result(ctx, stanza)?),
        ("vCard", ns::VCARD) => vcard(ctx, stanza)?,
        ("query", ns::ROSTER) => roster(ctx, stanza)?,
        ("query", ns::DISCO_ITEMS) => {
            let mut reply = result(ctx, stanza)?;
            reply.append_child(Element::builder("query", ns::DISCO_ITEMS).build());
            ctx.reply(&reply);
        }
        ("query", ns::DISCO_INFO) => {
            let mut reply = result(ctx, stanza)?;
            reply.append_child(disco_info());
            ctx.reply(&reply);
        }
        // Legacy non-SASL auth probes are swallowed.
        ("query", ns::NON_SASL) => {}
        _ => return Err(XmppError::feature_not_implemented(stanza)),
    }
    Ok(())
}

fn disco_info() -> Element {
    Element::builder("query", ns::DISCO_INFO)
        .append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr("category", "server")
                .attr("type", "im")
                .build(),
        )
        .append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", ns::PING)
                .build(),
        )
        .build()
}

/// vCards are not stored; every query gets an empty card.
fn vcard(ctx: &Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let mut reply = result(ctx, stanza)?;
    reply.append_child(Element::builder("vCard", ns::VCARD).build());
    ctx.reply(&reply);
    Ok(())
}

/// Roster get: reply with every contact and start receiving pushes.
fn roster(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let user = ctx.user()?;
    if ctx.state.role.is_client() {
        ctx.handle.write().interested = true;
    }
    let mut reply = result(ctx, stanza)?;
    reply.append_child(user.roster_query());
    ctx.reply(&reply);
    Ok(())
}

async fn set(ctx: &mut Context<'_>, stanza: &Element) -> Result<(), XmppError> {
    let child = payload(stanza)?;
    match (child.name(), child.ns().as_str()) {
        ("query", ns::ROSTER) => update_roster(ctx, stanza, child).await,
        ("bind", ns::BIND) => bind(ctx, stanza, child),
        ("session", ns::SESSION) => {
            let reply = result(ctx, stanza)?;
            ctx.send(&reply);
            Ok(())
        }
        _ => Err(XmppError::feature_not_implemented(stanza)),
    }
}

/// Resource binding (RFC 6120 Section 7).
fn bind(ctx: &mut Context<'_>, stanza: &Element, child: &Element) -> Result<(), XmppError> {
    if !ctx.state.role.is_client() || ctx.state.state != StreamState::Authenticated {
        return Err(XmppError::stanza(stanza, StanzaCondition::NotAllowed, ErrorType::Cancel));
    }
    let bare = ctx.bare_jid()?;
    let router = Arc::clone(ctx.router());
    let connected = router.connected_resources(&Jid::from(bare.clone()));
    if connected.len() >= ctx.config().max_resources_per_account() {
        return Err(XmppError::stanza(
            stanza,
            StanzaCondition::ResourceConstraint,
            ErrorType::Wait,
        ));
    }

    let requested = child
        .get_child("resource", ns::BIND)
        .map(|r| r.text().trim().to_string())
        .filter(|r| !r.is_empty())
        .filter(|r| !connected.iter().any(|s| s.full_jid().is_some_and(|j| j.resource().as_str() == r)));
    let resource = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
    let full = bare
        .with_resource_str(&resource)
        .map_err(|_| XmppError::bad_request(stanza))?;

    ctx.handle.write().jid = Some(Jid::from(full.clone()));
    tracing::Span::current().record("jid", full.to_string());
    info!(jid = %full, "Resource bound");

    let mut builder = Element::builder("iq", ns::CLIENT).attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    let reply = builder
        .append(
            Element::builder("bind", ns::BIND)
                .append(Element::builder("jid", ns::BIND).append(full.to_string()).build())
                .build(),
        )
        .build();
    ctx.send(&reply);
    if ctx.state.role == Role::Client {
        ctx.send_raw("<stream:features/>");
    }
    ctx.state.set_state(StreamState::NegotiationComplete);
    Ok(())
}

/// A roster `from` must be absent or the user's own address.
fn valid_from(ctx: &Context<'_>, stanza: &Element) -> Result<bool, XmppError> {
    let Some(from) = jid_attr(stanza, "from") else {
        return Ok(attr(stanza, "from").is_none());
    };
    let jid = ctx.jid()?;
    Ok(from == jid || from == Jid::from(jid.to_bare()))
}

/// Roster set: add, update or remove one contact (RFC 6121 Section 2.3).
async fn update_roster(ctx: &mut Context<'_>, stanza: &Element, query: &Element) -> Result<(), XmppError> {
    ctx.require_complete()?;
    if !valid_from(ctx, stanza)? {
        debug!("Ignoring roster set on behalf of another address");
        return Ok(());
    }

    let mut items = query.children().filter(|c| c.name() == "item");
    let (Some(item), None) = (items.next(), items.next()) else {
        return Err(XmppError::bad_request(stanza));
    };
    let Some(jid) = attr(item, "jid").and_then(|j| Jid::new(j).ok()).map(|j| j.to_bare()) else {
        return Err(XmppError::bad_request(stanza));
    };

    let mut user = ctx.user()?;
    if jid == user.jid {
        return Err(XmppError::stanza(stanza, StanzaCondition::NotAllowed, ErrorType::Modify));
    }
    if item.attr("subscription") == Some("remove") {
        return remove_contact(ctx, stanza, &jid).await;
    }

    let contact = user.contact_or_insert(&jid);
    contact.name = attr(item, "name").map(str::to_string);
    contact.groups = item
        .children()
        .filter(|g| g.name() == "group")
        .map(|g| g.text().trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();
    let pushed = contact.to_element();
    ctx.commit_user(&user).await?;

    push_roster_item(ctx, &user.jid, &pushed);
    ctx.send(&empty_result(stanza));
    Ok(())
}

/// A bare `<iq type='result' id='...'/>`.
fn empty_result(stanza: &Element) -> Element {
    let mut builder = Element::builder("iq", ns::CLIENT).attr("type", "result");
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }
    builder.build()
}

/// Remove a contact and tear down the subscriptions in both directions.
async fn remove_contact(ctx: &mut Context<'_>, stanza: &Element, jid: &BareJid) -> Result<(), XmppError> {
    let mut user = ctx.user()?;
    let Some(contact) = user.contact(jid).cloned() else {
        return Err(XmppError::stanza(stanza, StanzaCondition::ItemNotFound, ErrorType::Modify));
    };

    let router = Arc::clone(ctx.router());
    let local = router.is_local_jid(&jid.to_string());
    let mut other = if local { ctx.find_user(jid).await? } else { None };
    if let Some(other) = other.as_mut() {
        if let Some(reverse) = other.contact_mut(&user.jid) {
            reverse.unsubscribe_to();
            reverse.unsubscribe_from();
            reverse.ask = None;
        }
        ctx.commit_user(other).await?;
    }
    user.remove_contact(jid);
    ctx.commit_user(&user).await?;

    push_roster_item(ctx, &user.jid, &roster_item(jid, "remove", None, None, &[]));
    ctx.send(&empty_result(stanza));

    let mut presences = Vec::new();
    if contact.subscribed_to() {
        presences.push(presence(&user.jid, jid, "unsubscribe"));
    }
    if contact.subscribed_from() {
        presences.push(presence(&user.jid, jid, "unsubscribed"));
    }

    if !local {
        for p in presences {
            if let Err(e) = router.route(p) {
                debug!(to = %jid, error = %e, "Dropping roster teardown presence");
            }
        }
        return Ok(());
    }

    for recipient in router.interested_resources(&[jid.clone()]) {
        let Some(to) = recipient.jid() else { continue };
        for p in &presences {
            recipient.send_element(p);
        }
        let mut gone = presence(&user.jid, jid, "unavailable");
        gone.set_attr("to", to.to_string());
        recipient.send_element(&gone);
    }
    let reverse = other
        .as_ref()
        .and_then(|o| o.contact(&user.jid))
        .map(|c| c.to_element())
        .unwrap_or_else(|| roster_item(&user.jid, "none", None, None, &[]));
    push_roster_item(ctx, jid, &reverse);
    Ok(())
}

fn presence(from: &BareJid, to: &BareJid, kind: &str) -> Element {
    Element::builder("presence", ns::CLIENT)
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .attr("type", kind)
        .build()
}

/// Send a roster push for `item` to every interested resource of `owner`.
pub fn push_roster_item(ctx: &Context<'_>, owner: &BareJid, item: &Element) {
    for recipient in ctx.router().interested_resources(&[owner.clone()]) {
        send_roster_push(&recipient, item);
    }
}

/// One roster push (RFC 6121 Section 2.1.6).
pub fn send_roster_push(recipient: &SessionHandle, item: &Element) {
    let Some(to) = recipient.jid() else { return };
    let push = Element::builder("iq", ns::CLIENT)
        .attr("id", Uuid::new_v4().to_string())
        .attr("to", to.to_string())
        .attr("type", "set")
        .append(Element::builder("query", ns::ROSTER).append(item.clone()).build())
        .build();
    recipient.send_element(&push);
}

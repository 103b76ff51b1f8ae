//! Presence broadcast and the subscription protocol (RFC 6121).
//!
//! Client streams produce outbound presence. Its effects on the sender's
//! roster are applied here, and a local destination is then fed back
//! through the inbound half as if it had arrived from a peer. Peer and
//! component streams only ever drive the inbound half.
//!
//! Every roster mutation goes through [`Context::commit_user`] so all
//! connected resources of the account observe the stored state before the
//! roster push is sent.

use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::iq::{push_roster_item, send_roster_push};
use super::{attr, jid_attr, stamp_to, Context, Direction};
use crate::parser::ns;
use crate::router::Router;
use crate::user::User;
use crate::XmppError;

const PRESENCE_TYPES: [&str; 7] = [
    "subscribe",
    "subscribed",
    "unsubscribe",
    "unsubscribed",
    "unavailable",
    "probe",
    "error",
];

/// Handle a `<presence/>` stanza.
#[instrument(skip_all, name = "xmpp.presence.handle", fields(kind = stanza.attr("type")))]
pub async fn handle(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    ctx.require_complete()?;
    let kind = attr(&stanza, "type").map(str::to_string);
    if kind.as_deref().is_some_and(|k| !PRESENCE_TYPES.contains(&k)) {
        return Err(XmppError::bad_request(&stanza));
    }

    let broadcast = matches!(kind.as_deref(), None | Some("unavailable"));
    if ctx.state.role.is_client() && broadcast && attr(&stanza, "to").is_none() {
        ctx.handle.write().last_presence = Some(stanza.clone());
    }

    match (ctx.direction(), kind.as_deref()) {
        (Direction::Outbound, Some("subscribe")) => outbound_subscribe(ctx, stanza).await,
        (Direction::Inbound, Some("subscribe")) => inbound_subscribe(ctx, stanza).await,
        (Direction::Outbound, Some("subscribed")) => outbound_subscribed(ctx, stanza).await,
        (Direction::Inbound, Some("subscribed")) => inbound_subscribed(ctx, stanza).await,
        (Direction::Outbound, Some("unsubscribe")) => outbound_unsubscribe(ctx, stanza).await,
        (Direction::Inbound, Some("unsubscribe")) => inbound_unsubscribe(ctx, stanza).await,
        (Direction::Outbound, Some("unsubscribed")) => outbound_unsubscribed(ctx, stanza).await,
        (Direction::Inbound, Some("unsubscribed")) => inbound_unsubscribed(ctx, stanza).await,
        (Direction::Outbound, Some("probe")) => outbound_probe(ctx, stanza).await,
        (Direction::Inbound, Some("probe")) => inbound_probe(ctx, stanza).await,
        (_, Some("error")) => {
            debug!("Ignoring presence error");
            Ok(())
        }
        (Direction::Outbound, _) => outbound_broadcast(ctx, stanza),
        (Direction::Inbound, _) => inbound_broadcast(ctx, stanza),
    }
}

/// Broadcast `unavailable` for a bound client that is going away. The
/// caller has already taken the session out of the routing table.
pub fn unavailable_on_disconnect(ctx: &mut Context<'_>) -> Result<(), XmppError> {
    let stanza = Element::builder("presence", ns::CLIENT)
        .attr("type", "unavailable")
        .build();
    outbound_broadcast(ctx, stanza)
}

/// Stamp the sender's bare JID and the bare target, returning both.
fn address(ctx: &Context<'_>, stanza: &mut Element) -> Result<(BareJid, BareJid), XmppError> {
    let from = ctx.bare_jid()?;
    stanza.set_attr("from", from.to_string());
    let to = stamp_to(stanza)?;
    Ok((from, to))
}

/// Route a copy of `stanza` unless it is for a local domain. Returns whether
/// the destination is local.
fn route_remote(router: &Arc<Router>, stanza: &Element) -> Result<bool, XmppError> {
    if router.is_local(stanza) {
        return Ok(true);
    }
    router.route(stanza.clone())?;
    Ok(false)
}

/// Best-effort routing for fan-out copies.
fn route_quietly(router: &Arc<Router>, stanza: Element) {
    let to = stanza.attr("to").unwrap_or_default().to_string();
    if let Err(e) = router.route(stanza) {
        warn!(to = %to, error = %e, "Failed to route presence");
    }
}

fn presence(from: &str, to: &str, kind: Option<&str>) -> Element {
    let mut builder = Element::builder("presence", ns::CLIENT)
        .attr("from", from)
        .attr("to", to);
    if let Some(kind) = kind {
        builder = builder.attr("type", kind);
    }
    builder.build()
}

/// Answer a subscription request on behalf of `target`.
fn auto_reply(ctx: &Context<'_>, stanza: &Element, target: &BareJid, kind: &str) -> Result<(), XmppError> {
    let mut reply = presence(&target.to_string(), &ctx.bare_jid()?.to_string(), Some(kind));
    if let Some(id) = stanza.attr("id") {
        reply.set_attr("id", id);
    }
    debug!(target = %target, kind = %kind, "Auto-replying to subscription request");
    ctx.reply(&reply);
    Ok(())
}

/// Push the current roster item for `contact` to `owner`'s interested
/// resources.
fn push_contact(ctx: &Context<'_>, owner: &User, contact: &BareJid) {
    if let Some(item) = owner.contact(contact).map(|c| c.to_element()) {
        push_roster_item(ctx, &owner.jid, &item);
    }
}

async fn outbound_subscribe(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (_, to) = address(ctx, &mut stanza)?;
    let router = Arc::clone(ctx.router());
    let local = route_remote(&router, &stanza)?;

    let mut user = ctx.user()?;
    user.request_subscription(&to);
    ctx.commit_user(&user).await?;
    push_contact(ctx, &user, &to);

    if local {
        inbound_subscribe(ctx, stanza).await?;
    }
    Ok(())
}

async fn inbound_subscribe(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (from, to) = address(ctx, &mut stanza)?;
    let Some(target) = ctx.find_user(&to).await? else {
        return auto_reply(ctx, &stanza, &to, "unsubscribed");
    };
    if target.subscribed_from(&from) {
        return auto_reply(ctx, &stanza, &to, "subscribed");
    }
    for recipient in ctx.router().available_resources(&[to]) {
        recipient.send_element(&stanza);
    }
    Ok(())
}

async fn outbound_subscribed(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (from, to) = address(ctx, &mut stanza)?;
    let router = Arc::clone(ctx.router());
    let local = route_remote(&router, &stanza)?;

    let mut user = ctx.user()?;
    user.add_subscription_from(&to);
    ctx.commit_user(&user).await?;
    push_contact(ctx, &user, &to);

    // The new subscriber sees every available resource at once.
    let target = to.to_string();
    let presences: Vec<Element> = router
        .available_resources(&[from])
        .iter()
        .filter_map(|r| r.jid())
        .map(|jid| presence(&jid.to_string(), &target, None))
        .collect();
    if local {
        for recipient in router.available_resources(&[to.clone()]) {
            for p in &presences {
                recipient.send_element(p);
            }
        }
        inbound_subscribed(ctx, stanza).await?;
    } else {
        for p in presences {
            route_quietly(&router, p);
        }
    }
    Ok(())
}

async fn inbound_subscribed(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (from, to) = address(ctx, &mut stanza)?;
    let Some(mut target) = ctx.find_user(&to).await? else {
        return Ok(());
    };
    let Some(contact) = target.contact_mut(&from) else {
        return Ok(());
    };
    if !contact.can_subscribe() {
        debug!(from = %from, to = %to, "Unsolicited subscription approval");
        return Ok(());
    }
    contact.subscribe_to();
    ctx.commit_user(&target).await?;

    let item = target.contact(&from).map(|c| c.to_element());
    for recipient in ctx.router().interested_resources(&[to]) {
        recipient.send_element(&stanza);
        if let Some(item) = &item {
            send_roster_push(&recipient, item);
        }
    }
    Ok(())
}

async fn outbound_unsubscribe(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (_, to) = address(ctx, &mut stanza)?;
    let router = Arc::clone(ctx.router());
    let local = route_remote(&router, &stanza)?;

    let mut user = ctx.user()?;
    user.remove_subscription_to(&to);
    ctx.commit_user(&user).await?;
    push_contact(ctx, &user, &to);

    if local {
        inbound_unsubscribe(ctx, stanza).await?;
    }
    Ok(())
}

async fn inbound_unsubscribe(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (from, to) = address(ctx, &mut stanza)?;
    let Some(mut target) = ctx.find_user(&to).await? else {
        return Ok(());
    };
    let Some(contact) = target.contact_mut(&from).filter(|c| c.subscribed_from()) else {
        return Ok(());
    };
    contact.unsubscribe_from();
    ctx.commit_user(&target).await?;

    let item = target.contact(&from).map(|c| c.to_element());
    for recipient in ctx.router().interested_resources(&[to]) {
        recipient.send_element(&stanza);
        if let Some(item) = &item {
            send_roster_push(&recipient, item);
        }
    }
    Ok(())
}

async fn outbound_unsubscribed(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (_, to) = address(ctx, &mut stanza)?;
    let router = Arc::clone(ctx.router());
    let local = route_remote(&router, &stanza)?;

    let mut user = ctx.user()?;
    user.remove_subscription_from(&to);
    ctx.commit_user(&user).await?;
    push_contact(ctx, &user, &to);

    if local {
        inbound_unsubscribed(ctx, stanza).await?;
    }
    Ok(())
}

async fn inbound_unsubscribed(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let (from, to) = address(ctx, &mut stanza)?;
    let Some(mut target) = ctx.find_user(&to).await? else {
        return Ok(());
    };
    let Some(contact) = target.contact_mut(&from).filter(|c| c.subscribed_to() || c.ask.is_some()) else {
        return Ok(());
    };
    contact.unsubscribe_to();
    contact.ask = None;
    ctx.commit_user(&target).await?;

    // The former subscriber stops seeing the contact at once.
    let item = target.contact(&from).map(|c| c.to_element());
    for recipient in ctx.router().interested_resources(&[to]) {
        let Some(jid) = recipient.jid() else { continue };
        recipient.send_element(&stanza);
        if let Some(item) = &item {
            send_roster_push(&recipient, item);
        }
        recipient.send_element(&presence(&from.to_string(), &jid.to_string(), Some("unavailable")));
    }
    Ok(())
}

async fn outbound_probe(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    stanza.set_attr("from", ctx.jid()?.to_string());
    let router = Arc::clone(ctx.router());
    if route_remote(&router, &stanza)? {
        inbound_probe(ctx, stanza).await?;
    }
    Ok(())
}

async fn inbound_probe(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    let Some(to) = jid_attr(&stanza, "to").map(|j| j.to_bare()) else {
        return Err(XmppError::bad_request(&stanza));
    };
    let prober = ctx.jid()?;
    let subscribed = ctx
        .find_user(&to)
        .await?
        .is_some_and(|user| user.subscribed_from(&prober.to_bare()));
    if !subscribed {
        return auto_reply(ctx, &stanza, &to, "unsubscribed");
    }

    for resource in ctx.router().available_resources(&[to]) {
        let (Some(mut last), Some(jid)) = (resource.last_presence(), resource.jid()) else {
            continue;
        };
        last.set_attr("from", jid.to_string());
        last.set_attr("to", prober.to_string());
        ctx.reply(&last);
    }
    Ok(())
}

/// Broadcast presence from a client.
fn outbound_broadcast(ctx: &mut Context<'_>, mut stanza: Element) -> Result<(), XmppError> {
    let jid = ctx.jid()?;
    let user = ctx.user()?;
    stanza.set_attr("from", jid.to_string());

    let directed = jid_attr(&stanza, "to").map(|to| to.to_bare());
    let unavailable = attr(&stanza, "type") == Some("unavailable");
    let initial = directed.is_none() && !unavailable && !ctx.handle.is_available();
    let router = Arc::clone(ctx.router());

    let mut recipients = match &directed {
        None => {
            let subscribers: Vec<BareJid> = user.subscribed_from_contacts().map(|c| c.jid.clone()).collect();
            router.available_resources(&subscribers)
        }
        Some(to) if user.subscribed_from(to) => router.available_resources(&[to.clone()]),
        Some(_) => Vec::new(),
    };
    recipients.extend(router.available_resources(&[user.jid.clone()]));
    ctx.broadcast(&stanza, &recipients)?;

    if initial {
        let contacts: Vec<BareJid> = user.subscribed_to_contacts().map(|c| c.jid.clone()).collect();
        for resource in router.available_resources(&contacts) {
            let (Some(mut last), Some(from)) = (resource.last_presence(), resource.jid()) else {
                continue;
            };
            last.set_attr("from", from.to_string());
            last.set_attr("to", jid.to_string());
            ctx.send(&last);
        }
        ctx.handle.write().available = true;
    } else if unavailable && directed.is_none() {
        ctx.handle.write().available = false;
    }

    for contact in user.subscribed_from_contacts() {
        if router.is_local_jid(&contact.jid.to_string()) {
            continue;
        }
        if directed.as_ref().is_some_and(|to| to != &contact.jid) {
            continue;
        }
        let mut copy = stanza.clone();
        copy.set_attr("to", contact.jid.to_string());
        route_quietly(&router, copy);
    }

    if initial && ctx.server.should_probe(&user.jid) {
        for contact in user.subscribed_to_contacts() {
            if router.is_local_jid(&contact.jid.to_string()) {
                continue;
            }
            let mut probe = presence(&jid.to_string(), &contact.jid.to_string(), Some("probe"));
            probe.set_attr("id", Uuid::new_v4().to_string());
            route_quietly(&router, probe);
        }
    }
    Ok(())
}

/// Presence from a peer or component for local users.
fn inbound_broadcast(ctx: &mut Context<'_>, stanza: Element) -> Result<(), XmppError> {
    let Some(to) = jid_attr(&stanza, "to") else {
        return Ok(());
    };
    let recipients = match to.resource() {
        Some(_) => ctx.router().connected_resources(&to),
        None => ctx.router().available_resources(&[to.to_bare()]),
    };
    ctx.broadcast(&stanza, &recipients)
}


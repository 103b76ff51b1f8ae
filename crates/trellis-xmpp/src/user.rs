//! Accounts and their rosters.
//!
//! A [`User`] owns a roster of [`Contact`]s. Subscription state only moves
//! through the lattice methods on [`Contact`]; the presence engine is the
//! only caller that drives them.

use std::fmt;

use jid::BareJid;
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::parser::ns;

/// Subscription state of a roster contact (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    /// No subscription in either direction.
    #[default]
    None,
    /// The user receives the contact's presence.
    To,
    /// The contact receives the user's presence.
    From,
    /// Mutual subscription.
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Subscription::None),
            "to" => Some(Subscription::To),
            "from" => Some(Subscription::From),
            "both" => Some(Subscription::Both),
            _ => None,
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending outbound request. RFC 6121 only defines `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ask {
    Subscribe,
}

impl Ask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ask::Subscribe => "subscribe",
        }
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub ask: Option<Ask>,
    /// Group labels, in order. Duplicates are kept.
    pub groups: Vec<String>,
}

impl Contact {
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: Subscription::None,
            ask: None,
            groups: Vec::new(),
        }
    }

    /// A subscription request is outstanding and nothing has been granted yet
    /// in the `to` direction.
    pub fn can_subscribe(&self) -> bool {
        self.ask == Some(Ask::Subscribe)
            && matches!(self.subscription, Subscription::None | Subscription::From)
    }

    /// The contact approved our request: `none -> to`, `from -> both`.
    pub fn subscribe_to(&mut self) {
        self.subscription = match self.subscription {
            Subscription::None => Subscription::To,
            _ => Subscription::Both,
        };
        self.ask = None;
    }

    /// We stopped receiving the contact's presence: `both -> from`, else `none`.
    pub fn unsubscribe_to(&mut self) {
        self.subscription = match self.subscription {
            Subscription::Both => Subscription::From,
            _ => Subscription::None,
        };
    }

    /// We approved the contact's request: `none -> from`, `to -> both`.
    pub fn subscribe_from(&mut self) {
        self.subscription = match self.subscription {
            Subscription::None => Subscription::From,
            _ => Subscription::Both,
        };
        self.ask = None;
    }

    /// The contact stopped receiving our presence: `both -> to`, else `none`.
    pub fn unsubscribe_from(&mut self) {
        self.subscription = match self.subscription {
            Subscription::Both => Subscription::To,
            _ => Subscription::None,
        };
    }

    /// The user receives this contact's presence.
    pub fn subscribed_to(&self) -> bool {
        matches!(self.subscription, Subscription::To | Subscription::Both)
    }

    /// This contact receives the user's presence.
    pub fn subscribed_from(&self) -> bool {
        matches!(self.subscription, Subscription::From | Subscription::Both)
    }

    /// The `<item/>` for roster results and pushes.
    pub fn to_element(&self) -> Element {
        roster_item(
            &self.jid,
            self.subscription.as_str(),
            self.ask,
            self.name.as_deref(),
            &self.groups,
        )
    }
}

/// Build a roster `<item/>`. `subscription` is free text so pushes can carry
/// `remove`.
pub fn roster_item(
    jid: &BareJid,
    subscription: &str,
    ask: Option<Ask>,
    name: Option<&str>,
    groups: &[String],
) -> Element {
    let mut builder = Element::builder("item", ns::ROSTER)
        .attr("jid", jid.to_string())
        .attr("subscription", subscription);
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        builder = builder.attr("name", name);
    }
    if let Some(ask) = ask {
        builder = builder.attr("ask", ask.as_str());
    }
    for group in groups {
        builder = builder.append(
            Element::builder("group", ns::ROSTER)
                .append(group.clone())
                .build(),
        );
    }
    builder.build()
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub jid: BareJid,
    pub name: Option<String>,
    /// Hex HMAC credential, never the clear-text password.
    pub password: Option<String>,
    pub roster: Vec<Contact>,
}

impl User {
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            password: None,
            roster: Vec::new(),
        }
    }

    /// Copy everything but the address from `other`.
    pub fn update_from(&mut self, other: &User) {
        self.name = other.name.clone();
        self.password = other.password.clone();
        self.roster = other.roster.clone();
    }

    pub fn contact(&self, jid: &BareJid) -> Option<&Contact> {
        self.roster.iter().find(|c| &c.jid == jid)
    }

    pub fn contact_mut(&mut self, jid: &BareJid) -> Option<&mut Contact> {
        self.roster.iter_mut().find(|c| &c.jid == jid)
    }

    /// Get the contact, adding a fresh `none` entry if absent.
    pub fn contact_or_insert(&mut self, jid: &BareJid) -> &mut Contact {
        let index = match self.roster.iter().position(|c| &c.jid == jid) {
            Some(i) => i,
            None => {
                self.roster.push(Contact::new(jid.clone()));
                self.roster.len() - 1
            }
        };
        &mut self.roster[index]
    }

    pub fn subscribed_to(&self, jid: &BareJid) -> bool {
        self.contact(jid).is_some_and(Contact::subscribed_to)
    }

    pub fn subscribed_from(&self, jid: &BareJid) -> bool {
        self.contact(jid).is_some_and(Contact::subscribed_from)
    }

    pub fn remove_contact(&mut self, jid: &BareJid) {
        self.roster.retain(|c| &c.jid != jid);
    }

    /// Contacts whose presence this user receives.
    pub fn subscribed_to_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.roster.iter().filter(|c| c.subscribed_to())
    }

    /// Contacts that receive this user's presence.
    pub fn subscribed_from_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.roster.iter().filter(|c| c.subscribed_from())
    }

    /// Record an outbound `subscribe`. The ask flag is only raised while the
    /// `to` direction is not yet granted.
    pub fn request_subscription(&mut self, jid: &BareJid) {
        let contact = self.contact_or_insert(jid);
        if matches!(contact.subscription, Subscription::None | Subscription::From) {
            contact.ask = Some(Ask::Subscribe);
        }
    }

    /// Record an outbound `subscribed`.
    pub fn add_subscription_from(&mut self, jid: &BareJid) {
        self.contact_or_insert(jid).subscribe_from();
    }

    pub fn remove_subscription_to(&mut self, jid: &BareJid) {
        if let Some(c) = self.contact_mut(jid) {
            c.unsubscribe_to();
        }
    }

    pub fn remove_subscription_from(&mut self, jid: &BareJid) {
        if let Some(c) = self.contact_mut(jid) {
            c.unsubscribe_from();
        }
    }

    /// The `<query xmlns='jabber:iq:roster'>` holding every contact.
    pub fn roster_query(&self) -> Element {
        let mut query = Element::builder("query", ns::ROSTER);
        for contact in &self.roster {
            query = query.append(contact.to_element());
        }
        query.build()
    }
}

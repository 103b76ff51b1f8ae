//! Client stream tests over real sockets.
//!
//! Run with: `cargo test -p trellis-xmpp --test c2s_integration`

mod common;

use std::time::Duration;

use common::{encode_sasl_plain, has_attr, stream_header, RawXmppClient, TestServer, DEFAULT_TIMEOUT, DOMAIN};
use jid::BareJid;
use trellis_xmpp::{Ask, Contact, Storage, Subscription};

const ALICE: (&str, &str) = ("alice@example.com", "wonderland");
const BOB: (&str, &str) = ("bob@example.com", "builder");

// =============================================================================
// Stream negotiation
// =============================================================================

#[tokio::test]
async fn test_unknown_host_closes_stream() {
    let server = TestServer::start_without_tls(&[]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header("example.org")).await.unwrap();
    let reply = client.read_to_close(DEFAULT_TIMEOUT).await.unwrap();

    assert!(reply.contains("<stream:stream"), "a header precedes the error: {}", reply);
    assert!(reply.contains("<host-unknown"), "got: {}", reply);
    assert!(reply.ends_with("</stream:stream>"), "got: {}", reply);
}

#[tokio::test]
async fn test_initial_features_require_starttls() {
    let server = TestServer::start(&[ALICE]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    let reply = client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();

    assert!(reply.contains("from='example.com'"));
    assert!(reply.contains("version='1.0'"));
    assert!(reply.contains("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>"));
    assert!(!reply.contains("<mechanisms"));
}

#[tokio::test]
async fn test_starttls_refused_without_certificate() {
    let server = TestServer::start_without_tls(&[]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    client.clear();

    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
    let reply = client.read_to_close(DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"), "got: {}", reply);
    assert!(reply.contains("</stream:stream>"));
}

#[tokio::test]
async fn test_auth_before_tls_requires_encryption() {
    let server = TestServer::start(&[ALICE]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    client.clear();

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encode_sasl_plain("alice", "wonderland")
        ))
        .await
        .unwrap();
    let reply = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<encryption-required/>"), "got: {}", reply);
}

#[tokio::test]
async fn test_not_well_formed_closes_stream() {
    let server = TestServer::start_without_tls(&[]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    client.clear();

    client.send("</message>").await.unwrap();
    let reply = client.read_to_close(DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<bad-format") || reply.contains("<not-well-formed"), "got: {}", reply);
}

// =============================================================================
// Authenticated sessions
// =============================================================================

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let server = TestServer::start(&[ALICE]).await;
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
    client.read_until("<proceed", DEFAULT_TIMEOUT).await.unwrap();
    let connector = server.credentials.as_ref().unwrap().connector();
    client.upgrade(connector, DOMAIN).await.unwrap();

    client.send(&stream_header(DOMAIN)).await.unwrap();
    let features = client.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    client.clear();

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encode_sasl_plain("alice", "queen of hearts")
        ))
        .await
        .unwrap();
    let reply = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<not-authorized/>"), "got: {}", reply);
}

#[tokio::test]
async fn test_message_between_bound_resources() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;
    let mut bob = server.login("bob", BOB.1, "phone").await;

    alice
        .send("<message to='bob@example.com/phone' type='chat' id='m1'><body>hello</body></message>")
        .await
        .unwrap();
    let received = bob.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();

    assert!(received.contains("alice@example.com/laptop"), "got: {}", received);
    assert!(received.contains("<body>hello</body>"), "got: {}", received);
}

#[tokio::test]
async fn test_ping_answers_result() {
    let server = TestServer::start(&[ALICE]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<iq type='get' id='ping1' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await
        .unwrap();
    let reply = alice.read_until("ping1", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("result"), "got: {}", reply);
}

#[tokio::test]
async fn test_unknown_iq_payload_is_not_implemented() {
    let server = TestServer::start(&[ALICE]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<iq type='get' id='q1' to='example.com'><query xmlns='urn:example:nothing'/></iq>")
        .await
        .unwrap();
    let reply = alice.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("feature-not-implemented"), "got: {}", reply);
}

#[tokio::test]
async fn test_subscribe_to_missing_account_is_refused() {
    let server = TestServer::start(&[ALICE]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<presence type='subscribe' to='ghost@example.com' id='s1'/>")
        .await
        .unwrap();
    let reply = alice.read_until("unsubscribed", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("ghost@example.com"), "got: {}", reply);

    let stored = server
        .storage
        .find_user_by_jid(&BareJid::new("alice@example.com").unwrap())
        .await
        .unwrap()
        .unwrap();
    let ghost = stored.contact(&BareJid::new("ghost@example.com").unwrap()).unwrap();
    assert_eq!(ghost.ask, Some(Ask::Subscribe));
    assert!(!ghost.subscribed_to());
}

#[tokio::test]
async fn test_roster_set_is_pushed_and_stored() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<iq type='get' id='r0'><query xmlns='jabber:iq:roster'/></iq>")
        .await
        .unwrap();
    alice.read_until("r0", DEFAULT_TIMEOUT).await.unwrap();
    alice.clear();

    alice
        .send(
            "<iq type='set' id='r1'><query xmlns='jabber:iq:roster'>\
             <item jid='bob@example.com' name='Bob'><group>Friends</group></item>\
             </query></iq>",
        )
        .await
        .unwrap();
    let reply = alice.read_until("r1", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("bob@example.com"), "roster push expected: {}", reply);

    let stored = server
        .storage
        .find_user_by_jid(&BareJid::new("alice@example.com").unwrap())
        .await
        .unwrap()
        .unwrap();
    let bob = stored.contact(&BareJid::new("bob@example.com").unwrap()).unwrap();
    assert_eq!(bob.name.as_deref(), Some("Bob"));
    assert_eq!(bob.groups, vec!["Friends".to_string()]);
}

#[tokio::test]
async fn test_malformed_recipient_is_jid_malformed() {
    let server = TestServer::start(&[ALICE]).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<message to='@example.com' id='bad1'><body>hi</body></message>")
        .await
        .unwrap();
    let reply = alice.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("jid-malformed"), "got: {}", reply);
    assert!(!reply.contains("remote-server-not-found"), "got: {}", reply);
}

#[tokio::test]
async fn test_flooded_session_drops_stanzas_silently() {
    let extra = "[rate_limit]\ncapacity = 10\nrefill = 1\ninterval_ms = 3600000\n";
    let server = TestServer::start_with(extra, &[ALICE], true).await;
    // starttls, auth and bind take three tokens
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    let pings: String = (0..10)
        .map(|i| format!("<iq type='get' id='f{}' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>", i))
        .collect();
    alice.send(&pings).await.unwrap();
    alice.read_until_attr("id", "f6", DEFAULT_TIMEOUT).await.unwrap();
    let reply = alice.read_quiet(Duration::from_millis(500)).await;

    for i in 0..7 {
        assert!(has_attr(&reply, "id", &format!("f{}", i)), "f{} missing: {}", i, reply);
    }
    for i in 7..10 {
        assert!(!has_attr(&reply, "id", &format!("f{}", i)), "f{} answered: {}", i, reply);
    }
    assert!(!reply.contains("stream:error"), "got: {}", reply);
}

// =============================================================================
// Presence and subscriptions
// =============================================================================

/// Send initial presence and a roster get so the session is both available
/// and interested.
async fn go_online(client: &mut RawXmppClient) {
    client
        .send("<presence/><iq type='get' id='ready'><query xmlns='jabber:iq:roster'/></iq>")
        .await
        .unwrap();
    client.read_until_attr("id", "ready", DEFAULT_TIMEOUT).await.unwrap();
    client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    client.clear();
}

async fn stored_contact(server: &TestServer, owner: &str, contact: &str) -> Option<Contact> {
    server
        .storage
        .find_user_by_jid(&BareJid::new(owner).unwrap())
        .await
        .unwrap()
        .unwrap()
        .contact(&BareJid::new(contact).unwrap())
        .cloned()
}

/// Log in alice and bob and complete alice's subscription to bob.
async fn subscribed_pair(server: &TestServer) -> (RawXmppClient, RawXmppClient) {
    let mut alice = server.login("alice", ALICE.1, "laptop").await;
    let mut bob = server.login("bob", BOB.1, "phone").await;
    go_online(&mut alice).await;
    go_online(&mut bob).await;

    alice
        .send("<presence type='subscribe' to='bob@example.com'/>")
        .await
        .unwrap();
    let request = bob.read_until_attr("type", "subscribe", DEFAULT_TIMEOUT).await.unwrap();
    assert!(request.contains("alice@example.com"), "got: {}", request);
    bob.clear();

    bob.send("<presence type='subscribed' to='alice@example.com'/>")
        .await
        .unwrap();
    alice
        .read_until_attr("subscription", "to", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    bob.read_until_attr("subscription", "from", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    alice.clear();
    bob.clear();
    (alice, bob)
}

#[tokio::test]
async fn test_subscription_approval_sets_both_rosters() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let (_alice, _bob) = subscribed_pair(&server).await;

    let bob_for_alice = stored_contact(&server, "alice@example.com", "bob@example.com")
        .await
        .unwrap();
    assert_eq!(bob_for_alice.subscription, Subscription::To);
    assert_eq!(bob_for_alice.ask, None);

    let alice_for_bob = stored_contact(&server, "bob@example.com", "alice@example.com")
        .await
        .unwrap();
    assert_eq!(alice_for_bob.subscription, Subscription::From);
}

#[tokio::test]
async fn test_broadcast_reaches_subscribers() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let (mut alice, _bob) = subscribed_pair(&server).await;

    let mut bob = server.login("bob", BOB.1, "tablet").await;
    go_online(&mut bob).await;
    alice.clear();

    bob.send("<presence><status>away</status></presence>").await.unwrap();
    let seen = alice.read_until("<status>away</status>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(seen.contains("bob@example.com/tablet"), "got: {}", seen);
}

#[tokio::test]
async fn test_probe_replays_last_presence() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let (mut alice, mut bob) = subscribed_pair(&server).await;

    bob.send("<presence><show>dnd</show></presence><iq type='get' id='sync'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await
        .unwrap();
    bob.read_until_attr("id", "sync", DEFAULT_TIMEOUT).await.unwrap();
    alice.read_until("<show>dnd</show>", DEFAULT_TIMEOUT).await.unwrap();
    alice.clear();

    alice
        .send("<presence type='probe' to='bob@example.com'/>")
        .await
        .unwrap();
    let replay = alice.read_until("<show>dnd</show>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(replay.contains("bob@example.com/phone"), "got: {}", replay);
    assert!(replay.contains("alice@example.com/laptop"), "got: {}", replay);
}

#[tokio::test]
async fn test_unsubscribed_pushes_roster_and_unavailable() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let (mut alice, mut bob) = subscribed_pair(&server).await;

    bob.send("<presence type='unsubscribed' to='alice@example.com'/>")
        .await
        .unwrap();
    alice
        .read_until_attr("subscription", "none", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    let seen = alice
        .read_until_attr("type", "unavailable", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert!(has_attr(&seen, "type", "unsubscribed"), "got: {}", seen);

    let bob_for_alice = stored_contact(&server, "alice@example.com", "bob@example.com")
        .await
        .unwrap();
    assert_eq!(bob_for_alice.subscription, Subscription::None);
    assert_eq!(bob_for_alice.ask, None);
    let alice_for_bob = stored_contact(&server, "bob@example.com", "alice@example.com")
        .await
        .unwrap();
    assert_eq!(alice_for_bob.subscription, Subscription::None);
}

#[tokio::test]
async fn test_roster_remove_tears_down_reciprocal_subscription() {
    let server = TestServer::start(&[ALICE, BOB]).await;
    let (mut alice, mut bob) = subscribed_pair(&server).await;

    alice
        .send(
            "<iq type='set' id='rm1'><query xmlns='jabber:iq:roster'>\
             <item jid='bob@example.com' subscription='remove'/></query></iq>",
        )
        .await
        .unwrap();
    alice.read_until_attr("id", "rm1", DEFAULT_TIMEOUT).await.unwrap();
    alice
        .read_until_attr("subscription", "remove", DEFAULT_TIMEOUT)
        .await
        .unwrap();

    let seen = bob.read_until_attr("type", "unsubscribe", DEFAULT_TIMEOUT).await.unwrap();
    assert!(seen.contains("alice@example.com"), "got: {}", seen);
    bob.read_until_attr("subscription", "none", DEFAULT_TIMEOUT)
        .await
        .unwrap();

    assert!(stored_contact(&server, "alice@example.com", "bob@example.com")
        .await
        .is_none());
    let alice_for_bob = stored_contact(&server, "bob@example.com", "alice@example.com")
        .await
        .unwrap();
    assert_eq!(alice_for_bob.subscription, Subscription::None);
}

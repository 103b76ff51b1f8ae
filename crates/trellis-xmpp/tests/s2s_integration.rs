//! Server-to-server stream tests over real sockets.
//!
//! Covers inbound stream validation, SASL EXTERNAL with client
//! certificates, outbound dialing across candidates and the router's
//! pending queue.
//!
//! Run with: `cargo test -p trellis-xmpp --test s2s_integration`

mod common;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use common::{
    has_attr, NoPeers, RawXmppClient, TestServer, TestTlsCredentials, DEFAULT_TIMEOUT, DOMAIN,
};
use tokio::net::TcpListener;
use trellis_xmpp::dns::ResolvedTarget;
use trellis_xmpp::stream::Dialer;
use trellis_xmpp::{PeerConnector, Role, ServerContext, SessionHandle};

const REMOTE: &str = "remote.test";
const ALICE: (&str, &str) = ("alice@example.com", "wonderland");
const PEERS_REMOTE: &str = "[listeners.s2s]\nhosts = [\"remote.test\"]\n";

fn peer_header(to: Option<&str>, from: Option<&str>) -> String {
    let mut header = String::from(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' version='1.0'",
    );
    if let Some(to) = to {
        header.push_str(&format!(" to='{}'", to));
    }
    if let Some(from) = from {
        header.push_str(&format!(" from='{}'", from));
    }
    header.push('>');
    header
}

/// Dials a fixed candidate list once the owning server exists.
struct FixedCandidates {
    server: OnceLock<Weak<ServerContext>>,
    targets: Vec<ResolvedTarget>,
}

#[async_trait]
impl PeerConnector for FixedCandidates {
    async fn connect(&self, to: &str, from: &str) -> Option<Arc<SessionHandle>> {
        let server = self.server.get()?.clone();
        Dialer::new(server).dial(&self.targets, to, from).await
    }
}

/// A loopback port nobody listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Authenticate a raw peer as `REMOTE` against `server`.
async fn authenticated_peer(server: &TestServer, identity: &TestTlsCredentials) -> RawXmppClient {
    let addr = server.listen(Role::PeerInbound).await;
    let mut peer = RawXmppClient::connect(addr).await.unwrap();

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    let features = peer.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(features.contains("<starttls"), "got: {}", features);

    peer.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
    peer.read_until("<proceed", DEFAULT_TIMEOUT).await.unwrap();
    let creds = server.credentials.as_ref().unwrap();
    peer.upgrade(creds.connector_as(identity), DOMAIN).await.unwrap();

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    let features = peer.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(features.contains("<mechanism>EXTERNAL</mechanism>"), "got: {}", features);
    peer.clear();

    peer.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>{}</auth>",
        BASE64_STANDARD.encode(REMOTE)
    ))
    .await
    .unwrap();
    peer.read_until("<success", DEFAULT_TIMEOUT).await.unwrap();
    peer.clear();

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    peer.read_until("features", DEFAULT_TIMEOUT).await.unwrap();
    peer.read_quiet(Duration::from_millis(200)).await;
    peer.clear();
    peer
}

// =============================================================================
// Inbound stream open
// =============================================================================

#[tokio::test]
async fn test_inbound_open_rejections() {
    let server = TestServer::start_with(PEERS_REMOTE, &[], true).await;
    let addr = server.listen(Role::PeerInbound).await;

    let cases = [
        (Some(DOMAIN), None, "<improper-addressing"),
        (None, Some(REMOTE), "<improper-addressing"),
        (Some("other.test"), Some(REMOTE), "<host-unknown"),
        (Some(DOMAIN), Some("stranger.test"), "<not-authorized"),
    ];
    for (to, from, expected) in cases {
        let mut peer = RawXmppClient::connect(addr).await.unwrap();
        peer.send(&peer_header(to, from)).await.unwrap();
        let reply = peer.read_to_close(DEFAULT_TIMEOUT).await.unwrap();
        assert!(reply.contains(expected), "{:?} -> {:?}: {}", to, from, reply);
        assert!(reply.ends_with("</stream:stream>"), "got: {}", reply);
    }
}

#[tokio::test]
async fn test_stanza_before_authentication_is_refused() {
    let server = TestServer::start_with(PEERS_REMOTE, &[ALICE], true).await;
    let addr = server.listen(Role::PeerInbound).await;
    let mut peer = RawXmppClient::connect(addr).await.unwrap();

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    peer.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    peer.send("<message from='bob@remote.test' to='alice@example.com'><body>hi</body></message>")
        .await
        .unwrap();
    let reply = peer.read_to_close(DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<not-authorized"), "got: {}", reply);
}

// =============================================================================
// Authenticated inbound peer
// =============================================================================

#[tokio::test]
async fn test_external_peer_delivers_to_local_user() {
    let server = TestServer::start_with(PEERS_REMOTE, &[ALICE], true).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;
    let identity = TestTlsCredentials::generate(REMOTE);
    let mut peer = authenticated_peer(&server, &identity).await;

    peer.send(
        "<message from='bob@remote.test/desk' to='alice@example.com/laptop' type='chat'>\
         <body>hello from afar</body></message>",
    )
    .await
    .unwrap();
    let received = alice.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("bob@remote.test/desk"), "got: {}", received);
    assert!(received.contains("<body>hello from afar</body>"), "got: {}", received);
}

#[tokio::test]
async fn test_sender_outside_peer_domain_is_invalid_from() {
    let server = TestServer::start_with(PEERS_REMOTE, &[ALICE], true).await;
    let identity = TestTlsCredentials::generate(REMOTE);
    let mut peer = authenticated_peer(&server, &identity).await;

    peer.send("<message from='eve@elsewhere.test' to='alice@example.com'><body>x</body></message>")
        .await
        .unwrap();
    let reply = peer.read_to_close(DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<invalid-from"), "got: {}", reply);
}

#[tokio::test]
async fn test_external_with_foreign_certificate_fails() {
    let server = TestServer::start_with(PEERS_REMOTE, &[], true).await;
    let addr = server.listen(Role::PeerInbound).await;
    let mut peer = RawXmppClient::connect(addr).await.unwrap();
    let impostor = TestTlsCredentials::generate("impostor.test");

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    peer.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    peer.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
    peer.read_until("<proceed", DEFAULT_TIMEOUT).await.unwrap();
    let creds = server.credentials.as_ref().unwrap();
    peer.upgrade(creds.connector_as(&impostor), DOMAIN).await.unwrap();

    peer.send(&peer_header(Some(DOMAIN), Some(REMOTE))).await.unwrap();
    peer.read_until("</stream:features>", DEFAULT_TIMEOUT).await.unwrap();
    peer.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>{}</auth>",
        BASE64_STANDARD.encode(REMOTE)
    ))
    .await
    .unwrap();
    let reply = peer.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(reply.contains("<not-authorized/>"), "got: {}", reply);
}

// =============================================================================
// Outbound routing
// =============================================================================

#[tokio::test]
async fn test_dialer_skips_dead_candidate_and_delivers() {
    let remote = TestServer::start_for(
        REMOTE,
        "[listeners.s2s]\nhosts = [\"example.com\"]\n",
        &[("bob@remote.test", "builder")],
        true,
        Arc::new(NoPeers),
    )
    .await;
    let mut bob = remote.login("bob", "builder", "desk").await;
    let remote_peer_addr = remote.listen(Role::PeerInbound).await;

    let connector = Arc::new(FixedCandidates {
        server: OnceLock::new(),
        targets: vec![
            ResolvedTarget::new("127.0.0.1", closed_port().await, 0, 0),
            ResolvedTarget::new("127.0.0.1", remote_peer_addr.port(), 10, 0),
        ],
    });
    let local = TestServer::start_for(DOMAIN, PEERS_REMOTE, &[ALICE], true, connector.clone()).await;
    let _ = connector.server.set(Arc::downgrade(&local.context));
    let mut alice = local.login("alice", ALICE.1, "laptop").await;

    alice
        .send("<message to='bob@remote.test/desk' type='chat' id='fed1'><body>over the wire</body></message>")
        .await
        .unwrap();
    let received = bob.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("alice@example.com/laptop"), "got: {}", received);
    assert!(received.contains("<body>over the wire</body>"), "got: {}", received);

    // the established stream carries later traffic directly
    bob.clear();
    alice
        .send("<message to='bob@remote.test/desk' type='chat' id='fed2'><body>again</body></message>")
        .await
        .unwrap();
    let received = bob.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("<body>again</body>"), "got: {}", received);
    assert!(local.context.router().pending_domains().is_empty());
}

#[tokio::test]
async fn test_unreachable_peer_bounces_queue_in_order() {
    let server = TestServer::start_with(PEERS_REMOTE, &[ALICE], true).await;
    let mut alice = server.login("alice", ALICE.1, "laptop").await;

    alice
        .send(
            "<message to='bob@remote.test' id='bounce-1'><body>one</body></message>\
             <message to='bob@remote.test' id='bounce-2'><body>two</body></message>",
        )
        .await
        .unwrap();
    alice.read_until_attr("id", "bounce-2", DEFAULT_TIMEOUT).await.unwrap();
    let reply = alice.read_quiet(Duration::from_millis(300)).await;

    assert!(has_attr(&reply, "id", "bounce-1"), "got: {}", reply);
    assert_eq!(reply.matches("remote-server-not-found").count(), 2, "got: {}", reply);
    let first = reply.find("bounce-1").unwrap();
    let second = reply.find("bounce-2").unwrap();
    assert!(first < second, "bounces out of order: {}", reply);
}

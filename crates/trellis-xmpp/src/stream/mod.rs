//! Socket-driven XMPP streams.
//!
//! Every TCP connection is one [`Connection`] task. The task owns the
//! transport, the stanza parser and the private [`SessionState`]; other
//! sessions reach it only through its [`SessionHandle`], whose channel the
//! task drains into the socket between reads. Stanzas of one session are
//! therefore processed strictly in order.

pub mod bosh;
pub mod client;
pub mod component;
pub mod server;

pub use server::Dialer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{StreamCondition, StreamError};
use crate::metrics;
use crate::parser::{escape, ns, parse_stanza, ParseEvent, StanzaParser, StreamHeader, Version};
use crate::server::ServerContext;
use crate::session::{Action, Outbound, Role, SessionHandle, SessionState};
use crate::stanza::{presence, Context};
use crate::XmppError;

const READ_BUFFER_SIZE: usize = 8192;

/// The byte stream under a session.
#[derive(Default)]
enum Transport {
    #[default]
    None,
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::None => Ok(0),
            Transport::Plain(s) => s.read(buf).await,
            Transport::ServerTls(s) => s.read(buf).await,
            Transport::ClientTls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), XmppError> {
        match self {
            Transport::None => return Err(XmppError::internal("Transport already taken")),
            Transport::Plain(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
            Transport::ServerTls(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
            Transport::ClientTls(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        let result = match self {
            Transport::None => Ok(()),
            Transport::Plain(s) => s.shutdown().await,
            Transport::ServerTls(s) => s.shutdown().await,
            Transport::ClientTls(s) => s.shutdown().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Transport shutdown failed");
        }
    }

    /// Upgrade an accepted stream. Returns the end-entity certificate the
    /// peer presented, if any.
    async fn accept_tls(&mut self, acceptor: TlsAcceptor) -> Result<Option<Vec<u8>>, XmppError> {
        let Transport::Plain(tcp) = std::mem::take(self) else {
            return Err(XmppError::stream(StreamCondition::PolicyViolation));
        };
        let tls = acceptor.accept(tcp).await?;
        let certificate = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|der| der.as_ref().to_vec());
        *self = Transport::ServerTls(Box::new(tls));
        Ok(certificate)
    }

    /// Upgrade a stream we initiated, verifying `domain`.
    async fn connect_tls(&mut self, connector: TlsConnector, domain: &str) -> Result<(), XmppError> {
        let Transport::Plain(tcp) = std::mem::take(self) else {
            return Err(XmppError::stream(StreamCondition::PolicyViolation));
        };
        let name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .map_err(|e| XmppError::internal(format!("Invalid server name {}: {}", domain, e)))?;
        let tls = connector.connect(name, tcp).await?;
        *self = Transport::ClientTls(Box::new(tls));
        Ok(())
    }
}

/// One wake-up of the session task.
enum Event {
    Read(std::io::Result<usize>),
    Outbound(Option<String>),
    Abandoned,
}

/// What to do after processing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Restart,
    Close,
}

/// A socket-driven session.
pub struct Connection {
    server: Arc<ServerContext>,
    handle: Arc<SessionHandle>,
    rx: mpsc::Receiver<String>,
    state: SessionState,
    transport: Transport,
    parser: StanzaParser,
    peer: Option<SocketAddr>,
}

impl Connection {
    fn new(server: Arc<ServerContext>, socket: TcpStream, role: Role, peer: Option<SocketAddr>) -> Self {
        let (handle, rx) = SessionHandle::new(role);
        let config = server.config();
        let state = SessionState::new(role, config.rate_limit.bucket());
        let parser = StanzaParser::new(config.max_stanza_size(role));
        Self {
            server,
            handle,
            rx,
            state,
            transport: Transport::Plain(socket),
            parser,
            peer,
        }
    }

    /// A stream we initiate toward `outbound.remote_domain`. The stream
    /// header is queued immediately.
    fn dial(server: Arc<ServerContext>, socket: TcpStream, outbound: Outbound) -> Self {
        let peer = socket.peer_addr().ok();
        let mut connection = Self::new(server, socket, Role::PeerOutbound, peer);
        connection.handle.write().remote_domain = Some(outbound.remote_domain.clone());
        connection.state.domain = Some(outbound.local_domain.clone());
        connection
            .handle
            .send(server::outbound_header(&outbound.local_domain, &outbound.remote_domain));
        connection.state.outbound = Some(outbound);
        connection
    }

    /// Drive the session until either side closes it.
    pub async fn run(mut self) {
        let role = self.state.role;
        self.server.router().register(Arc::clone(&self.handle));
        metrics::record_connection_count(1, role.as_str());
        info!(peer = ?self.peer, role = %role, "Connection established");

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let ready = self.state.outbound.as_mut().and_then(|o| o.ready.as_mut());
            let event = tokio::select! {
                read = self.transport.read(&mut buf) => Event::Read(read),
                data = self.rx.recv() => Event::Outbound(data),
                _ = abandoned(ready) => Event::Abandoned,
            };

            let flow = match event {
                Event::Read(Ok(0)) => {
                    debug!("Peer closed the connection");
                    Flow::Close
                }
                Event::Read(Ok(n)) => self.receive(&buf[..n]).await,
                Event::Read(Err(e)) => {
                    debug!(error = %e, "Read failed");
                    Flow::Close
                }
                Event::Outbound(Some(data)) => self.write(&data).await,
                Event::Outbound(None) => Flow::Close,
                Event::Abandoned => {
                    warn!("Outbound negotiation abandoned");
                    self.handle.send("</stream:stream>");
                    self.flush().await;
                    Flow::Close
                }
            };
            if flow == Flow::Close {
                break;
            }
        }

        self.teardown().await;
    }

    async fn write(&mut self, data: &str) -> Flow {
        debug!(role = %self.state.role, xml = %data, "Sending");
        match self.transport.write_all(data.as_bytes()).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!(error = %e, "Write failed");
                Flow::Close
            }
        }
    }

    /// Write everything queued so far.
    async fn flush(&mut self) -> Flow {
        while let Ok(data) = self.rx.try_recv() {
            if self.write(&data).await == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// Feed received bytes through the parser and handle every completed
    /// event.
    async fn receive(&mut self, data: &[u8]) -> Flow {
        let events = match self.parser.feed_bytes(data) {
            Ok(events) => events,
            Err(e) => return self.fail(e).await,
        };

        for event in events {
            let result = match event {
                ParseEvent::StreamOpen(tag) => {
                    debug!(tag = %tag, "Stream opened");
                    match StreamHeader::parse(&tag) {
                        Ok(header) => self.open(header).await,
                        Err(e) => Err(e),
                    }
                }
                ParseEvent::StreamClose => {
                    debug!("Stream closed by peer");
                    self.handle.send("</stream:stream>");
                    self.state.action = Some(Action::Close);
                    Ok(())
                }
                ParseEvent::Stanza(raw) => {
                    let was_flooded = self.state.flooded;
                    if !self.state.admit() {
                        if !was_flooded {
                            metrics::record_flood(self.state.role.as_str());
                            warn!(role = %self.state.role, "Session flooded, dropping stanzas until disconnect");
                        }
                        continue;
                    }
                    debug!(role = %self.state.role, xml = %raw, "Received");
                    match parse_stanza(&raw, self.state.role.content_ns()) {
                        Ok(stanza) => self.dispatch(stanza).await,
                        Err(e) => Err(e),
                    }
                }
            };

            let mut flow = match result {
                Ok(()) => Flow::Continue,
                Err(e) => self.report(e),
            };
            if flow == Flow::Continue {
                flow = self.perform_action().await;
            }
            match flow {
                Flow::Continue => {}
                // Whatever followed in this read belongs to the old stream.
                Flow::Restart => return Flow::Continue,
                Flow::Close => {
                    self.flush().await;
                    return Flow::Close;
                }
            }
        }
        Flow::Continue
    }

    async fn open(&mut self, header: StreamHeader) -> Result<(), XmppError> {
        let mut ctx = Context::new(&self.server, &self.handle, &mut self.state);
        match ctx.state.role {
            Role::Client => client::open(&mut ctx, &header),
            Role::PeerInbound => server::inbound_open(&mut ctx, &header),
            Role::PeerOutbound => server::outbound_open(&mut ctx, &header),
            Role::Component => component::open(&mut ctx, &header),
            Role::Bosh => Err(XmppError::internal("long-poll sessions have no socket")),
        }
    }

    async fn dispatch(&mut self, stanza: minidom::Element) -> Result<(), XmppError> {
        let started = std::time::Instant::now();
        let kind = stanza.name().to_string();
        let mut ctx = Context::new(&self.server, &self.handle, &mut self.state);
        let result = match ctx.state.role {
            Role::Client => client::handle(&mut ctx, stanza).await,
            Role::PeerInbound => server::inbound_stanza(&mut ctx, stanza).await,
            Role::PeerOutbound => server::outbound_stanza(&mut ctx, stanza),
            Role::Component => component::handle(&mut ctx, stanza),
            Role::Bosh => Err(XmppError::internal("long-poll sessions have no socket")),
        };
        metrics::record_stanza(&kind, "inbound");
        metrics::record_stanza_latency(started.elapsed().as_secs_f64() * 1000.0, &kind);
        result
    }

    /// Write a handler error to the peer and decide whether the stream
    /// survives it.
    fn report(&mut self, error: XmppError) -> Flow {
        match error {
            XmppError::Sasl(e) => {
                self.handle.send(e.to_xml());
                Flow::Continue
            }
            XmppError::Stanza(e) if self.state.role == Role::PeerInbound => {
                match parse_stanza(&e.to_xml(), ns::SERVER) {
                    Ok(bounce) => {
                        if let Err(err) = self.server.router().route(bounce) {
                            debug!(error = %err, "Dropping error bounce for remote sender");
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to build error bounce"),
                }
                Flow::Continue
            }
            XmppError::Stanza(e) => {
                debug!(condition = %e.condition, "Stanza error");
                self.handle.send(e.to_xml());
                Flow::Continue
            }
            other => {
                let stream = stream_error(other);
                self.close_with(&stream);
                Flow::Close
            }
        }
    }

    /// Send a stream error and the closing tag. A header is sent first when
    /// the peer has not received one yet.
    fn close_with(&mut self, error: &StreamError) {
        info!(condition = %error.condition, role = %self.state.role, "Closing stream with error");
        if self.state.stream_id.is_none() && self.state.role != Role::PeerOutbound {
            let id = Uuid::new_v4().to_string();
            self.handle.send(header(self.state.role.content_ns(), &id, None, None, Some(Version::SUPPORTED)));
            self.state.stream_id = Some(id);
        }
        self.handle.send(error.to_xml());
        self.handle.send("</stream:stream>");
    }

    async fn fail(&mut self, error: XmppError) -> Flow {
        let stream = stream_error(error);
        self.close_with(&stream);
        self.flush().await;
        Flow::Close
    }

    /// Carry out what the last handler asked for.
    async fn perform_action(&mut self) -> Flow {
        let Some(action) = self.state.action.take() else {
            return Flow::Continue;
        };
        if self.flush().await == Flow::Close {
            return Flow::Close;
        }

        match action {
            Action::Close => Flow::Close,
            Action::AcceptTls { domain } => {
                let tls = self.server.tls();
                let acceptor = match self.state.role {
                    Role::PeerInbound => tls.peer_acceptor(&domain),
                    _ => tls.client_acceptor(&domain),
                };
                let Some(acceptor) = acceptor else {
                    warn!(domain = %domain, "No certificate for TLS upgrade");
                    return Flow::Close;
                };
                match self.transport.accept_tls(acceptor).await {
                    Ok(certificate) => {
                        debug!(domain = %domain, client_cert = certificate.is_some(), "TLS established");
                        self.state.peer_certificate = certificate;
                        self.state.secure = true;
                        self.parser.reset();
                        Flow::Restart
                    }
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "TLS handshake failed");
                        Flow::Close
                    }
                }
            }
            Action::ConnectTls { domain } => {
                let local = self.state.domain.clone().unwrap_or_default();
                let connector = self.server.tls().connector(&local);
                match self.transport.connect_tls(connector, &domain).await {
                    Ok(()) => {
                        debug!(domain = %domain, "TLS established");
                        self.state.secure = true;
                        self.parser.reset();
                        self.handle.send(server::outbound_header(&local, &domain));
                        Flow::Restart
                    }
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "TLS handshake failed");
                        Flow::Close
                    }
                }
            }
        }
    }

    /// Leave the routing table and let others know the session is gone.
    #[instrument(skip(self), name = "xmpp.connection.teardown", fields(role = %self.state.role))]
    async fn teardown(mut self) {
        let bound = self.handle.is_connected();
        self.handle.mark_dead();
        self.server.router().deregister(&self.handle);

        if bound {
            let mut ctx = Context::new(&self.server, &self.handle, &mut self.state);
            if let Err(e) = presence::unavailable_on_disconnect(&mut ctx) {
                debug!(error = %e, "Failed to broadcast unavailable presence");
            }
        }

        // Dropping an unfired ready signal lets the dialer move on.
        self.state.outbound = None;
        self.transport.shutdown().await;
        metrics::record_connection_count(-1, self.state.role.as_str());
        info!(peer = ?self.peer, jid = ?self.handle.jid(), "Connection closed");
    }
}

/// Resolves once the dialer waiting on `ready` has given up.
async fn abandoned(ready: Option<&mut oneshot::Sender<Arc<SessionHandle>>>) {
    match ready {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}

/// Map any error to the stream error that ends the session.
fn stream_error(error: XmppError) -> StreamError {
    match error {
        XmppError::Stream(e) => e,
        XmppError::Overflow { limit } => {
            StreamError::new(StreamCondition::PolicyViolation).with_text(format!("stanza exceeds {} bytes", limit))
        }
        XmppError::XmlParse(_) => StreamError::new(StreamCondition::NotWellFormed),
        other => {
            warn!(error = %other, "Internal error, closing stream");
            StreamError::new(StreamCondition::InternalServerError)
        }
    }
}

/// Accept a TCP connection of `role` and serve it to completion.
pub async fn accept(server: Arc<ServerContext>, socket: TcpStream, peer: SocketAddr, role: Role) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    Connection::new(server, socket, role, Some(peer)).run().await;
}

/// A `<stream:stream>` open tag.
pub fn header(
    content_ns: &str,
    id: &str,
    from: Option<&str>,
    to: Option<&str>,
    version: Option<Version>,
) -> String {
    let mut out = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' xml:lang='en' id='{}'",
        content_ns,
        ns::STREAM,
        escape(id)
    );
    if let Some(from) = from {
        out.push_str(&format!(" from='{}'", escape(from)));
    }
    if let Some(to) = to {
        out.push_str(&format!(" to='{}'", escape(to)));
    }
    if let Some(version) = version {
        out.push_str(&format!(" version='{}'", version));
    }
    out.push('>');
    out
}

/// Answer an inbound stream open: a fresh id, our served domain as `from`,
/// the peer's address as `to` and the negotiated version.
pub fn reply_header(ctx: &mut Context<'_>, content_ns: &str, header: &StreamHeader) {
    let id = Uuid::new_v4().to_string();
    let version = header.offered_version();
    ctx.state.version = Some(version);
    ctx.send_raw(self::header(
        content_ns,
        &id,
        header.to.as_deref(),
        header.from.as_deref(),
        version.negotiate(),
    ));
    ctx.state.stream_id = Some(id);
}

/// `<stream:features>` around `inner`.
pub fn features(inner: &str) -> String {
    if inner.is_empty() {
        "<stream:features/>".to_string()
    } else {
        format!("<stream:features>{}</stream:features>", inner)
    }
}

/// `<starttls/>` feature, mandatory.
pub fn starttls_feature() -> String {
    format!("<starttls xmlns='{}'><required/></starttls>", ns::TLS)
}

/// SASL mechanism list.
pub fn mechanisms_feature(mechanisms: &[&str]) -> String {
    let list: String = mechanisms
        .iter()
        .map(|m| format!("<mechanism>{}</mechanism>", m))
        .collect();
    format!("<mechanisms xmlns='{}'>{}</mechanisms>", ns::SASL, list)
}

/// Check the default and `stream` namespaces of a stream open.
pub fn check_namespaces(header: &StreamHeader, content_ns: &str) -> Result<(), XmppError> {
    if header.xmlns.as_deref() != Some(content_ns) || header.stream_ns.as_deref() != Some(ns::STREAM) {
        return Err(XmppError::stream(StreamCondition::InvalidNamespace));
    }
    Ok(())
}

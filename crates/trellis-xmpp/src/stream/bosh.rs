//! XMPP over long-polled HTTP (XEP-0124 / XEP-0206).
//!
//! A BOSH session outlives the HTTP requests that carry it. Its negotiation
//! state and outbound queue live in a [`BoshSession`] keyed by `sid`; each
//! request locks the session, runs its stanzas through the client handlers
//! and answers with whatever was queued, holding the request open for up to
//! `wait` seconds when nothing is. A newer request on the same sid releases
//! the held one, so only one request ever writes to a session at a time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::{client, features, stream_error};
use crate::error::StreamCondition;
use crate::metrics;
use crate::parser::{escape, ns, parse_stanza, start_tag_end, tag_attributes, ParseEvent, StanzaParser};
use crate::server::ServerContext;
use crate::session::{Action, Role, SessionHandle, SessionState, StreamState};
use crate::stanza::{presence, Context};
use crate::XmppError;

/// Queue and negotiation state of one sid.
struct Inner {
    state: SessionState,
    rx: mpsc::Receiver<String>,
}

/// One long-poll session.
pub struct BoshSession {
    sid: String,
    handle: Arc<SessionHandle>,
    inner: tokio::sync::Mutex<Inner>,
    generation: AtomicU64,
    preempt: Notify,
    pending: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl BoshSession {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Idle past `idle_timeout` with no request in flight.
    fn expired(&self, idle_timeout: Duration) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.idle_for() > idle_timeout
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Counts a request as pending for as long as it is alive.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The parsed request envelope.
#[derive(Debug, Default)]
struct Envelope {
    attrs: Vec<(String, String)>,
    stanzas: Vec<String>,
}

impl Envelope {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Split a request into its `<body>` attributes and raw child stanzas.
    fn parse(body: &str, max_stanza_size: usize) -> Result<Self, XmppError> {
        let mut body = body.trim();
        if body.starts_with("<?") {
            let end = body
                .find("?>")
                .ok_or_else(|| XmppError::xml_parse("unterminated prolog"))?;
            body = body[end + 2..].trim_start();
        }
        if !body.starts_with("<body") {
            return Err(XmppError::xml_parse("request is not a <body/>"));
        }
        let open_end = start_tag_end(body).ok_or_else(|| XmppError::xml_parse("unterminated <body>"))?;
        let open = &body[..open_end];
        let attrs = tag_attributes(open);
        if open.ends_with('/') {
            return Ok(Self { attrs, stanzas: Vec::new() });
        }

        let close = body
            .rfind("</body>")
            .filter(|close| *close > open_end)
            .ok_or_else(|| XmppError::xml_parse("missing </body>"))?;
        let mut parser = StanzaParser::new(max_stanza_size);
        let stanzas = parser
            .feed(&body[open_end + 1..close])?
            .into_iter()
            .filter_map(|event| match event {
                ParseEvent::Stanza(raw) => Some(raw),
                _ => None,
            })
            .collect();
        if parser.buffered() > 0 {
            return Err(XmppError::xml_parse("incomplete stanza in <body>"));
        }
        Ok(Self { attrs, stanzas })
    }
}

/// The HTTP side of the bridge: the session table and the server.
pub struct BoshService {
    server: Arc<ServerContext>,
    sessions: DashMap<String, Arc<BoshSession>>,
}

impl BoshService {
    pub fn new(server: Arc<ServerContext>) -> Arc<Self> {
        Arc::new(Self {
            server,
            sessions: DashMap::new(),
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Answer one request body with the XML of the response body.
    #[instrument(skip_all, name = "xmpp.bosh.request", fields(sid = tracing::field::Empty))]
    pub async fn process(&self, body: &str) -> String {
        let max = self.server.config().max_stanza_size(Role::Bosh);
        let envelope = match Envelope::parse(body, max) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Malformed BOSH request");
                return terminate(None, "bad-request", "");
            }
        };
        let rid = envelope.attr("rid").unwrap_or_default().to_string();

        let existing = envelope
            .attr("sid")
            .and_then(|sid| self.sessions.get(sid).map(|s| Arc::clone(s.value())));
        match existing {
            Some(session) => self.resume(&session, &envelope, &rid).await,
            None => self.create(&envelope, &rid),
        }
    }

    /// Run a request against a live session.
    async fn resume(&self, session: &BoshSession, envelope: &Envelope, rid: &str) -> String {
        tracing::Span::current().record("sid", session.sid.as_str());
        session.touch();
        let _pending = PendingGuard::new(&session.pending);
        let generation = session.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.preempt.notify_waiters();

        let mut inner = session.inner.lock().await;
        if !session.handle.is_alive() {
            // swept while this request waited for the lock
            drop(inner);
            debug!(sid = %session.sid, "Request raced the sweeper, starting over");
            return self.create(envelope, rid);
        }
        let response = self.exchange(session, &mut inner, envelope, rid, generation).await;
        session.touch();
        response
    }

    /// Start a session for a request without a known sid.
    fn create(&self, envelope: &Envelope, rid: &str) -> String {
        let config = self.server.config();
        let domain = match envelope.attr("to") {
            Some(to) => to.trim().to_string(),
            None => config.hosts.keys().next().cloned().unwrap_or_default(),
        };
        if !config.is_vhost(&domain) {
            debug!(domain = %domain, "BOSH session for unknown host");
            return terminate(None, StreamCondition::HostUnknown.as_str(), "");
        }

        let sid = rand::random::<u64>().to_string();
        tracing::Span::current().record("sid", sid.as_str());
        let (handle, rx) = SessionHandle::new(Role::Bosh);
        let mut state = SessionState::new(Role::Bosh, config.rate_limit.bucket());
        state.secure = true;
        state.set_state(StreamState::StartedTls);
        state.storage = self.server.storage(&domain);
        state.domain = Some(domain.clone());
        state.stream_id = Some(sid.clone());

        let offered = {
            let ctx = Context::new(&self.server, &handle, &mut state);
            client::features_for(&ctx)
        };
        self.server.router().register(Arc::clone(&handle));
        let session = Arc::new(BoshSession {
            sid: sid.clone(),
            handle,
            inner: tokio::sync::Mutex::new(Inner { state, rx }),
            generation: AtomicU64::new(0),
            preempt: Notify::new(),
            pending: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        });
        self.sessions.insert(sid.clone(), session);
        metrics::record_connection_count(1, Role::Bosh.as_str());
        info!(sid = %sid, domain = %domain, "BOSH session created");

        let bosh = &config.bosh;
        format!(
            "<body wait='{}' inactivity='{}' polling='{}' requests='{}' hold='{}' ack='{}' \
             accept='deflate,gzip' maxpause='120' charsets='UTF-8' ver='1.6' sid='{}' from='{}' \
             xmlns='{}' xmlns:xmpp='{}' xmpp:version='1.0' xmlns:stream='{}'>{}</body>",
            bosh.wait_secs,
            bosh.inactivity_secs,
            bosh.polling_secs,
            bosh.requests,
            bosh.hold,
            escape(rid),
            sid,
            escape(&domain),
            ns::HTTP_BIND,
            ns::XBOSH,
            ns::STREAM,
            features(&offered)
        )
    }

    /// Process the stanzas of one request and collect the answer.
    async fn exchange(
        &self,
        session: &BoshSession,
        inner: &mut Inner,
        envelope: &Envelope,
        rid: &str,
        generation: u64,
    ) -> String {
        if envelope.attr("xmpp:restart") == Some("true") {
            let ctx = Context::new(&self.server, &session.handle, &mut inner.state);
            debug!(state = %ctx.state.state, "BOSH stream restart");
            return response(&session.sid, rid, &features(&client::features_for(&ctx)));
        }

        for raw in &envelope.stanzas {
            debug!(xml = %raw, "Received");
            let result = match parse_stanza(raw, ns::CLIENT) {
                Ok(stanza) => {
                    metrics::record_stanza(stanza.name(), "inbound");
                    let mut ctx = Context::new(&self.server, &session.handle, &mut inner.state);
                    client::handle(&mut ctx, stanza).await
                }
                Err(e) => Err(e),
            };
            let close = match result {
                Ok(()) => matches!(inner.state.action.take(), Some(Action::Close)),
                Err(XmppError::Sasl(e)) => {
                    session.handle.send(e.to_xml());
                    false
                }
                Err(XmppError::Stanza(e)) => {
                    session.handle.send(e.to_xml());
                    false
                }
                Err(other) => {
                    let error = stream_error(other);
                    info!(condition = %error.condition, "Terminating BOSH session");
                    session.handle.send(error.to_xml());
                    true
                }
            };
            if close {
                let pending = drain(&mut inner.rx);
                self.end(session, &mut inner.state);
                return terminate(Some(&session.sid), "remote-stream-error", &pending);
            }
        }

        if envelope.attr("type") == Some("terminate") {
            let pending = drain(&mut inner.rx);
            self.end(session, &mut inner.state);
            return terminate(Some(&session.sid), "", &pending);
        }

        let mut payload = drain(&mut inner.rx);
        if payload.is_empty() {
            payload = self.hold(session, inner, generation).await;
        }
        response(&session.sid, rid, &payload)
    }

    /// Wait for queued data, giving up after `wait` or when a newer request
    /// arrives for the same session.
    async fn hold(&self, session: &BoshSession, inner: &mut Inner, generation: u64) -> String {
        let preempted = session.preempt.notified();
        tokio::pin!(preempted);
        preempted.as_mut().enable();
        if session.generation.load(Ordering::SeqCst) != generation {
            return String::new();
        }

        let wait = self.server.config().bosh.wait();
        let first = tokio::select! {
            data = timeout(wait, inner.rx.recv()) => data.ok().flatten(),
            _ = preempted => {
                debug!(sid = %session.sid, "Held request released by a newer one");
                None
            }
        };
        match first {
            Some(first) => first + &drain(&mut inner.rx),
            None => String::new(),
        }
    }

    /// Drop a session and tell its contacts it went away.
    fn end(&self, session: &BoshSession, state: &mut SessionState) {
        self.sessions.remove(&session.sid);
        let bound = session.handle.is_connected();
        session.handle.mark_dead();
        self.server.router().deregister(&session.handle);
        if bound {
            let mut ctx = Context::new(&self.server, &session.handle, state);
            if let Err(e) = presence::unavailable_on_disconnect(&mut ctx) {
                debug!(error = %e, "Failed to broadcast unavailable presence");
            }
        }
        metrics::record_connection_count(-1, Role::Bosh.as_str());
        info!(sid = %session.sid, jid = ?session.handle.jid(), "BOSH session closed");
    }

    /// Remove sessions idle past the timeout with no request in flight.
    pub fn sweep(&self) -> usize {
        let idle_timeout = self.server.config().bosh.idle_timeout();
        let expired: Vec<Arc<BoshSession>> = self
            .sessions
            .iter()
            .filter(|s| s.expired(idle_timeout))
            .map(|s| Arc::clone(s.value()))
            .collect();

        expired
            .iter()
            .filter(|session| self.reap(session, idle_timeout))
            .count()
    }

    /// End `session` if it is still expired once its lock is held.
    fn reap(&self, session: &BoshSession, idle_timeout: Duration) -> bool {
        let Ok(mut inner) = session.inner.try_lock() else {
            return false;
        };
        if !session.expired(idle_timeout) {
            return false;
        }
        debug!(sid = %session.sid, "Sweeping idle BOSH session");
        self.end(session, &mut inner.state);
        true
    }
}

fn drain(rx: &mut mpsc::Receiver<String>) -> String {
    let mut out = String::new();
    while let Ok(data) = rx.try_recv() {
        out.push_str(&data);
    }
    out
}

fn response(sid: &str, rid: &str, payload: &str) -> String {
    format!(
        "<body sid='{}' rid='{}' xmlns='{}' xmlns:stream='{}'>{}</body>",
        escape(sid),
        escape(rid),
        ns::HTTP_BIND,
        ns::STREAM,
        payload
    )
}

fn terminate(sid: Option<&str>, condition: &str, payload: &str) -> String {
    let mut out = format!("<body type='terminate' xmlns='{}'", ns::HTTP_BIND);
    if let Some(sid) = sid {
        out.push_str(&format!(" sid='{}'", escape(sid)));
    }
    if !condition.is_empty() {
        out.push_str(&format!(" condition='{}'", condition));
    }
    if payload.is_empty() {
        out.push_str("/>");
    } else {
        out.push_str(&format!(" xmlns:stream='{}'>{}</body>", ns::STREAM, payload));
    }
    out
}

async fn handle_request(State(service): State<Arc<BoshService>>, body: String) -> Response {
    if body.trim().is_empty() {
        return (StatusCode::OK, "online").into_response();
    }
    let xml = service.process(&body).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        xml,
    )
        .into_response()
}

/// Build the HTTP router for `service`, mounted at `path`.
pub fn router(service: Arc<BoshService>, path: &str) -> Router {
    Router::new()
        .route(path, post(handle_request))
        .with_state(service)
}

/// Serve the bridge on `listener` and sweep idle sessions in the background.
pub async fn serve(server: Arc<ServerContext>, listener: TcpListener) -> Result<(), XmppError> {
    let path = server
        .config()
        .listeners
        .http
        .as_ref()
        .map(|http| http.bind_path.clone())
        .ok_or_else(|| XmppError::config("no http listener configured"))?;
    let service = BoshService::new(Arc::clone(&server));

    let sweeper = Arc::clone(&service);
    let interval = server.config().bosh.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = sweeper.sweep();
            if removed > 0 {
                debug!(removed, remaining = sweeper.len(), "Swept idle BOSH sessions");
            }
        }
    });

    let app = router(service, &path);
    if let Err(e) = axum::serve(listener, app).await {
        warn!(error = %e, "BOSH listener stopped");
        return Err(e.into());
    }
    Ok(())
}

//! Stanza boundary detection for XMPP streams.
//!
//! XMPP never closes the outer document, so stanzas have to be carved out of
//! an unbounded character stream before a real XML parser (minidom) sees
//! them. [`StanzaParser`] does that with a small DFA: an explicit [`State`]
//! value, a [`Context`] carrying depth and tag names, and the pure [`step`]
//! transition function. It knows nothing about XMPP semantics beyond the
//! outer stream tags.

use std::borrow::Cow;

use minidom::{Element, Node};

use crate::error::{StreamCondition, StreamError};
use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const SERVER: &str = "jabber:server";
    /// XEP-0114 component namespace
    pub const COMPONENT: &str = "jabber:component:accept";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// XEP-0199 ping
    pub const PING: &str = "urn:xmpp:ping";
    /// XEP-0030 disco#info
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// XEP-0030 disco#items
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// XEP-0054 vcard-temp
    pub const VCARD: &str = "vcard-temp";
    /// XEP-0078 legacy authentication
    pub const NON_SASL: &str = "jabber:iq:auth";
    /// XEP-0124 BOSH body wrapper
    pub const HTTP_BIND: &str = "http://jabber.org/protocol/httpbind";
    /// XEP-0206 XMPP over BOSH
    pub const XBOSH: &str = "urn:xmpp:xbosh";
}

/// Default parser buffer ceiling (1 MiB).
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Outer element names that open and close a stream rather than a stanza.
const OUTER_TAGS: [&str; 2] = ["stream:stream", "flash:stream"];

const CDATA_OPEN: &[u8] = b"[CDATA[";

/// Something the parser recognized in the character stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// The outer `<stream:stream ...>` (or `<flash:stream ...>`) open tag.
    StreamOpen(String),
    /// The matching outer end tag.
    StreamClose,
    /// A complete top-level element, verbatim.
    Stanza(String),
}

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Between top-level elements. Anything but `<` is discarded.
    Idle,
    /// Read `<`, deciding what kind of markup follows.
    Open,
    /// Reading an element name.
    Name,
    /// Inside a start tag, after the name.
    Attributes,
    /// Inside a quoted attribute value; markup is ignored until the quote.
    Quoted(char),
    /// Read `/` inside a start tag.
    SelfClose,
    /// Reading an end tag name.
    EndTag,
    /// Character data inside an element.
    Content,
    /// Read `<!`.
    Bang,
    /// Read `<!-`.
    CommentStart,
    /// Inside a comment, counting trailing dashes.
    Comment(u8),
    /// Matching `[CDATA[`, counting matched bytes.
    CdataStart(u8),
    /// Inside CDATA, counting trailing `]`.
    Cdata(u8),
    /// Inside `<? ... ?>`; true when the previous char was `?`.
    Instruction(bool),
    /// Inside `<!DOCTYPE ...>` or another declaration.
    Declaration,
}

/// Mutable context threaded through [`step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// Open element depth; 0 between stanzas.
    pub depth: usize,
    /// Name of the tag currently being read.
    pub name: String,
    /// Name of the current top-level element.
    pub root: String,
}

/// What a transition completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Buffered text is not part of any stanza; drop it.
    Discard,
    /// A top-level element closed.
    Stanza,
    /// An outer stream open tag finished.
    StreamOpen,
    /// The outer stream end tag finished.
    StreamClose,
}

/// The transition function.
///
/// Fails only on framing that cannot be recovered: an end tag at depth zero
/// that does not close the stream.
pub fn step(state: State, ctx: &mut Context, ch: char) -> Result<(State, Option<Boundary>), StreamError> {
    let outside = |ctx: &Context| if ctx.depth == 0 { State::Idle } else { State::Content };

    let next = match state {
        State::Idle => {
            if ch == '<' {
                (State::Open, None)
            } else {
                (State::Idle, Some(Boundary::Discard))
            }
        }
        State::Open => match ch {
            '/' => {
                ctx.name.clear();
                (State::EndTag, None)
            }
            '!' => (State::Bang, None),
            '?' => (State::Instruction(false), None),
            _ => {
                ctx.depth += 1;
                ctx.name.clear();
                ctx.name.push(ch);
                (State::Name, None)
            }
        },
        State::Name => match ch {
            '>' => {
                name_done(ctx);
                finish_start_tag(ctx)
            }
            '/' => {
                name_done(ctx);
                (State::SelfClose, None)
            }
            c if c.is_whitespace() => {
                name_done(ctx);
                (State::Attributes, None)
            }
            c => {
                ctx.name.push(c);
                (State::Name, None)
            }
        },
        State::Attributes => match ch {
            '"' | '\'' => (State::Quoted(ch), None),
            '/' => (State::SelfClose, None),
            '>' => finish_start_tag(ctx),
            _ => (State::Attributes, None),
        },
        State::Quoted(quote) => {
            if ch == quote {
                (State::Attributes, None)
            } else {
                (State::Quoted(quote), None)
            }
        }
        State::SelfClose => {
            if ch == '>' {
                ctx.depth = ctx.depth.saturating_sub(1);
                if ctx.depth == 0 {
                    (State::Idle, Some(Boundary::Stanza))
                } else {
                    (State::Content, None)
                }
            } else {
                (State::Attributes, None)
            }
        }
        State::EndTag => {
            if ch != '>' {
                if !ch.is_whitespace() {
                    ctx.name.push(ch);
                }
                return Ok((State::EndTag, None));
            }
            if ctx.depth == 0 {
                if OUTER_TAGS.contains(&ctx.name.as_str()) {
                    return Ok((State::Idle, Some(Boundary::StreamClose)));
                }
                return Err(StreamError::new(StreamCondition::BadFormat)
                    .with_text(format!("unexpected end tag </{}>", ctx.name)));
            }
            ctx.depth -= 1;
            if ctx.depth == 0 {
                (State::Idle, Some(Boundary::Stanza))
            } else {
                (State::Content, None)
            }
        }
        State::Content => {
            if ch == '<' {
                (State::Open, None)
            } else {
                (State::Content, None)
            }
        }
        State::Bang => match ch {
            '-' => (State::CommentStart, None),
            '[' => (State::CdataStart(1), None),
            _ => (State::Declaration, None),
        },
        State::CommentStart => {
            if ch == '-' {
                (State::Comment(0), None)
            } else {
                (State::Declaration, None)
            }
        }
        State::Comment(dashes) => match ch {
            '-' => (State::Comment((dashes + 1).min(2)), None),
            '>' if dashes >= 2 => leave_markup(ctx, outside(ctx)),
            _ => (State::Comment(0), None),
        },
        State::CdataStart(matched) => {
            if ch as u32 == CDATA_OPEN[matched as usize] as u32 {
                let matched = matched + 1;
                if matched as usize == CDATA_OPEN.len() {
                    (State::Cdata(0), None)
                } else {
                    (State::CdataStart(matched), None)
                }
            } else {
                (State::Declaration, None)
            }
        }
        State::Cdata(brackets) => match ch {
            ']' => (State::Cdata((brackets + 1).min(2)), None),
            '>' if brackets >= 2 => (outside(ctx), None),
            _ => (State::Cdata(0), None),
        },
        State::Instruction(question) => match ch {
            '?' => (State::Instruction(true), None),
            '>' if question => leave_markup(ctx, outside(ctx)),
            _ => (State::Instruction(false), None),
        },
        State::Declaration => {
            if ch == '>' {
                leave_markup(ctx, outside(ctx))
            } else {
                (State::Declaration, None)
            }
        }
    };
    Ok(next)
}

fn name_done(ctx: &mut Context) {
    if ctx.depth == 1 {
        ctx.root = ctx.name.clone();
    }
}

fn finish_start_tag(ctx: &mut Context) -> (State, Option<Boundary>) {
    if ctx.depth == 1 && OUTER_TAGS.contains(&ctx.root.as_str()) {
        ctx.depth = 0;
        return (State::Idle, Some(Boundary::StreamOpen));
    }
    (State::Content, None)
}

/// Markup that is not an element (comment, declaration, prolog) at the top
/// level belongs to no stanza and is dropped.
fn leave_markup(ctx: &Context, next: State) -> (State, Option<Boundary>) {
    if ctx.depth == 0 {
        (next, Some(Boundary::Discard))
    } else {
        (next, None)
    }
}

/// Incremental stanza extractor.
///
/// Feed it chunks of any size; it returns the events completed by the data
/// seen so far and buffers the rest. Output does not depend on how the input
/// was chunked.
#[derive(Debug)]
pub struct StanzaParser {
    state: State,
    ctx: Context,
    buffer: String,
    partial_utf8: Vec<u8>,
    max_buffer: usize,
    failed: bool,
}

impl StanzaParser {
    /// Create a parser with the given buffer ceiling in bytes.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            state: State::Idle,
            ctx: Context::default(),
            buffer: String::new(),
            partial_utf8: Vec::new(),
            max_buffer,
            failed: false,
        }
    }

    /// Feed characters and collect completed events.
    ///
    /// Once this returns an error the parser is spent and keeps failing.
    pub fn feed(&mut self, data: &str) -> Result<Vec<ParseEvent>, XmppError> {
        if self.failed {
            return Err(XmppError::Overflow {
                limit: self.max_buffer,
            });
        }

        let mut events = Vec::new();
        for ch in data.chars() {
            self.buffer.push(ch);
            if self.buffer.len() > self.max_buffer {
                self.failed = true;
                return Err(XmppError::Overflow {
                    limit: self.max_buffer,
                });
            }

            let (next, boundary) = match step(self.state, &mut self.ctx, ch) {
                Ok(t) => t,
                Err(e) => {
                    self.failed = true;
                    return Err(e.into());
                }
            };
            self.state = next;

            match boundary {
                None => {}
                Some(Boundary::Discard) => self.buffer.clear(),
                Some(Boundary::Stanza) => events.push(ParseEvent::Stanza(self.take())),
                Some(Boundary::StreamOpen) => events.push(ParseEvent::StreamOpen(self.take())),
                Some(Boundary::StreamClose) => {
                    self.buffer.clear();
                    self.ctx = Context::default();
                    events.push(ParseEvent::StreamClose);
                }
            }
        }
        Ok(events)
    }

    /// Feed raw bytes, carrying an incomplete trailing UTF-8 sequence over
    /// to the next call.
    pub fn feed_bytes(&mut self, data: &[u8]) -> Result<Vec<ParseEvent>, XmppError> {
        self.partial_utf8.extend_from_slice(data);
        let valid = match std::str::from_utf8(&self.partial_utf8) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                return Err(XmppError::Stream(
                    StreamError::new(StreamCondition::NotWellFormed)
                        .with_text("invalid UTF-8 in stream"),
                ))
            }
        };
        let rest = self.partial_utf8.split_off(valid);
        let complete = std::mem::replace(&mut self.partial_utf8, rest);
        let text = String::from_utf8(complete)
            .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
        self.feed(&text)
    }

    /// Discard all state, as required after a stream restart (TLS, SASL).
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.ctx = Context::default();
        self.buffer.clear();
        self.partial_utf8.clear();
        self.failed = false;
    }

    /// Bytes currently buffered toward an unfinished stanza.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take(&mut self) -> String {
        let out = self.buffer.trim().to_string();
        self.buffer.clear();
        self.ctx = Context::default();
        out
    }
}

impl Default for StanzaParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// The default namespace
    pub xmlns: Option<String>,
    /// The namespace bound to the `stream` prefix
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from its raw open tag.
    ///
    /// The tag is intentionally unclosed, so attributes are read directly
    /// from the text.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !tag.starts_with('<') || !tag.ends_with('>') {
            return Err(XmppError::xml_parse("Incomplete stream header"));
        }

        let mut header = StreamHeader::default();
        for (name, value) in tag_attributes(tag) {
            match name.as_str() {
                "to" => header.to = Some(value),
                "from" => header.from = Some(value),
                "id" => header.id = Some(value),
                "version" => header.version = Some(value),
                "xml:lang" => header.lang = Some(value),
                "xmlns" => header.xmlns = Some(value),
                "xmlns:stream" => header.stream_ns = Some(value),
                _ => {}
            }
        }
        Ok(header)
    }

    /// The version the peer offered; a missing attribute means pre-1.0.
    pub fn offered_version(&self) -> Version {
        self.version
            .as_deref()
            .and_then(Version::parse)
            .unwrap_or(Version { major: 0, minor: 9 })
    }
}

/// A `major.minor` stream version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// The only version this server speaks.
    pub const SUPPORTED: Version = Version { major: 1, minor: 0 };

    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// The version to answer with, if any.
    pub fn negotiate(self) -> Option<Version> {
        (self >= Self::SUPPORTED).then_some(Self::SUPPORTED)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Read the attributes of the first tag in `tag`, in document order.
///
/// Handles both quote styles and decodes the predefined entities.
pub fn tag_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let body = tag.trim_start_matches('<');
    let end = start_tag_end(body).unwrap_or(body.len());
    let body = &body[..end];

    // skip the element name
    let mut rest = body.trim_start_matches(|c: char| !c.is_whitespace() && c != '/' && c != '>');
    loop {
        rest = rest.trim_start();
        let Some(eq) = rest.find('=') else { break };
        let name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            break;
        };
        let value_start = &after[1..];
        let Some(close) = value_start.find(quote) else { break };
        attrs.push((name, unescape(&value_start[..close]).into_owned()));
        rest = &value_start[close + 1..];
    }
    attrs
}

/// Look up one attribute of the first tag in `tag`.
pub fn tag_attribute(tag: &str, name: &str) -> Option<String> {
    tag_attributes(tag)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

/// Byte offset of the `>` closing the first start tag, ignoring quoted `>`.
pub(crate) fn start_tag_end(text: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse one extracted stanza into a minidom element.
///
/// Stanzas inherit their namespace from the stream header, which minidom
/// never sees, so missing declarations are added to the root tag first.
pub fn parse_stanza(raw: &str, default_ns: &str) -> Result<Element, XmppError> {
    let tag_end = start_tag_end(raw).ok_or_else(|| XmppError::xml_parse("Unterminated tag"))?;
    let head = &raw[..tag_end];
    let name_end = head[1..]
        .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .map(|i| i + 1)
        .unwrap_or(head.len());
    let name = &head[1..name_end];

    let attrs = tag_attributes(head);
    let has = |attr: &str| attrs.iter().any(|(n, _)| n == attr);

    let mut decls = String::new();
    if !has("xmlns") {
        decls.push_str(&format!(" xmlns='{}'", default_ns));
    }
    if name.starts_with("stream:") && !has("xmlns:stream") {
        decls.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }

    let source: Cow<'_, str> = if decls.is_empty() {
        Cow::Borrowed(raw)
    } else {
        Cow::Owned(format!("{}{}{}", &raw[..name_end], decls, &raw[name_end..]))
    };

    source
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}

/// Copy `element`, moving every node in one of the stanza content
/// namespaces (`jabber:client`, `jabber:server`, `jabber:component:accept`)
/// into `target`.
///
/// Stanzas cross stream types when routed, and each stream type has its own
/// content namespace.
pub fn restamp_namespace(element: &Element, target: &str) -> Element {
    let is_content_ns = |n: &str| n == ns::CLIENT || n == ns::SERVER || n == ns::COMPONENT;
    let element_ns = element.ns();
    let new_ns = if is_content_ns(&element_ns) {
        target.to_string()
    } else {
        element_ns
    };

    let mut builder = Element::builder(element.name(), new_ns);
    for (name, value) in element.attrs() {
        builder = builder.attr(name, value);
    }
    for node in element.nodes() {
        builder = match node {
            Node::Element(child) => builder.append(restamp_namespace(child, target)),
            Node::Text(text) => builder.append(text.clone()),
        };
    }
    builder.build()
}

/// Escape text for use in XML attribute values or character data.
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '\'', '"']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&apos;", "'")
            .replace("&quot;", "\"")
            .replace("&amp;", "&"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanzas(events: Vec<ParseEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ParseEvent::Stanza(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn whole(input: &str) -> Vec<ParseEvent> {
        StanzaParser::default().feed(input).unwrap()
    }

    fn char_by_char(input: &str) -> Vec<ParseEvent> {
        let mut parser = StanzaParser::default();
        let mut events = Vec::new();
        for ch in input.chars() {
            events.extend(parser.feed(&ch.to_string()).unwrap());
        }
        events
    }

    #[test]
    fn test_simple_stanza() {
        assert_eq!(stanzas(whole("<t></t>")), vec!["<t></t>"]);
        assert_eq!(
            stanzas(whole("<tag a=\"v\"></tag>")),
            vec!["<tag a=\"v\"></tag>"]
        );
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let inputs = [
            "<tag attr1=\"value1\" attr2='<![CDATA[[ value2 ]]>'> body </tag>",
            "<tag><!-- a <comment> --><b>text</b></tag>",
            "<tag><![CDATA[ <test></tag> > < ]]></tag>",
            "<root/>",
            "<message to='a@b'><body>1 &lt; 2</body></message>\n  <presence/>",
            "<iq type='get' id='x'><query xmlns='jabber:iq:roster'/></iq><a><b/><c d='>'/></a>",
        ];
        for input in inputs {
            let a = whole(input);
            let b = char_by_char(input);
            assert!(!a.is_empty(), "no stanza from {input}");
            assert_eq!(a, b, "chunking changed output for {input}");
        }
    }

    #[test]
    fn test_stanzas_are_verbatim_input_substrings() {
        let one = "<message to='x'><body>hi</body></message>";
        let two = "<iq type='result' id='1'/>";
        let input = format!("  {one}\n\t{two} ");
        assert_eq!(stanzas(char_by_char(&input)), vec![one, two]);
    }

    #[test]
    fn test_cdata_hides_markup() {
        let xml = "<tag><![CDATA[[ <test></tag> ]]></tag>";
        assert_eq!(stanzas(whole(xml)), vec![xml]);
    }

    #[test]
    fn test_comment_inside_element() {
        let xml = "<tag attr='v'><!-- comment -->body</tag>";
        assert_eq!(stanzas(whole(xml)), vec![xml]);
    }

    #[test]
    fn test_self_closing_root() {
        let events = whole("<presence/><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(
            stanzas(events),
            vec![
                "<presence/>",
                "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
            ]
        );
    }

    #[test]
    fn test_incomplete_stanza_is_buffered() {
        let mut parser = StanzaParser::default();
        assert!(parser.feed("<message><body>hel").unwrap().is_empty());
        assert!(parser.buffered() > 0);
        let events = parser.feed("lo</body></message>").unwrap();
        assert_eq!(
            stanzas(events),
            vec!["<message><body>hello</body></message>"]
        );
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_stream_open_and_close() {
        let input = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>\
            <presence/></stream:stream>";
        let events = char_by_char(input);
        assert_eq!(events.len(), 3);
        match &events[0] {
            ParseEvent::StreamOpen(tag) => {
                assert!(tag.starts_with("<stream:stream"));
                assert!(tag.ends_with("version='1.0'>"));
            }
            other => panic!("expected stream open, got {other:?}"),
        }
        assert_eq!(events[1], ParseEvent::Stanza("<presence/>".into()));
        assert_eq!(events[2], ParseEvent::StreamClose);
    }

    #[test]
    fn test_flash_stream_is_outer() {
        let events = whole("<flash:stream to='x'><a/></flash:stream>");
        assert!(matches!(events[0], ParseEvent::StreamOpen(_)));
        assert_eq!(events[2], ParseEvent::StreamClose);
    }

    #[test]
    fn test_stray_end_tag_is_fatal() {
        let mut parser = StanzaParser::default();
        let err = parser.feed("</message>").unwrap_err();
        assert!(matches!(
            err,
            XmppError::Stream(StreamError {
                condition: StreamCondition::BadFormat,
                ..
            })
        ));
    }

    #[test]
    fn test_overflow_regardless_of_chunking() {
        let big = format!("<message><body>{}</body></message>", "x".repeat(200));

        let mut parser = StanzaParser::new(100);
        assert!(matches!(
            parser.feed(&big),
            Err(XmppError::Overflow { limit: 100 })
        ));

        let mut parser = StanzaParser::new(100);
        let mut failed = false;
        for chunk in big.as_bytes().chunks(7) {
            if parser.feed_bytes(chunk).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(parser.feed("<a/>").is_err());
    }

    #[test]
    fn test_small_stanzas_never_overflow() {
        let mut parser = StanzaParser::new(64);
        let input = "<presence/>".repeat(50);
        let events = parser.feed(&input).unwrap();
        assert_eq!(events.len(), 50);
    }

    #[test]
    fn test_split_utf8_sequence() {
        let xml = "<message><body>héllo ✓</body></message>";
        let bytes = xml.as_bytes();
        let mut parser = StanzaParser::default();
        let mut events = Vec::new();
        for b in bytes {
            events.extend(parser.feed_bytes(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(stanzas(events), vec![xml]);
    }

    #[test]
    fn test_stream_header_parsing() {
        let header_xml = "<stream:stream xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' to='example.com' \
            from=\"user@example.com\" version='1.0' xml:lang='en'>";
        let header = StreamHeader::parse(header_xml).unwrap();
        assert_eq!(header.to.as_deref(), Some("example.com"));
        assert_eq!(header.from.as_deref(), Some("user@example.com"));
        assert_eq!(header.xmlns.as_deref(), Some(ns::CLIENT));
        assert_eq!(header.stream_ns.as_deref(), Some(ns::STREAM));
        assert_eq!(header.lang.as_deref(), Some("en"));
        assert_eq!(header.offered_version().negotiate(), Some(Version::SUPPORTED));
    }

    #[test]
    fn test_version_negotiation() {
        let header = StreamHeader::parse("<stream:stream to='a'>").unwrap();
        assert_eq!(header.offered_version(), Version { major: 0, minor: 9 });
        assert_eq!(header.offered_version().negotiate(), None);
        assert_eq!(
            Version::parse("1.5").unwrap().negotiate(),
            Some(Version::SUPPORTED)
        );
    }

    #[test]
    fn test_parse_stanza_injects_namespace() {
        let el = parse_stanza("<message to='bob@example.com'><body>Hi</body></message>", ns::CLIENT)
            .unwrap();
        assert_eq!(el.name(), "message");
        assert_eq!(el.ns(), ns::CLIENT);
        assert_eq!(el.attr("to"), Some("bob@example.com"));
        assert_eq!(el.get_child("body", ns::CLIENT).map(|b| b.text()), Some("Hi".into()));

        let el = parse_stanza("<stream:features/>", ns::SERVER).unwrap();
        assert_eq!(el.name(), "features");
        assert_eq!(el.ns(), ns::STREAM);
    }

    #[test]
    fn test_parse_stanza_keeps_explicit_namespace() {
        let el = parse_stanza("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AA==</auth>", ns::CLIENT)
            .unwrap();
        assert_eq!(el.ns(), ns::SASL);
        assert_eq!(el.text(), "AA==");
    }

    #[test]
    fn test_restamp_namespace() {
        let el = parse_stanza(
            "<message to='a@remote.org'><body>x</body><x xmlns='jabber:x:oob'/></message>",
            ns::CLIENT,
        )
        .unwrap();
        let moved = restamp_namespace(&el, ns::SERVER);
        assert_eq!(moved.ns(), ns::SERVER);
        assert!(moved.get_child("body", ns::SERVER).is_some());
        assert!(moved.get_child("x", "jabber:x:oob").is_some());
        assert_eq!(moved.attr("to"), Some("a@remote.org"));
    }

    #[test]
    fn test_tag_attributes_decode_entities() {
        let attrs = tag_attributes("<body sid='1' rid=\"2\" note='a &amp; b'>");
        assert_eq!(
            attrs,
            vec![
                ("sid".to_string(), "1".to_string()),
                ("rid".to_string(), "2".to_string()),
                ("note".to_string(), "a & b".to_string()),
            ]
        );
        assert_eq!(tag_attribute("<body xmpp:restart='true'/>", "xmpp:restart").as_deref(), Some("true"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a<b&'c'"), "a&lt;b&amp;&apos;c&apos;");
    }

    #[test]
    fn test_element_to_string_roundtrip() {
        let xml = "<message to='bob@example.com' type='chat' xmlns='jabber:client'><body>Hello!</body></message>";
        let element: Element = xml.parse().unwrap();
        let output = element_to_string(&element).unwrap();
        assert!(output.contains("bob@example.com"));
        assert!(output.contains("Hello!"));
    }
}

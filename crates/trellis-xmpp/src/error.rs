//! Error types for the XMPP server.
//!
//! Protocol errors come in three families, each with its own wire shape:
//!
//! - [`SaslError`]: a `<failure/>` in the SASL namespace. The stream survives.
//! - [`StreamError`]: a `<stream:error/>`. Always followed by closing the stream.
//! - [`StanzaError`]: a bounced copy of the offending stanza carrying `type='error'`.
//!
//! Everything else in [`XmppError`] is a local fault. When one reaches a
//! session's top-level dispatch it is reported as `internal-server-error`.

use minidom::Element;
use thiserror::Error;

use crate::parser::{escape, ns};

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// The parser buffered more than its limit without closing a stanza.
    #[error("Stanza exceeds maximum size of {limit} bytes")]
    Overflow {
        /// Configured buffer ceiling
        limit: usize,
    },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// DNS resolution failure
    #[error("DNS error: {0}")]
    Dns(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// SASL negotiation failure
    #[error("SASL error: {0}")]
    Sasl(#[from] SaslError),

    /// Fatal stream error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Stanza-scoped error
    #[error("Stanza error: {0}")]
    Stanza(#[from] StanzaError),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stream error with the given condition.
    pub fn stream(condition: StreamCondition) -> Self {
        Self::Stream(StreamError::new(condition))
    }

    /// Create a SASL failure with the given condition.
    pub fn sasl(condition: SaslCondition) -> Self {
        Self::Sasl(SaslError::new(condition))
    }

    /// Create a stanza error bouncing `stanza`.
    ///
    /// Only message, presence and iq can be bounced. Any other element kind
    /// escalates to an `unsupported-stanza-type` stream error.
    pub fn stanza(stanza: &Element, condition: StanzaCondition, error_type: ErrorType) -> Self {
        match StanzaError::new(stanza, condition, error_type) {
            Ok(e) => Self::Stanza(e),
            Err(e) => Self::Stream(e),
        }
    }

    /// Create a 'bad-request' (modify) stanza error.
    pub fn bad_request(stanza: &Element) -> Self {
        Self::stanza(stanza, StanzaCondition::BadRequest, ErrorType::Modify)
    }

    /// Create a 'service-unavailable' (cancel) stanza error.
    pub fn service_unavailable(stanza: &Element) -> Self {
        Self::stanza(stanza, StanzaCondition::ServiceUnavailable, ErrorType::Cancel)
    }

    /// Create a 'feature-not-implemented' (cancel) stanza error.
    pub fn feature_not_implemented(stanza: &Element) -> Self {
        Self::stanza(stanza, StanzaCondition::FeatureNotImplemented, ErrorType::Cancel)
    }

    /// True for the three protocol families. Anything else is a local fault.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Sasl(_) | Self::Stream(_) | Self::Stanza(_))
    }
}

/// SASL failure conditions (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCondition {
    Aborted,
    AccountDisabled,
    CredentialsExpired,
    EncryptionRequired,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::AccountDisabled => "account-disabled",
            Self::CredentialsExpired => "credentials-expired",
            Self::EncryptionRequired => "encryption-required",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

impl std::fmt::Display for SaslCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A SASL `<failure/>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition}")]
pub struct SaslError {
    pub condition: SaslCondition,
    pub text: Option<String>,
}

impl SaslError {
    pub fn new(condition: SaslCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Serialize as `<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>`.
    pub fn to_xml(&self) -> String {
        let text = self
            .text
            .as_deref()
            .map(|t| format!("<text xml:lang='en'>{}</text>", escape(t)))
            .unwrap_or_default();
        format!(
            "<failure xmlns='{}'><{}/>{}</failure>",
            ns::SASL,
            self.condition.as_str(),
            text
        )
    }
}

/// XMPP stream error conditions (RFC 6120 Section 4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl std::fmt::Display for StreamCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fatal `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition}")]
pub struct StreamError {
    pub condition: StreamCondition,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Serialize the `<stream:error>` element. The caller closes the stream.
    pub fn to_xml(&self) -> String {
        let text = self
            .text
            .as_deref()
            .map(|t| {
                format!(
                    "<text xmlns='{}' xml:lang='en'>{}</text>",
                    ns::STREAMS,
                    escape(t)
                )
            })
            .unwrap_or_default();
        format!(
            "<stream:error><{} xmlns='{}'/>{}</stream:error>",
            self.condition.as_str(),
            ns::STREAMS,
            text
        )
    }
}

impl From<StreamCondition> for StreamError {
    fn from(condition: StreamCondition) -> Self {
        Self::new(condition)
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Gone (entity no longer available)
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl std::fmt::Display for StanzaCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Proceed, the condition was only a warning
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl ErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza kinds that may carry a stanza error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            "iq" => Some(Self::Iq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }
}

/// A stanza error, carrying what it needs to bounce the offending stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition} ({error_type}) on {}", .kind.as_str())]
pub struct StanzaError {
    pub kind: StanzaKind,
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub condition: StanzaCondition,
    pub error_type: ErrorType,
    pub text: Option<String>,
}

impl StanzaError {
    /// Build an error for `stanza`.
    ///
    /// Fails with `unsupported-stanza-type` when the element is not a
    /// message, presence or iq.
    pub fn new(
        stanza: &Element,
        condition: StanzaCondition,
        error_type: ErrorType,
    ) -> Result<Self, StreamError> {
        let kind = StanzaKind::from_name(stanza.name())
            .ok_or_else(|| StreamError::new(StreamCondition::UnsupportedStanzaType))?;
        Ok(Self {
            kind,
            id: stanza.attr("id").map(str::to_string),
            from: stanza.attr("from").map(str::to_string),
            to: stanza.attr("to").map(str::to_string),
            condition,
            error_type,
            text: None,
        })
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Serialize the bounce: addressing swapped, `type='error'`, and an
    /// `<error/>` child naming the condition.
    pub fn to_xml(&self) -> String {
        let mut out = format!("<{} type='error'", self.kind.as_str());
        if let Some(id) = &self.id {
            out.push_str(&format!(" id='{}'", escape(id)));
        }
        if let Some(from) = &self.from {
            out.push_str(&format!(" to='{}'", escape(from)));
        }
        if let Some(to) = &self.to {
            out.push_str(&format!(" from='{}'", escape(to)));
        }
        out.push_str(&format!(
            "><error type='{}'><{} xmlns='{}'/>{}</error></{}>",
            self.error_type.as_str(),
            self.condition.as_str(),
            ns::STANZAS,
            self.text
                .as_deref()
                .map(|t| format!(
                    "<text xmlns='{}' xml:lang='en'>{}</text>",
                    ns::STANZAS,
                    escape(t)
                ))
                .unwrap_or_default(),
            self.kind.as_str()
        ));
        out
    }
}

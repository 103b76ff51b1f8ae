//! # trellis-xmpp
//!
//! Multi-tenant XMPP server library.
//!
//! One process serves any number of virtual hosts, each with its own account
//! storage, over four transports that converge on a single routing core:
//!
//! - **C2S**: client streams on port 5222 (RFC 6120/6121)
//! - **S2S**: federated peer streams on port 5269, authenticated with
//!   certificates and SASL EXTERNAL
//! - **Components**: trusted external services on port 5347 (XEP-0114)
//! - **BOSH**: long-polled HTTP sessions (XEP-0124/0206)
//!
//! ## Architecture
//!
//! - **Parser**: incremental stanza extraction from the raw byte stream
//! - **Sessions**: one task per connection owning its negotiation state,
//!   reachable by others through a [`session::SessionHandle`]
//! - **Router**: directory of live sessions and the queue of stanzas waiting
//!   for an outbound peer stream
//! - **Handlers**: message, presence, roster and IQ processing shared by
//!   every stream type

pub mod config;
pub mod dns;
pub mod metrics;
pub mod parser;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod session;
pub mod stanza;
pub mod storage;
pub mod stream;
pub mod tls;
pub mod user;

mod error;

pub use config::Config;
pub use error::{
    ErrorType, SaslCondition, SaslError, StanzaCondition, StanzaError, StreamCondition, StreamError,
    XmppError,
};
pub use parser::{ns, ParseEvent, StanzaParser, StreamHeader};
pub use router::{PeerConnector, Router};
pub use server::{ServerContext, XmppServer};
pub use session::{Role, SessionHandle, StreamState};
pub use storage::{LocalStorage, MemoryStorage, Storage};
pub use user::{Ask, Contact, Subscription, User};

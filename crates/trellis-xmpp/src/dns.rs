//! DNS SRV discovery for outbound server-to-server streams.
//!
//! Candidates come from the `_xmpp-server._tcp` SRV records of the remote
//! domain (RFC 6120 Section 3.2), ordered by priority and weight. Lookup
//! failures and empty answers fall back to the domain itself.

use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use tracing::{debug, instrument, warn};

/// Port used when a domain publishes no SRV records.
pub const DEFAULT_S2S_PORT: u16 = 5269;

const SRV_SERVICE: &str = "_xmpp-server._tcp";

/// One place to try when dialing a remote domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    /// Lower is tried first.
    pub priority: u16,
    /// Higher is tried first among equal priorities.
    pub weight: u16,
}

impl ResolvedTarget {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }

    pub fn fallback(domain: &str) -> Self {
        Self::new(domain, DEFAULT_S2S_PORT, 0, 0)
    }

    /// `None` for the "." target, which announces the service is absent.
    fn from_srv(srv: &SRV) -> Option<Self> {
        let host = srv.target().to_utf8();
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, srv.port(), srv.priority(), srv.weight()))
    }
}

/// Priority ascending, then weight descending. Stable for equal keys.
pub fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
}

/// Resolves dial candidates for remote domains.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<Resolver<TokioConnectionProvider>>,
}

impl SrvResolver {
    /// Use the system-independent default upstreams.
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), ResolverOpts::default())
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Candidates for `domain`, best first. Never empty: without usable
    /// records the bare domain on port 5269 is returned.
    #[instrument(skip(self), name = "xmpp.dns.resolve")]
    pub async fn resolve_xmpp_server(&self, domain: &str) -> Vec<ResolvedTarget> {
        let name = format!("{}.{}", SRV_SERVICE, domain);
        let mut targets: Vec<ResolvedTarget> = match self.resolver.srv_lookup(&name).await {
            Ok(lookup) => lookup.iter().filter_map(ResolvedTarget::from_srv).collect(),
            Err(e) => {
                if !no_records(&e) {
                    warn!(domain = %domain, error = %e, "SRV lookup failed");
                }
                Vec::new()
            }
        };

        if targets.is_empty() {
            debug!(domain = %domain, "No SRV candidates, dialing the domain itself");
            return vec![ResolvedTarget::fallback(domain)];
        }
        sort_targets(&mut targets);
        debug!(domain = %domain, count = targets.len(), "Resolved SRV candidates");
        targets
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn no_records(error: &ResolveError) -> bool {
    match error.kind() {
        ResolveErrorKind::Proto(proto) => matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_target() {
        let target = ResolvedTarget::fallback("example.com");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, DEFAULT_S2S_PORT);
    }

    #[test]
    fn test_target_sorting() {
        let mut targets = vec![
            ResolvedTarget::new("c.example.com", 5269, 20, 50),
            ResolvedTarget::new("a.example.com", 5269, 10, 30),
            ResolvedTarget::new("b.example.com", 5270, 10, 70),
            ResolvedTarget::new("d.example.com", 5269, 30, 100),
        ];
        sort_targets(&mut targets);

        let hosts: Vec<_> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(
            hosts,
            ["b.example.com", "a.example.com", "c.example.com", "d.example.com"]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_domain_falls_back() {
        let resolver = SrvResolver::new();
        let targets = resolver
            .resolve_xmpp_server("nonexistent.invalid.test.domain.local")
            .await;
        assert_eq!(targets, vec![ResolvedTarget::fallback("nonexistent.invalid.test.domain.local")]);
    }
}

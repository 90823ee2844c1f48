//! Limit policy resolution.
//!
//! Decides, per request, whether a limit applies and which one. Route-level
//! limits registered at startup take precedence over the global limit, and
//! clients inside the allowlist are exempt from both.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::trace;

use super::allowlist::Allowlist;
use super::limiter::LimitConfig;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// What the resolver needs to know about an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    /// Client address, when one could be determined
    pub client_ip: Option<IpAddr>,
    /// The matched route path (the route pattern, not the concrete URI)
    pub route: String,
}

impl RequestMeta {
    /// Create request metadata.
    pub fn new(client_ip: Option<IpAddr>, route: impl Into<String>) -> Self {
        Self {
            client_ip,
            route: route.into(),
        }
    }
}

/// Immutable limit policy shared by every request.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    /// Process-wide default limit
    global: LimitConfig,
    /// Route path -> route-specific limit
    routes: HashMap<String, LimitConfig>,
    /// Clients exempt from limiting
    allowlist: Allowlist,
}

impl PolicyResolver {
    /// Create a resolver with a global limit, no route overrides and an empty
    /// allowlist.
    pub fn new(global: LimitConfig) -> Self {
        Self {
            global,
            routes: HashMap::new(),
            allowlist: Allowlist::empty(),
        }
    }

    /// Build a resolver from validated configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        config.validate()?;

        let allowlist = Allowlist::parse(&config.white_list_ip_range)?;
        let resolver = config
            .routes
            .iter()
            .fold(Self::new(config.global), |resolver, (path, limit)| {
                resolver.with_route(path.as_str(), *limit)
            })
            .with_allowlist(allowlist);

        Ok(resolver)
    }

    /// Register a route-specific limit. A limit of zero or below opts the
    /// route out of the global limit.
    pub fn with_route(mut self, route: impl Into<String>, config: LimitConfig) -> Self {
        self.routes.insert(route.into(), config);
        self
    }

    /// Replace the allowlist.
    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// The global limit.
    pub fn global(&self) -> &LimitConfig {
        &self.global
    }

    /// The limit registered for `route`, if any.
    pub fn route_config(&self, route: &str) -> Option<&LimitConfig> {
        self.routes.get(route)
    }

    /// The allowlist.
    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    /// Whether a client is exempt from limiting.
    pub fn is_exempt(&self, client_ip: Option<IpAddr>) -> bool {
        client_ip.is_some_and(|ip| self.allowlist.contains(ip))
    }

    /// Find the limit that applies to a request.
    ///
    /// Returns `None` when the request is not limited at all, either because
    /// no limit is configured for it or because its client is allowlisted.
    pub fn resolve(&self, request: &RequestMeta) -> Option<LimitConfig> {
        let selected = match self.routes.get(&request.route) {
            Some(route_limit) => *route_limit,
            None => self.global,
        };

        if !selected.is_limited() {
            return None;
        }

        if self.is_exempt(request.client_ip) {
            trace!(
                route = %request.route,
                client_ip = ?request.client_ip,
                "Client is allowlisted, skipping rate limit"
            );
            return None;
        }

        Some(selected)
    }
}

//! Identity key generation.

use std::net::IpAddr;

/// Client token used when no IP could be determined for a request.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that uniquely identifies one counting window.
///
/// The key is composed of the deployment namespace, the client address and
/// the route path. Requests sharing a key within one window share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Deployment-wide prefix
    pub namespace: String,
    /// Client address, or [`UNKNOWN_CLIENT`]
    pub client: String,
    /// Route path the request matched
    pub route: String,
}

impl IdentityKey {
    /// Create a new identity key.
    pub fn new(namespace: &str, client_ip: Option<IpAddr>, route: &str) -> Self {
        let client = client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        Self {
            namespace: namespace.to_string(),
            client,
            route: route.to_string(),
        }
    }

    /// Convert the identity key to its store representation.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.client, self.route)
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

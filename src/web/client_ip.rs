//! Client address extraction.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

/// Headers consulted for the client address, most specific first.
const CLIENT_IP_HEADERS: &[&str] = &[
    "x-client-ip",
    "x-forwarded-for",
    "cf-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Determine the client address of a request.
///
/// Proxy headers win over the peer address, so only call this behind a proxy
/// that sets them. For list-valued headers such as `X-Forwarded-For`, the
/// first parseable entry is the client.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(first_ip)
        .or_else(|| peer.map(|addr| addr.ip()))
}

fn first_ip(value: &str) -> Option<IpAddr> {
    value.split(',').find_map(|entry| parse_entry(entry.trim()))
}

fn parse_entry(entry: &str) -> Option<IpAddr> {
    // RFC 7239: `for=192.0.2.60;proto=http`
    let entry = entry
        .split(';')
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            key.eq_ignore_ascii_case("for").then_some(value)
        })
        .unwrap_or(entry)
        .trim_matches('"');

    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(ip);
    }
    // Address with a port: `1.2.3.4:5678` or `[::1]:5678`
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    entry
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .and_then(|(ip, _)| ip.parse().ok())
}

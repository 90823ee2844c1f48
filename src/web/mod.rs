//! HTTP integration: the tower layer, its responses and the server wrapper.

mod client_ip;
mod interceptor;
mod response;
mod server;

pub use client_ip::client_ip;
pub use interceptor::{Admission, Interceptor, RateLimitContext, RateLimitLayer, RateLimitService};
pub use response::{
    apply_quota_headers, store_unavailable, too_many_requests, ErrorEnvelope, RATE_LIMIT_EXCEEDED,
    STORE_UNAVAILABLE, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;

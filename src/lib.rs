//! Ratewall - Fixed-Window HTTP Rate Limiting
//!
//! This crate implements a request-lifecycle rate limiter for axum/tower
//! services. Each request is keyed by namespace, client address and route,
//! counted against a fixed window in a shared counter store, and either
//! admitted with `X-RateLimit-*` headers or rejected with 429.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;

//! Two-phase request interceptor.
//!
//! The pre-handling phase resolves the policy for a request and counts it
//! against its window. A request over its limit is answered with 429 before
//! the handler runs. An admitted request carries its [`RateLimitContext`] to
//! the post-handling phase, which copies the quota onto successful responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, MatchedPath, Request};
use axum::response::Response;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, error, instrument, warn};

use super::client_ip::client_ip;
use super::response::{apply_quota_headers, store_unavailable, too_many_requests};
use crate::config::{FailurePolicy, RateLimitingConfig};
use crate::error::Result;
use crate::ratelimit::{
    CounterStore, IdentityKey, PolicyResolver, RateDecision, RateLimiter, RequestMeta,
};

/// Outcome of the pre-handling phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No limit applies; the request proceeds without quota metadata
    Exempt,
    /// Counted and within the limit; the handler runs
    Allowed(RateDecision),
    /// Counted and over the limit; the handler never runs
    Rejected(RateDecision),
    /// The store failed and the policy is fail-closed
    Unavailable,
}

/// Per-request quota metadata, inserted into the request extensions of
/// admitted requests.
///
/// Handlers may read it with `Extension<RateLimitContext>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitContext {
    decision: RateDecision,
}

impl RateLimitContext {
    /// Wrap the decision made for this request.
    pub fn new(decision: RateDecision) -> Self {
        Self { decision }
    }

    /// The decision made for this request.
    pub fn decision(&self) -> &RateDecision {
        &self.decision
    }
}

/// The rate limit interceptor shared by every request.
#[derive(Debug)]
pub struct Interceptor {
    /// Identity key prefix
    namespace: String,
    /// Which limit applies to which request
    resolver: PolicyResolver,
    /// Window counting against the store
    limiter: RateLimiter,
    /// Store outage behaviour
    failure_policy: FailurePolicy,
    /// Whether proxy headers may name the client
    trust_proxy_headers: bool,
}

impl Interceptor {
    /// Create an interceptor. Store outages fail closed until
    /// [`Interceptor::with_failure_policy`] says otherwise, and clients are
    /// identified by their peer address only.
    pub fn new(namespace: impl Into<String>, resolver: PolicyResolver, limiter: RateLimiter) -> Self {
        Self {
            namespace: namespace.into(),
            resolver,
            limiter,
            failure_policy: FailurePolicy::Closed,
            trust_proxy_headers: false,
        }
    }

    /// Build an interceptor over `store` from configuration.
    ///
    /// Fails with `InvalidConfig` when the configuration does not validate.
    pub fn from_config(config: &RateLimitingConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let resolver = PolicyResolver::from_config(config)?;
        let limiter = RateLimiter::new(store).with_timeout(config.store.timeout);

        Ok(Self::new(config.namespace.clone(), resolver, limiter)
            .with_failure_policy(config.failure_policy)
            .with_trusted_proxy_headers(config.trust_proxy_headers))
    }

    /// Choose what happens when the store cannot answer.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Take the client address from proxy headers when `trust` is set.
    pub fn with_trusted_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// Extract what the policy resolver needs from an axum request.
    ///
    /// The route is the matched route pattern when the layer is installed with
    /// `Router::route_layer`, and the raw URI path otherwise. The client is the
    /// peer address unless proxy headers are trusted.
    pub fn request_meta(&self, request: &Request) -> RequestMeta {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        let ip = if self.trust_proxy_headers {
            client_ip(request.headers(), peer)
        } else {
            peer.map(|addr| addr.ip())
        };

        RequestMeta::new(ip, route)
    }

    /// Run the pre-handling phase for one request.
    #[instrument(
        skip(self, request),
        fields(route = %request.route, client_ip = ?request.client_ip)
    )]
    pub async fn pre_handle(&self, request: &RequestMeta) -> Admission {
        let Some(limit) = self.resolver.resolve(request) else {
            return Admission::Exempt;
        };

        let key = IdentityKey::new(&self.namespace, request.client_ip, &request.route);

        match self.limiter.evaluate(&key, &limit).await {
            Ok(decision) if decision.is_exceeded() => {
                debug!(
                    key = %key,
                    limit = decision.total,
                    remaining = decision.remaining,
                    "Rejecting request over its rate limit"
                );
                Admission::Rejected(decision)
            }
            Ok(decision) => Admission::Allowed(decision),
            Err(err) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(key = %key, error = %err, "Rate limit check failed, failing open");
                    Admission::Exempt
                }
                FailurePolicy::Closed => {
                    error!(key = %key, error = %err, "Rate limit check failed, failing closed");
                    Admission::Unavailable
                }
            },
        }
    }

    /// Run the post-handling phase for an admitted request.
    ///
    /// Error responses are left untouched so quota details only travel on
    /// successful responses and on the rejection itself.
    pub fn post_handle<B>(context: &RateLimitContext, response: &mut http::Response<B>) {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return;
        }
        apply_quota_headers(response.headers_mut(), context.decision());
    }
}

/// Tower layer installing the [`Interceptor`] around a service.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    interceptor: Arc<Interceptor>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(interceptor: Interceptor) -> Self {
        Self::from_shared(Arc::new(interceptor))
    }

    /// Create a layer over an interceptor that is already shared.
    pub fn from_shared(interceptor: Arc<Interceptor>) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    interceptor: Arc<Interceptor>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let interceptor = self.interceptor.clone();
        // The readied service handles this request; the clone takes its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let meta = interceptor.request_meta(&request);

            match interceptor.pre_handle(&meta).await {
                Admission::Exempt => inner.call(request).await,
                Admission::Rejected(decision) => Ok(too_many_requests(&decision)),
                Admission::Unavailable => Ok(store_unavailable()),
                Admission::Allowed(decision) => {
                    let context = RateLimitContext::new(decision);
                    request.extensions_mut().insert(context);

                    let mut response = inner.call(request).await?;
                    Interceptor::post_handle(&context, &mut response);
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatewallError;
    use crate::ratelimit::{Allowlist, LimitConfig, MemoryStore, WindowHit};
    use crate::web::response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use axum::{Extension, Router};
    use http::StatusCode;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<WindowHit> {
            Err(RatewallError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn interceptor(resolver: PolicyResolver) -> Interceptor {
        Interceptor::new("clhr", resolver, RateLimiter::new(Arc::new(MemoryStore::new())))
            .with_trusted_proxy_headers(true)
    }

    fn app(interceptor: Interceptor) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/users/{id}", get(|| async { "user" }))
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "gone") }),
            )
            .route(
                "/quota",
                get(|context: Option<Extension<RateLimitContext>>| async move {
                    match context {
                        Some(Extension(context)) => context.decision().remaining.to_string(),
                        None => "none".to_string(),
                    }
                }),
            )
            .route_layer(RateLimitLayer::new(interceptor))
    }

    fn request_from(ip: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, ip: &str, path: &str) -> Response {
        app.clone().oneshot(request_from(ip, path)).await.unwrap()
    }

    fn header<'a>(response: &'a Response, name: &http::HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_requests_and_window_reset() {
        let global = LimitConfig::new(2, Duration::from_millis(1000));
        let app = app(interceptor(PolicyResolver::new(global)));

        let a = send(&app, "192.0.2.1", "/").await;
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(header(&a, &X_RATELIMIT_LIMIT), Some("2"));
        assert_eq!(header(&a, &X_RATELIMIT_REMAINING), Some("1"));
        assert!(header(&a, &X_RATELIMIT_RESET).is_some());

        let b = send(&app, "192.0.2.1", "/").await;
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(header(&b, &X_RATELIMIT_LIMIT), Some("2"));
        assert_eq!(header(&b, &X_RATELIMIT_REMAINING), Some("0"));

        let c = send(&app, "192.0.2.1", "/").await;
        assert_eq!(c.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&c, &X_RATELIMIT_LIMIT), Some("2"));
        assert_eq!(header(&c, &X_RATELIMIT_REMAINING), Some("-1"));
        assert!(header(&c, &X_RATELIMIT_RESET).is_some());
        assert!(body_string(c).await.contains("Rate limit exceeded"));

        tokio::time::advance(Duration::from_millis(1001)).await;

        let d = send(&app, "192.0.2.1", "/").await;
        assert_eq!(d.status(), StatusCode::OK);
        assert_eq!(header(&d, &X_RATELIMIT_LIMIT), Some("2"));
        assert_eq!(header(&d, &X_RATELIMIT_REMAINING), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_counted_separately() {
        let global = LimitConfig::new(1, Duration::from_secs(1));
        let app = app(interceptor(PolicyResolver::new(global)));

        assert_eq!(send(&app, "192.0.2.1", "/").await.status(), StatusCode::OK);
        assert_eq!(send(&app, "192.0.2.2", "/").await.status(), StatusCode::OK);
        assert_eq!(
            send(&app, "192.0.2.1", "/").await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_allowlisted_client_is_never_limited() {
        let resolver = PolicyResolver::new(LimitConfig::unlimited())
            .with_route("/", LimitConfig::new(1, Duration::from_secs(60)))
            .with_allowlist(Allowlist::parse(["66.249.80.0/20"]).unwrap());
        let app = app(interceptor(resolver));

        for _ in 0..100 {
            let response = send(&app, "66.249.80.17", "/").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());
            assert!(header(&response, &X_RATELIMIT_REMAINING).is_none());
            assert!(header(&response, &X_RATELIMIT_RESET).is_none());
        }
    }

    #[tokio::test]
    async fn test_unlimited_requests_carry_no_headers() {
        let app = app(interceptor(PolicyResolver::new(LimitConfig::unlimited())));

        let response = send(&app, "192.0.2.1", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_route_limit_overrides_global() {
        let resolver = PolicyResolver::new(LimitConfig::new(5, Duration::from_secs(60)))
            .with_route("/users/{id}", LimitConfig::new(1, Duration::from_secs(60)));
        let app = app(interceptor(resolver));

        let first = send(&app, "192.0.2.1", "/users/1").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, &X_RATELIMIT_LIMIT), Some("1"));

        // Same route pattern, different concrete path: same window
        let second = send(&app, "192.0.2.1", "/users/2").await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = send(&app, "192.0.2.1", "/").await;
        assert_eq!(other.status(), StatusCode::OK);
        assert_eq!(header(&other, &X_RATELIMIT_LIMIT), Some("5"));
        assert_eq!(header(&other, &X_RATELIMIT_REMAINING), Some("4"));
    }

    #[tokio::test]
    async fn test_error_responses_are_not_annotated() {
        let app = app(interceptor(PolicyResolver::new(LimitConfig::new(
            3,
            Duration::from_secs(60),
        ))));

        let response = send(&app, "192.0.2.1", "/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());

        // The request still counted against the window
        send(&app, "192.0.2.1", "/missing").await;
        send(&app, "192.0.2.1", "/missing").await;
        let rejected = send(&app, "192.0.2.1", "/missing").await;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&rejected, &X_RATELIMIT_REMAINING), Some("-1"));
    }

    #[tokio::test]
    async fn test_handler_sees_only_its_own_context() {
        let resolver = PolicyResolver::new(LimitConfig::new(10, Duration::from_secs(60)))
            .with_allowlist(Allowlist::parse(["10.0.0.0/8"]).unwrap());
        let app = app(interceptor(resolver));

        let limited = send(&app, "192.0.2.1", "/quota").await;
        assert_eq!(body_string(limited).await, "9");

        let exempt = send(&app, "10.1.1.1", "/quota").await;
        assert_eq!(body_string(exempt).await, "none");
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        let resolver = PolicyResolver::new(LimitConfig::new(10, Duration::from_secs(1)));
        let app = app(Interceptor::new("clhr", resolver, limiter).with_trusted_proxy_headers(true));

        let response = send(&app, "192.0.2.1", "/").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        let resolver = PolicyResolver::new(LimitConfig::new(10, Duration::from_secs(1)));
        let interceptor = Interceptor::new("clhr", resolver, limiter)
            .with_failure_policy(FailurePolicy::Open)
            .with_trusted_proxy_headers(true);
        let app = app(interceptor);

        let response = send(&app, "192.0.2.1", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_limit() {
        let limit = 10;
        let extra = 7;
        let app = app(interceptor(PolicyResolver::new(LimitConfig::new(
            limit,
            Duration::from_secs(60),
        ))));

        let mut handles = Vec::new();
        for _ in 0..(limit + extra) {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                app.oneshot(request_from("198.51.100.7", "/")).await.unwrap().status()
            }));
        }

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                StatusCode::OK => ok += 1,
                StatusCode::TOO_MANY_REQUESTS => rejected += 1,
                other => panic!("unexpected status {}", other),
            }
        }

        assert_eq!(ok, limit);
        assert_eq!(rejected, extra);
    }

    #[tokio::test]
    async fn test_pre_handle_admissions() {
        let resolver = PolicyResolver::new(LimitConfig::new(1, Duration::from_secs(60)))
            .with_route("/free", LimitConfig::unlimited());
        let interceptor = interceptor(resolver);
        let ip = Some("203.0.113.3".parse().unwrap());

        let free = interceptor.pre_handle(&RequestMeta::new(ip, "/free")).await;
        assert_eq!(free, Admission::Exempt);

        let first = interceptor.pre_handle(&RequestMeta::new(ip, "/")).await;
        assert!(matches!(first, Admission::Allowed(d) if d.remaining == 0));

        let second = interceptor.pre_handle(&RequestMeta::new(ip, "/")).await;
        assert!(matches!(second, Admission::Rejected(d) if d.remaining == -1));
    }

    fn request_via(peer: &str, proxy_header: (&str, &str), path: &str) -> Request {
        let peer: SocketAddr = peer.parse().unwrap();
        let mut request = Request::builder()
            .uri(path)
            .header(proxy_header.0, proxy_header.1)
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    fn crawler_allowlist_resolver() -> PolicyResolver {
        PolicyResolver::new(LimitConfig::new(1, Duration::from_secs(60)))
            .with_allowlist(Allowlist::parse(["66.249.80.0/20"]).unwrap())
    }

    #[tokio::test]
    async fn test_forged_header_is_ignored_by_default() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let app = app(Interceptor::new("clhr", crawler_allowlist_resolver(), limiter));

        let first = app
            .clone()
            .oneshot(request_via("203.0.113.50:40000", ("x-client-ip", "66.249.80.1"), "/"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, &X_RATELIMIT_REMAINING), Some("0"));

        let second = app
            .clone()
            .oneshot(request_via("203.0.113.50:40001", ("x-client-ip", "66.249.80.1"), "/"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_shares_peer_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let resolver = PolicyResolver::new(LimitConfig::new(2, Duration::from_secs(60)));
        let app = app(Interceptor::new("clhr", resolver, limiter));

        let mut statuses = Vec::new();
        for forwarded in ["192.0.2.1", "192.0.2.2", "192.0.2.3"] {
            let response = app
                .clone()
                .oneshot(request_via("203.0.113.50:40000", ("x-forwarded-for", forwarded), "/"))
                .await
                .unwrap();
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );
    }

    #[tokio::test]
    async fn test_trusted_proxy_header_reaches_allowlist() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let interceptor = Interceptor::new("clhr", crawler_allowlist_resolver(), limiter)
            .with_trusted_proxy_headers(true);
        let app = app(interceptor);

        for port in 40000..40005 {
            let peer = format!("10.0.0.1:{}", port);
            let response = app
                .clone()
                .oneshot(request_via(&peer, ("x-forwarded-for", "66.249.80.1"), "/"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, &X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = RateLimitingConfig::default();
        config.namespace = String::new();

        let err = Interceptor::from_config(&config, Arc::new(MemoryStore::new())).unwrap_err();
        assert!(matches!(err, RatewallError::InvalidConfig(_)));
    }
}

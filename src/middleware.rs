use crate::classify::{IdentityExtractor, ScopeRules};
use crate::config::FailurePolicy;
use crate::error::LimiterError;
use crate::limiter::{Decision, RateLimiter, ScopeCheck};
use crate::violation::{emit_best_effort, NullSink, ViolationRecord};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Header carrying whole tokens left on admitted responses.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Violation deliveries allowed in flight at once before new records are dropped.
pub const DEFAULT_MAX_PENDING_VIOLATIONS: usize = 1_024;

#[derive(Debug)]
struct Admission {
    limiter: RateLimiter,
    rules: ScopeRules,
    identity: IdentityExtractor,
    on_backend_error: FailurePolicy,
    emit_permits: Arc<tokio::sync::Semaphore>,
    dropped_violations: Arc<AtomicU64>,
}

/// A layer that gates HTTP requests with a [`RateLimiter`].
///
/// Per request: classify the path into a scope, identify the caller, charge
/// `<scope>:<identifier>`. Denied requests get `429` with `Retry-After` and a JSON body,
/// and a [`ViolationRecord`] is sent to the sink without waiting for it. Admitted
/// requests are forwarded and the response gets `X-RateLimit-Remaining`.
///
/// At most [`DEFAULT_MAX_PENDING_VIOLATIONS`] deliveries run at once; records denied past
/// that are dropped and counted in [`dropped_violations`](Self::dropped_violations).
/// Slow sinks such as file writers are best wrapped in a
/// [`NonBlockingSink`](crate::violation::NonBlockingSink).
#[derive(Clone, Debug)]
pub struct AdmissionLayer<K = NullSink> {
    admission: Arc<Admission>,
    sink: K,
}

impl AdmissionLayer<NullSink> {
    /// Standard routing, `authorization` identity, fail-closed, violations discarded.
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            admission: Arc::new(Admission {
                limiter,
                rules: ScopeRules::standard(),
                identity: IdentityExtractor::default(),
                on_backend_error: FailurePolicy::Closed,
                emit_permits: Arc::new(tokio::sync::Semaphore::new(DEFAULT_MAX_PENDING_VIOLATIONS)),
                dropped_violations: Arc::new(AtomicU64::new(0)),
            }),
            sink: NullSink,
        }
    }
}

impl<K> AdmissionLayer<K> {
    fn map_admission(mut self, f: impl FnOnce(&mut Admission)) -> Self {
        let mut admission = Admission {
            limiter: self.admission.limiter.clone(),
            rules: self.admission.rules.clone(),
            identity: self.admission.identity.clone(),
            on_backend_error: self.admission.on_backend_error,
            emit_permits: self.admission.emit_permits.clone(),
            dropped_violations: self.admission.dropped_violations.clone(),
        };
        f(&mut admission);
        self.admission = Arc::new(admission);
        self
    }

    pub fn with_rules(self, rules: ScopeRules) -> Self {
        self.map_admission(|a| a.rules = rules)
    }

    pub fn with_identity(self, identity: IdentityExtractor) -> Self {
        self.map_admission(|a| a.identity = identity)
    }

    pub fn with_failure_policy(self, policy: FailurePolicy) -> Self {
        self.map_admission(|a| a.on_backend_error = policy)
    }

    /// Bound on violation deliveries in flight (at least 1).
    pub fn with_max_pending_violations(self, max: usize) -> Self {
        self.map_admission(|a| a.emit_permits = Arc::new(tokio::sync::Semaphore::new(max.max(1))))
    }

    /// Send violation records to `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> AdmissionLayer<K2> {
        AdmissionLayer { admission: self.admission, sink }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.admission.limiter
    }

    /// Violation records dropped because too many deliveries were in flight.
    pub fn dropped_violations(&self) -> u64 {
        self.admission.dropped_violations.load(Ordering::Relaxed)
    }
}

impl<S, K: Clone> Layer<S> for AdmissionLayer<K> {
    type Service = AdmissionService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            admission: self.admission.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct AdmissionService<S, K = NullSink> {
    inner: S,
    admission: Arc<Admission>,
    sink: K,
}

impl<S, K, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, K>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: Service<ViolationRecord, Response = ()> + Clone + Send + 'static,
    K::Error: std::error::Error + Send + 'static,
    K::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let admission = self.admission.clone();
        let sink = self.sink.clone();

        let scope = admission.rules.classify(req.uri().path()).to_owned();
        let identifier = admission.identity.identify(&req);

        Box::pin(async move {
            match admission.limiter.check_scope(&scope, &identifier).await {
                Ok(ScopeCheck { decision: Decision::Allowed { remaining }, .. }) => {
                    let mut response = inner.call(req).await?;
                    response
                        .headers_mut()
                        .insert(HeaderName::from_static(X_RATELIMIT_REMAINING), HeaderValue::from(remaining));
                    Ok(response)
                }
                Ok(ScopeCheck { policy, key, .. }) => {
                    tracing::debug!(target: "tollgate::middleware", %key, scope = %scope, "request denied");
                    let record = ViolationRecord::now(
                        scope.as_str(),
                        identifier,
                        req.uri().path(),
                        req.method().as_str(),
                    );
                    match admission.emit_permits.clone().try_acquire_owned() {
                        Ok(permit) => {
                            tokio::spawn(async move {
                                emit_best_effort(sink, record).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            admission.dropped_violations.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(target: "tollgate::violation", scope = %scope, "violation sink backlogged; record dropped");
                        }
                    }
                    Ok(rate_limited(&scope, policy.retry_after_secs()))
                }
                Err(err) => match admission.on_backend_error {
                    FailurePolicy::Open => {
                        tracing::warn!(target: "tollgate::middleware", scope = %scope, error = %err, "limiter unavailable; failing open");
                        inner.call(req).await
                    }
                    FailurePolicy::Closed => {
                        tracing::warn!(target: "tollgate::middleware", scope = %scope, error = %err, "limiter unavailable; failing closed");
                        Ok(backend_unavailable(&err))
                    }
                },
            }
        })
    }
}

fn json_response<B: From<String>>(status: StatusCode, body: serde_json::Value) -> Response<B> {
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn rate_limited<B: From<String>>(scope: &str, retry_after: u64) -> Response<B> {
    let body = serde_json::json!({
        "error": "rate_limited",
        "detail": format!("Rate limit exceeded for {scope}"),
        "scope": scope,
        "retry_after": retry_after,
    });
    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, body);
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn backend_unavailable<B: From<String>>(err: &LimiterError) -> Response<B> {
    let body = serde_json::json!({
        "error": err.reason(),
        "detail": "Rate limiting is temporarily unavailable",
    });
    json_response(StatusCode::SERVICE_UNAVAILABLE, body)
}
